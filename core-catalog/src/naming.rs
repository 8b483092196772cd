//! Table naming for catalog roots.
//!
//! Every root gets its own table. The table name is derived from the absolute
//! root path: ASCII letters and digits are kept, every other character
//! (including `_`) becomes `_<hex code point>_`. Because `_` only ever appears
//! as an escape delimiter, the mapping is injective and can be decoded back to
//! the root path.

use std::fmt::Write;
use std::path::{Path, PathBuf};

/// Prefix shared by all catalog tables
pub const TABLE_PREFIX: &str = "catalog_";

/// Table name for the given root.
///
/// ```
/// use core_catalog::naming::table_name_for_root;
/// use std::path::Path;
///
/// assert_eq!(table_name_for_root(Path::new("/srv/a.b")), "catalog__2f_srv_2f_a_2e_b");
/// ```
pub fn table_name_for_root(root: &Path) -> String {
    let raw = root.to_string_lossy();
    let mut name = String::with_capacity(TABLE_PREFIX.len() + raw.len() * 2);
    name.push_str(TABLE_PREFIX);
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c);
        } else {
            // Writing to a String cannot fail
            let _ = write!(name, "_{:x}_", c as u32);
        }
    }
    name
}

/// Recover the root path from a catalog table name.
///
/// Returns `None` for tables that were not produced by [`table_name_for_root`].
pub fn root_from_table_name(table: &str) -> Option<PathBuf> {
    let encoded = table.strip_prefix(TABLE_PREFIX)?;
    let mut decoded = String::with_capacity(encoded.len());
    let mut chars = encoded.chars();

    while let Some(c) = chars.next() {
        if c.is_ascii_alphanumeric() {
            decoded.push(c);
            continue;
        }
        if c != '_' {
            return None;
        }
        let hex: String = chars.by_ref().take_while(|&h| h != '_').collect();
        let code = u32::from_str_radix(&hex, 16).ok()?;
        decoded.push(char::from_u32(code)?);
    }

    if decoded.is_empty() {
        return None;
    }
    Some(PathBuf::from(decoded))
}

/// Quote an identifier for embedding in SQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
