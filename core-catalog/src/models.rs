//! Domain models for the media catalog

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::UNIX_EPOCH;

// =============================================================================
// Stage
// =============================================================================

/// Two-stage publish lifecycle of a catalog entry.
///
/// Entries start as `Pending` and only move to `Completed` through an explicit
/// [`crate::RootCatalog::update_stage`] call. Reconciliation never touches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    #[default]
    Pending,
    Completed,
}

impl Stage {
    /// Stored integer representation
    pub fn as_i64(self) -> i64 {
        match self {
            Stage::Pending => 0,
            Stage::Completed => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Stage::Pending),
            1 => Some(Stage::Completed),
            _ => None,
        }
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" | "todo" => Ok(Stage::Pending),
            "completed" | "done" => Ok(Stage::Completed),
            other => Err(format!("Unknown stage: {}", other)),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Pending => write!(f, "pending"),
            Stage::Completed => write!(f, "completed"),
        }
    }
}

// =============================================================================
// Entry Key
// =============================================================================

/// Primary key of a catalog entry: the media file name plus the `/`-separated
/// directory it lives in, relative to the root (`""` for the root itself).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub name: String,
    pub relative_directory: String,
}

impl EntryKey {
    pub fn new(name: impl Into<String>, relative_directory: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            relative_directory: relative_directory.into(),
        }
    }

    /// Split a `/`-separated relative path into directory and file name.
    ///
    /// ```
    /// use core_catalog::EntryKey;
    ///
    /// let key = EntryKey::from_relative_path("show/s01/ep1.mkv").unwrap();
    /// assert_eq!(key.relative_directory, "show/s01");
    /// assert_eq!(key.name, "ep1.mkv");
    /// assert!(EntryKey::from_relative_path("show/").is_none());
    /// ```
    pub fn from_relative_path(relative_path: &str) -> Option<Self> {
        let relative_path = relative_path.trim_start_matches('/');
        let (directory, name) = match relative_path.rsplit_once('/') {
            Some((directory, name)) => (directory, name),
            None => ("", relative_path),
        };
        if name.is_empty() {
            return None;
        }
        Some(Self::new(name, directory))
    }

    /// `/`-separated path relative to the root
    pub fn relative_path(&self) -> String {
        if self.relative_directory.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.relative_directory, self.name)
        }
    }

    /// Location of the media file under `root`
    pub fn absolute_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        for component in self.relative_directory.split('/').filter(|c| !c.is_empty()) {
            path.push(component);
        }
        path.push(&self.name);
        path
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}

// =============================================================================
// Catalog Entry
// =============================================================================

/// One tracked media file.
///
/// `has_sidecar` and `modified_time` are the last observation from disk; only
/// `stage` is owned by the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub relative_directory: String,
    pub has_sidecar: bool,
    pub stage: Stage,
    /// Seconds since the Unix epoch
    pub modified_time: Option<f64>,
}

impl CatalogEntry {
    /// A freshly discovered entry in the `Pending` stage.
    pub fn new(key: EntryKey, has_sidecar: bool, modified_time: Option<f64>) -> Self {
        Self {
            name: key.name,
            relative_directory: key.relative_directory,
            has_sidecar,
            stage: Stage::Pending,
            modified_time,
        }
    }

    pub fn key(&self) -> EntryKey {
        EntryKey::new(self.name.clone(), self.relative_directory.clone())
    }

    pub fn relative_path(&self) -> String {
        self.key().relative_path()
    }

    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let stage: i64 = row.try_get("stage")?;
        let stage = Stage::from_i64(stage).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "stage".to_string(),
            source: format!("unknown stage value {}", stage).into(),
        })?;

        Ok(Self {
            name: row.try_get("name")?,
            relative_directory: row.try_get("relative_directory")?,
            has_sidecar: row.try_get("has_sidecar")?,
            stage,
            modified_time: row.try_get("modified_time")?,
        })
    }
}

// =============================================================================
// Change Set
// =============================================================================

/// All catalog mutations produced by one reconciliation pass.
///
/// Applied atomically by [`crate::RootCatalog::apply`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub inserts: Vec<CatalogEntry>,
    pub removals: Vec<EntryKey>,
    pub sidecar_flags: Vec<(EntryKey, bool)>,
    pub modified_times: Vec<(EntryKey, Option<f64>)>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.removals.is_empty()
            && self.sidecar_flags.is_empty()
            && self.modified_times.is_empty()
    }

    /// Total number of row operations
    pub fn len(&self) -> usize {
        self.inserts.len() + self.removals.len() + self.sidecar_flags.len() + self.modified_times.len()
    }
}

/// Modification time of a file as seconds since the Unix epoch.
pub fn modified_time_of(metadata: &Metadata) -> Option<f64> {
    metadata
        .modified()
        .ok()?
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|elapsed| elapsed.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_codes() {
        assert_eq!(Stage::Pending.as_i64(), 0);
        assert_eq!(Stage::Completed.as_i64(), 1);
        assert_eq!(Stage::from_i64(1), Some(Stage::Completed));
        assert_eq!(Stage::from_i64(7), None);
        assert_eq!(Stage::default(), Stage::Pending);
    }

    #[test]
    fn test_stage_parse() {
        assert_eq!("done".parse::<Stage>().unwrap(), Stage::Completed);
        assert_eq!("Pending".parse::<Stage>().unwrap(), Stage::Pending);
        assert!("published".parse::<Stage>().is_err());
    }

    #[test]
    fn test_key_in_root_directory() {
        let key = EntryKey::from_relative_path("a.mkv").unwrap();
        assert_eq!(key, EntryKey::new("a.mkv", ""));
        assert_eq!(key.relative_path(), "a.mkv");
        assert_eq!(
            key.absolute_path(Path::new("/srv/media")),
            PathBuf::from("/srv/media/a.mkv")
        );
    }

    #[test]
    fn test_nested_key_paths() {
        let key = EntryKey::new("ep1.mkv", "show/s01");
        assert_eq!(key.to_string(), "show/s01/ep1.mkv");
        assert_eq!(
            key.absolute_path(Path::new("/srv/media")),
            PathBuf::from("/srv/media/show/s01/ep1.mkv")
        );
    }

    #[test]
    fn test_new_entry_is_pending() {
        let entry = CatalogEntry::new(EntryKey::new("x.mkv", "d"), true, Some(12.5));
        assert_eq!(entry.stage, Stage::Pending);
        assert!(entry.has_sidecar);
        assert_eq!(entry.key(), EntryKey::new("x.mkv", "d"));
        assert_eq!(entry.relative_path(), "d/x.mkv");
    }

    #[test]
    fn test_change_set_len() {
        let mut changes = ChangeSet::default();
        assert!(changes.is_empty());

        changes.removals.push(EntryKey::new("a.mkv", ""));
        changes.sidecar_flags.push((EntryKey::new("b.mkv", ""), true));
        assert!(!changes.is_empty());
        assert_eq!(changes.len(), 2);
    }
}
