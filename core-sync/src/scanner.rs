//! # Directory Scanner
//!
//! Recursive listing of media and sidecar files below a directory.
//!
//! ## Overview
//!
//! A scan produces a [`DirectorySnapshot`]: every recognized media file keyed
//! by its path relative to the root, the media keys that currently have a
//! sidecar next to them, and every directory encountered. Scans are blocking
//! and run on the blocking thread pool.
//!
//! Directories that cannot be listed are recorded rather than treated as
//! empty: their catalog entries are unknown, not deleted. Directories whose
//! names are not valid UTF-8 cannot be keyed and are skipped with their
//! whole subtree.

use crate::error::{Result, SyncError};
use core_catalog::{modified_time_of, EntryKey};
use core_runtime::config::CoreConfig;
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// File classification rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRules {
    /// Lowercase extensions with a leading dot
    media_extensions: Vec<String>,
    sidecar_suffix: String,
}

impl ScanRules {
    pub fn new<I, S>(media_extensions: I, sidecar_suffix: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let media_extensions = media_extensions
            .into_iter()
            .map(|ext| {
                let ext = ext.as_ref().trim().to_ascii_lowercase();
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{}", ext)
                }
            })
            .collect();
        Self {
            media_extensions,
            sidecar_suffix: sidecar_suffix.into(),
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(&config.media_extensions, config.sidecar_suffix.clone())
    }

    pub fn sidecar_suffix(&self) -> &str {
        &self.sidecar_suffix
    }

    /// Whether `name` has a recognized media extension (case-insensitive).
    pub fn is_media(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.media_extensions
            .iter()
            .any(|ext| lower.len() > ext.len() && lower.ends_with(ext.as_str()))
    }

    /// Media file name a sidecar refers to, or `None` if `name` is not a
    /// sidecar.
    pub fn media_name_of_sidecar<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_suffix(self.sidecar_suffix.as_str())
            .filter(|media| !media.is_empty())
    }

    /// Location of the sidecar for a media file.
    pub fn sidecar_path(&self, media: &Path) -> PathBuf {
        let mut path: OsString = media.as_os_str().to_owned();
        path.push(&self.sidecar_suffix);
        PathBuf::from(path)
    }
}

/// State of a directory subtree as observed on disk.
#[derive(Debug, Default, Clone)]
pub struct DirectorySnapshot {
    /// Media files and their modification times
    pub media: HashMap<EntryKey, Option<f64>>,
    /// Keys derived from sidecar names; may include orphans without media
    pub sidecars: HashSet<EntryKey>,
    /// Every directory of the subtree, the scanned one included
    pub directories: Vec<PathBuf>,
    /// Relative paths of directories whose listing failed
    pub unreadable: Vec<String>,
}

impl DirectorySnapshot {
    /// Whether the media file for `key` has a sidecar next to it.
    pub fn has_sidecar(&self, key: &EntryKey) -> bool {
        self.sidecars.contains(key)
    }

    /// Whether `key` lies at or below a directory that could not be listed.
    pub fn is_obscured(&self, key: &EntryKey) -> bool {
        self.unreadable.iter().any(|dir| {
            dir.is_empty()
                || key.relative_directory == *dir
                || key
                    .relative_directory
                    .strip_prefix(dir.as_str())
                    .map_or(false, |rest| rest.starts_with('/'))
        })
    }
}

/// `/`-separated path of `path` relative to `root`; `""` for the root itself.
///
/// Returns `None` if `path` is not below `root` or a component below the root
/// is not valid UTF-8.
pub fn relative_directory(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

/// Walk `directory` recursively and classify what is found.
///
/// Entries that disappear during the walk are skipped. Subdirectories that
/// cannot be listed end up in [`DirectorySnapshot::unreadable`]. Only a
/// failure to read `directory` itself is an error.
pub fn scan_directory(root: &Path, directory: &Path, rules: &ScanRules) -> Result<DirectorySnapshot> {
    let mut snapshot = DirectorySnapshot::default();
    let walker = WalkDir::new(directory)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let keyable = relative_directory(root, entry.path()).is_some();
            if !keyable {
                warn!(path = %entry.path().display(), "Skipping directory with non UTF-8 name");
            }
            keyable
        });

    for item in walker {
        let entry = match item {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                return Err(SyncError::Scan {
                    path: directory.to_path_buf(),
                    message: e.to_string(),
                });
            }
            Err(e) => {
                let vanished = e
                    .io_error()
                    .map_or(false, |io| io.kind() == std::io::ErrorKind::NotFound);
                if !vanished {
                    if let Some(relative) = e.path().and_then(|path| relative_directory(root, path)) {
                        warn!(directory = %relative, error = %e, "Cannot list directory");
                        snapshot.unreadable.push(relative);
                    }
                }
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            snapshot.directories.push(entry.path().to_path_buf());
            continue;
        }
        if !(file_type.is_file() || (file_type.is_symlink() && entry.path().is_file())) {
            continue;
        }

        let Some(name) = entry.file_name().to_str() else {
            warn!(path = %entry.path().display(), "Skipping file with non UTF-8 name");
            continue;
        };
        let Some(parent) = entry
            .path()
            .parent()
            .and_then(|parent| relative_directory(root, parent))
        else {
            continue;
        };

        if let Some(media_name) = rules.media_name_of_sidecar(name) {
            snapshot.sidecars.insert(EntryKey::new(media_name, parent));
        } else if rules.is_media(name) {
            let modified_time = entry.metadata().ok().and_then(|m| modified_time_of(&m));
            snapshot
                .media
                .insert(EntryKey::new(name, parent), modified_time);
        }
    }

    debug!(
        directory = %directory.display(),
        media = snapshot.media.len(),
        sidecars = snapshot.sidecars.len(),
        directories = snapshot.directories.len(),
        unreadable = snapshot.unreadable.len(),
        "Scanned directory"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn rules() -> ScanRules {
        ScanRules::new([".mp4", "mkv", ".AVI"], ".torrent")
    }

    #[test]
    fn test_media_recognition() {
        let rules = rules();
        assert!(rules.is_media("a.mkv"));
        assert!(rules.is_media("B.MP4"));
        assert!(rules.is_media("c.avi"));
        assert!(!rules.is_media("notes.txt"));
        assert!(!rules.is_media(".mkv"));
        assert!(!rules.is_media("a.mkv.torrent"));
    }

    #[test]
    fn test_sidecar_naming() {
        let rules = rules();
        assert_eq!(rules.media_name_of_sidecar("a.mkv.torrent"), Some("a.mkv"));
        assert_eq!(rules.media_name_of_sidecar(".torrent"), None);
        assert_eq!(rules.media_name_of_sidecar("a.mkv"), None);
        assert_eq!(
            rules.sidecar_path(Path::new("/r/a.mkv")),
            PathBuf::from("/r/a.mkv.torrent")
        );
    }

    #[test]
    fn test_relative_directory() {
        let root = Path::new("/srv/media");
        assert_eq!(relative_directory(root, root), Some(String::new()));
        assert_eq!(
            relative_directory(root, Path::new("/srv/media/show/s01")),
            Some("show/s01".to_string())
        );
        assert_eq!(relative_directory(root, Path::new("/srv/other")), None);
    }

    #[test]
    fn test_scan_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("show/s01")).unwrap();
        fs::write(root.join("a.mkv"), b"x").unwrap();
        fs::write(root.join("a.mkv.torrent"), b"x").unwrap();
        fs::write(root.join("orphan.mp4.torrent"), b"x").unwrap();
        fs::write(root.join("readme.txt"), b"x").unwrap();
        fs::write(root.join("show/s01/ep1.MP4"), b"x").unwrap();

        let snapshot = scan_directory(root, root, &rules()).unwrap();

        let mut media: Vec<String> = snapshot.media.keys().map(EntryKey::relative_path).collect();
        media.sort();
        assert_eq!(media, vec!["a.mkv", "show/s01/ep1.MP4"]);
        assert!(snapshot.media.values().all(Option::is_some));

        assert!(snapshot.has_sidecar(&EntryKey::new("a.mkv", "")));
        assert!(snapshot.has_sidecar(&EntryKey::new("orphan.mp4", "")));
        assert!(!snapshot.has_sidecar(&EntryKey::new("ep1.MP4", "show/s01")));
        assert_eq!(snapshot.directories.len(), 3);
    }

    #[test]
    fn test_scan_subdirectory_keys_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("show")).unwrap();
        fs::write(root.join("top.mkv"), b"x").unwrap();
        fs::write(root.join("show/a.mkv"), b"x").unwrap();

        let snapshot = scan_directory(root, &root.join("show"), &rules()).unwrap();

        assert_eq!(snapshot.media.len(), 1);
        assert!(snapshot.media.contains_key(&EntryKey::new("a.mkv", "show")));
        assert_eq!(snapshot.directories, vec![root.join("show")]);
    }

    #[test]
    fn test_obscured_keys() {
        let snapshot = DirectorySnapshot {
            unreadable: vec!["show".to_string()],
            ..Default::default()
        };
        assert!(snapshot.is_obscured(&EntryKey::new("a.mkv", "show")));
        assert!(snapshot.is_obscured(&EntryKey::new("a.mkv", "show/s01")));
        assert!(!snapshot.is_obscured(&EntryKey::new("a.mkv", "shows")));
        assert!(!snapshot.is_obscured(&EntryKey::new("a.mkv", "")));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_directory_is_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let odd = root.join(OsStr::from_bytes(b"caf\xe9"));
        fs::create_dir_all(odd.join("inner")).unwrap();
        fs::write(odd.join("a.mkv"), b"x").unwrap();
        fs::write(odd.join("inner/b.mkv"), b"x").unwrap();
        fs::write(root.join("top.mkv"), b"x").unwrap();

        assert_eq!(relative_directory(root, &odd), None);

        let snapshot = scan_directory(root, root, &rules()).unwrap();
        let media: Vec<String> = snapshot.media.keys().map(EntryKey::relative_path).collect();
        assert_eq!(media, vec!["top.mkv"]);
        assert!(media.iter().all(|path| !path.contains('\u{fffd}')));
        assert_eq!(snapshot.directories, vec![root.to_path_buf()]);
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_subdirectory_is_recorded() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("show")).unwrap();
        fs::write(root.join("show/ep1.mkv"), b"x").unwrap();
        fs::write(root.join("top.mkv"), b"x").unwrap();
        fs::set_permissions(root.join("show"), fs::Permissions::from_mode(0o000)).unwrap();

        // Permission bits do not stop a privileged user
        let privileged = fs::read_dir(root.join("show")).is_ok();
        let snapshot = scan_directory(root, root, &rules());
        fs::set_permissions(root.join("show"), fs::Permissions::from_mode(0o755)).unwrap();
        let snapshot = snapshot.unwrap();
        if privileged {
            return;
        }

        assert_eq!(snapshot.unreadable, vec!["show".to_string()]);
        assert!(snapshot.is_obscured(&EntryKey::new("ep1.mkv", "show")));
        assert!(snapshot.media.contains_key(&EntryKey::new("top.mkv", "")));
    }

    #[test]
    fn test_scan_missing_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        let err = scan_directory(dir.path(), &missing, &rules()).unwrap_err();
        assert!(matches!(err, SyncError::Scan { .. }));
    }
}
