//! # Watch Subsystem
//!
//! OS-level directory change notification.
//!
//! ## Overview
//!
//! Each registered directory is watched non-recursively; the reconciler
//! registers every subdirectory it discovers. Raw notifications are reduced to
//! "directory X changed" and delivered on an unbounded channel to the service
//! loop, which owns all reconciliation.

use crate::error::Result;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Registration interface of the watch subsystem.
pub trait DirectoryWatcher: Send {
    /// Watch `paths`. Returns the paths that could not be watched; all others
    /// are registered.
    fn add_paths(&mut self, paths: &[PathBuf]) -> Vec<PathBuf>;

    /// Stop watching `paths`. Unknown paths are ignored.
    fn remove_paths(&mut self, paths: &[PathBuf]);

    /// Currently watched directories, sorted.
    fn directories(&self) -> Vec<PathBuf>;

    fn is_watched(&self, path: &Path) -> bool;
}

type WatchedSet = Arc<Mutex<HashSet<PathBuf>>>;

fn lock(set: &WatchedSet) -> MutexGuard<'_, HashSet<PathBuf>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

/// [`DirectoryWatcher`] backed by the platform's `notify` watcher.
pub struct NotifyWatcher {
    watcher: RecommendedWatcher,
    watched: WatchedSet,
}

impl NotifyWatcher {
    /// Create a watcher and the receiving end of its change events.
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<PathBuf>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let watched: WatchedSet = Arc::default();
        let handler_watched = Arc::clone(&watched);

        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                for directory in changed_directories(&event, &handler_watched) {
                    trace!(directory = %directory.display(), kind = ?event.kind, "Directory changed");
                    // Receiver gone means the service stopped
                    let _ = tx.send(directory);
                }
            }
            Err(e) => warn!(error = %e, "File watcher error"),
        })?;

        Ok((Self { watcher, watched }, rx))
    }
}

/// Directories affected by one notification.
///
/// A path that is itself watched maps to itself, anything else to its parent
/// if that is watched. A watched directory that was removed is forgotten so a
/// later directory with the same path gets registered again.
fn changed_directories(event: &Event, watched: &WatchedSet) -> Vec<PathBuf> {
    if matches!(event.kind, EventKind::Access(_)) {
        return Vec::new();
    }

    let mut set = lock(watched);
    let mut directories: Vec<PathBuf> = Vec::new();
    for path in &event.paths {
        let directory = if set.contains(path) {
            if matches!(event.kind, EventKind::Remove(_)) && !path.exists() {
                set.remove(path);
            }
            Some(path.clone())
        } else {
            path.parent()
                .filter(|parent| set.contains(*parent))
                .map(Path::to_path_buf)
        };
        if let Some(directory) = directory {
            if !directories.contains(&directory) {
                directories.push(directory);
            }
        }
    }
    directories
}

impl DirectoryWatcher for NotifyWatcher {
    fn add_paths(&mut self, paths: &[PathBuf]) -> Vec<PathBuf> {
        let mut failed = Vec::new();
        for path in paths {
            if self.is_watched(path) {
                continue;
            }
            match self.watcher.watch(path, RecursiveMode::NonRecursive) {
                Ok(()) => {
                    lock(&self.watched).insert(path.clone());
                    debug!(path = %path.display(), "Watching directory");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to watch directory");
                    failed.push(path.clone());
                }
            }
        }
        failed
    }

    fn remove_paths(&mut self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = self.watcher.unwatch(path) {
                // Already gone from the OS side, e.g. the directory was deleted
                debug!(path = %path.display(), error = %e, "Unwatch failed");
            }
            lock(&self.watched).remove(path);
        }
    }

    fn directories(&self) -> Vec<PathBuf> {
        let mut directories: Vec<PathBuf> = lock(&self.watched).iter().cloned().collect();
        directories.sort();
        directories
    }

    fn is_watched(&self, path: &Path) -> bool {
        lock(&self.watched).contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::time::Duration;

    fn watched(paths: &[&str]) -> WatchedSet {
        Arc::new(Mutex::new(paths.iter().map(PathBuf::from).collect()))
    }

    #[test]
    fn test_file_event_maps_to_parent() {
        let set = watched(&["/r", "/r/show"]);
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/r/show/a.mkv"))
            .add_path(PathBuf::from("/r/b.mkv"));

        assert_eq!(
            changed_directories(&event, &set),
            vec![PathBuf::from("/r/show"), PathBuf::from("/r")]
        );
    }

    #[test]
    fn test_watched_directory_maps_to_itself() {
        let set = watched(&["/r", "/r/show"]);
        let event = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("/r/show"));
        assert_eq!(changed_directories(&event, &set), vec![PathBuf::from("/r/show")]);
    }

    #[test]
    fn test_removed_directory_is_forgotten() {
        let set = watched(&["/nonexistent-root", "/nonexistent-root/show"]);
        let event = Event::new(EventKind::Remove(RemoveKind::Folder))
            .add_path(PathBuf::from("/nonexistent-root/show"));

        assert_eq!(
            changed_directories(&event, &set),
            vec![PathBuf::from("/nonexistent-root/show")]
        );
        assert!(!lock(&set).contains(Path::new("/nonexistent-root/show")));
    }

    #[test]
    fn test_unrelated_and_access_events_are_dropped() {
        let set = watched(&["/r"]);
        let elsewhere = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/x/a.mkv"));
        let access = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/r/a.mkv"));

        assert!(changed_directories(&elsewhere, &set).is_empty());
        assert!(changed_directories(&access, &set).is_empty());
    }

    #[tokio::test]
    async fn test_notify_watcher_registration() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let (mut watcher, _events) = NotifyWatcher::new().unwrap();

        let failed = watcher.add_paths(&[dir.path().to_path_buf(), missing.clone()]);

        assert_eq!(failed, vec![missing]);
        assert_eq!(watcher.directories(), vec![dir.path().to_path_buf()]);

        watcher.remove_paths(&[dir.path().to_path_buf()]);
        assert!(watcher.directories().is_empty());
    }

    #[tokio::test]
    async fn test_notify_watcher_delivers_directory_events() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let (mut watcher, mut events) = NotifyWatcher::new().unwrap();
        assert!(watcher.add_paths(&[root.clone()]).is_empty());

        std::fs::write(root.join("a.mkv"), b"x").unwrap();

        let changed = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("no watch event within timeout")
            .unwrap();
        assert_eq!(changed, root);
    }
}
