//! Media files with sidecar creation in flight.
//!
//! Shared between the service loop, which adds paths when it dispatches work,
//! and the sidecar workers, which clear them on completion. Consumers query it
//! to show an "in progress" state instead of a missing sidecar.
//!
//! Paths are counted: a path dispatched twice stays pending until both
//! workers are done.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Thread-safe counted set of absolute media paths. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct PendingTracker {
    paths: Arc<Mutex<HashMap<PathBuf, usize>>>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, usize>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add<I>(&self, paths: I)
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut counts = self.lock();
        for path in paths {
            *counts.entry(path).or_insert(0) += 1;
        }
    }

    /// Release one claim on each path.

    pub fn remove<'a, I>(&self, paths: I)
    where
        I: IntoIterator<Item = &'a PathBuf>,
    {
        let mut counts = self.lock();
        for path in paths {
            if let Some(count) = counts.get_mut(path) {
                *count -= 1;
                if *count == 0 {
                    counts.remove(path);
                }
            }
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sorted copy of the current set
    pub fn snapshot(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Mark `path` pending until the returned guard is dropped.
    pub fn track(&self, path: PathBuf) -> PendingGuard {
        *self.lock().entry(path.clone()).or_insert(0) += 1;
        PendingGuard {
            tracker: self.clone(),
            path,
        }
    }
}

/// Removes its path from the tracker when dropped, whether the work it guards
/// finished, failed, panicked or was abandoned.
#[derive(Debug)]
pub struct PendingGuard {
    tracker: PendingTracker,
    path: PathBuf,
}

impl PendingGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.tracker.remove([&self.path]);
    }
}
