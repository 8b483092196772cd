use core_catalog::CatalogError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("Failed to watch directories: {paths:?}")]
    DirectoryWatchFailed { paths: Vec<PathBuf> },

    #[error("Failed to list directories, their entries were kept: {paths:?}")]
    DirectoriesUnreadable { paths: Vec<PathBuf> },

    #[error("File watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("Failed to scan {}: {message}", path.display())]
    Scan { path: PathBuf, message: String },

    #[error("Root directory not found: {}", .0.display())]
    RootNotFound(PathBuf),

    #[error("No root directory has been registered")]
    RootNotRegistered,

    #[error("{} is outside the registered root {}", path.display(), root.display())]
    DirectoryOutsideRoot { path: PathBuf, root: PathBuf },
}

/// Failures of a single sidecar creation. Returned as worker results, never
/// raised through the reconciliation path.
#[derive(Error, Debug)]
pub enum SidecarError {
    #[error("Sidecar generator executable is not configured")]
    ExecutableNotConfigured,

    #[error("Sidecar generator not found: {}", .0.display())]
    ExecutableMissing(PathBuf),

    #[error("Failed to launch sidecar generator for {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Sidecar for {} did not appear after {attempts} checks", path.display())]
    NotProduced { path: PathBuf, attempts: u32 },

    #[error("Sidecar worker for {} did not complete: {message}", path.display())]
    Aborted { path: PathBuf, message: String },
}

pub type Result<T> = std::result::Result<T, SyncError>;
