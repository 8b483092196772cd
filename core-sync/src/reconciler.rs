//! # Reconciler
//!
//! Turns "this directory may have changed" into catalog mutations and keeps
//! watch coverage of the whole root.
//!
//! ## Overview
//!
//! Every pass is listing-based: the subtree below the changed directory is
//! scanned from disk, diffed against what the catalog holds for that subtree,
//! and the difference is applied in one transaction. Running a pass twice with
//! no change on disk computes empty diffs, so duplicate, coalesced or late
//! notifications are harmless.
//!
//! ## Root lifecycle
//!
//! ```text
//! register_root ──> watching ──(watched directory vanished)──> invalidated
//!       ^                                                          │
//!       └──────────────────────────────────────────────────────────┘
//! ```
//!
//! An invalidated root has no table; events are ignored until the root is
//! registered again.

use crate::diff::PathDiff;
use crate::error::{Result, SyncError};
use crate::scanner::{relative_directory, scan_directory, DirectorySnapshot, ScanRules};
use crate::watcher::DirectoryWatcher;
use core_catalog::{Catalog, CatalogEntry, ChangeSet, EntryKey, RootCatalog};
use core_runtime::events::{CatalogEvent, CoreEvent, EventBus, WatchEvent};
use futures::TryStreamExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};

/// What one reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Absolute paths of inserted media files
    pub media_added: Vec<PathBuf>,
    /// Absolute paths of removed media files, stale entries included
    pub media_removed: Vec<PathBuf>,
    /// Media files whose sidecar appeared
    pub sidecars_added: Vec<PathBuf>,
    /// Media files whose sidecar disappeared
    pub sidecars_removed: Vec<PathBuf>,
    /// Inserted media files that have no sidecar yet
    pub missing_sidecars: Vec<PathBuf>,
    pub mtimes_updated: usize,
    /// Directories that could not be watched
    pub watch_failures: Vec<PathBuf>,
    /// Directories that could not be listed; entries below them were left as is
    pub unreadable: Vec<PathBuf>,
    /// The root's table was dropped because a watched directory vanished
    pub invalidated: bool,
}

impl ReconcileReport {
    /// Whether the catalog was modified.
    pub fn changed_catalog(&self) -> bool {
        !self.media_added.is_empty()
            || !self.media_removed.is_empty()
            || !self.sidecars_added.is_empty()
            || !self.sidecars_removed.is_empty()
            || self.mtimes_updated > 0
    }

    /// Partial watch registration failure, if any.
    pub fn watch_error(&self) -> Option<SyncError> {
        if self.watch_failures.is_empty() {
            None
        } else {
            Some(SyncError::DirectoryWatchFailed {
                paths: self.watch_failures.clone(),
            })
        }
    }

    /// Directories skipped because they could not be listed, if any.
    pub fn scan_error(&self) -> Option<SyncError> {
        if self.unreadable.is_empty() {
            None
        } else {
            Some(SyncError::DirectoriesUnreadable {
                paths: self.unreadable.clone(),
            })
        }
    }

    fn absorb(&mut self, other: ReconcileReport) {
        self.media_added.extend(other.media_added);
        self.media_removed.extend(other.media_removed);
        self.sidecars_added.extend(other.sidecars_added);
        self.sidecars_removed.extend(other.sidecars_removed);
        self.missing_sidecars.extend(other.missing_sidecars);
        self.mtimes_updated += other.mtimes_updated;
        self.watch_failures.extend(other.watch_failures);
        self.unreadable.extend(other.unreadable);
        self.invalidated |= other.invalidated;
    }
}

#[derive(Debug)]
struct RegisteredRoot {
    path: PathBuf,
    table: RootCatalog,
    invalidated: bool,
}

/// Owns the watch registrations and applies directory diffs to the catalog.
///
/// Not shared: the service loop drives it one event at a time.
pub struct Reconciler<W: DirectoryWatcher> {
    catalog: Catalog,
    watcher: W,
    rules: ScanRules,
    event_bus: EventBus,
    root: Option<RegisteredRoot>,
}

impl<W: DirectoryWatcher> Reconciler<W> {
    pub fn new(catalog: Catalog, watcher: W, rules: ScanRules, event_bus: EventBus) -> Self {
        Self {
            catalog,
            watcher,
            rules,
            event_bus,
            root: None,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn watcher(&self) -> &W {
        &self.watcher
    }

    pub fn rules(&self) -> &ScanRules {
        &self.rules
    }

    /// The registered root, if any.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_ref().map(|root| root.path.as_path())
    }

    /// Table handle of the registered root.
    pub fn root_catalog(&self) -> Option<&RootCatalog> {
        self.root.as_ref().map(|root| &root.table)
    }

    pub fn is_invalidated(&self) -> bool {
        self.root.as_ref().map_or(false, |root| root.invalidated)
    }

    /// Make `root` the tracked root and bring its catalog in line with disk.
    ///
    /// Replaces every existing watch, ensures the table, purges entries whose
    /// files vanished, then reconciles the full subtree while registering
    /// every directory. No catalog events are emitted for this bulk pass.
    #[instrument(skip(self, root), fields(root = %root.display()))]
    pub async fn register_root(&mut self, root: &Path) -> Result<ReconcileReport> {
        let root = match tokio::fs::canonicalize(root).await {
            Ok(path) if path.is_dir() => path,
            _ => return Err(SyncError::RootNotFound(root.to_path_buf())),
        };

        let previous = self.watcher.directories();
        self.watcher.remove_paths(&previous);

        let table = self.catalog.root(&root);
        table.ensure_schema().await?;
        self.root = Some(RegisteredRoot {
            path: root.clone(),
            table: table.clone(),
            invalidated: false,
        });

        let mut report = ReconcileReport {
            watch_failures: self.watcher.add_paths(std::slice::from_ref(&root)),
            ..Default::default()
        };

        let purged = table.purge_stale_entries().await?;
        report
            .media_removed
            .extend(purged.iter().map(|key| key.absolute_path(&root)));

        let pass = self.reconcile(&root, false).await?;
        report.absorb(pass);

        if !report.watch_failures.is_empty() {
            self.emit_watch_failures(&report.watch_failures);
        }

        info!(
            media_added = report.media_added.len(),
            media_removed = report.media_removed.len(),
            watched = self.watcher.directories().len(),
            "Root registered"
        );
        Ok(report)
    }

    /// Reconcile `directory` after a live change notification.
    ///
    /// # Errors
    ///
    /// - [`SyncError::RootNotRegistered`] before [`Self::register_root`]
    /// - [`SyncError::DirectoryOutsideRoot`] for paths outside the root
    /// - catalog and scan failures
    #[instrument(skip(self, directory), fields(directory = %directory.display()))]
    pub async fn on_directory_event(&mut self, directory: &Path) -> Result<ReconcileReport> {
        let root = self.root.as_ref().ok_or(SyncError::RootNotRegistered)?;
        if root.invalidated {
            debug!("Root invalidated, ignoring event");
            return Ok(ReconcileReport::default());
        }
        if !directory.starts_with(&root.path) {
            return Err(SyncError::DirectoryOutsideRoot {
                path: directory.to_path_buf(),
                root: root.path.clone(),
            });
        }

        let report = self.reconcile(directory, true).await?;
        if !report.watch_failures.is_empty() {
            self.emit_watch_failures(&report.watch_failures);
        }
        Ok(report)
    }

    async fn reconcile(&mut self, directory: &Path, live: bool) -> Result<ReconcileReport> {
        let Some(root) = self.root.as_mut() else {
            return Err(SyncError::RootNotRegistered);
        };
        let root_path = root.path.clone();
        let table = root.table.clone();

        if !tokio::fs::metadata(directory)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            warn!(
                directory = %directory.display(),
                root = %root_path.display(),
                "Watched directory vanished, dropping root catalog"
            );
            table.drop_schema().await?;
            root.invalidated = true;
            self.watcher.remove_paths(&[directory.to_path_buf()]);
            self.emit(CatalogEvent::RootInvalidated {
                root: root_path.display().to_string(),
                missing: directory.display().to_string(),
            });
            return Ok(ReconcileReport {
                invalidated: true,
                ..Default::default()
            });
        }

        if !directory.starts_with(&root_path) {
            return Err(SyncError::DirectoryOutsideRoot {
                path: directory.to_path_buf(),
                root: root_path,
            });
        }
        let Some(prefix) = relative_directory(&root_path, directory) else {
            warn!(directory = %directory.display(), "Directory name is not valid UTF-8, skipping");
            return Ok(ReconcileReport::default());
        };

        let snapshot = {
            let root_path = root_path.clone();
            let scanned = directory.to_path_buf();
            let rules = self.rules.clone();
            tokio::task::spawn_blocking(move || scan_directory(&root_path, &scanned, &rules))
                .await
                .map_err(|e| SyncError::Scan {
                    path: directory.to_path_buf(),
                    message: e.to_string(),
                })??
        };

        let existing: Vec<CatalogEntry> = table.select_recursive(&prefix).try_collect().await?;
        let (changes, mut report) = plan(&root_path, &existing, &snapshot);
        table.apply(&changes).await?;
        if !report.unreadable.is_empty() {
            warn!(
                directories = report.unreadable.len(),
                "Kept entries of directories that could not be listed"
            );
        }

        let new_directories: Vec<PathBuf> = snapshot
            .directories
            .into_iter()
            .filter(|dir| !self.watcher.is_watched(dir))
            .collect();
        if !new_directories.is_empty() {
            debug!(count = new_directories.len(), "Registering new directories");
            report.watch_failures = self.watcher.add_paths(&new_directories);
        }

        if live && report.changed_catalog() {
            self.emit_changes(&root_path, &report);
        }
        Ok(report)
    }

    fn emit(&self, event: CatalogEvent) {
        self.event_bus.emit(CoreEvent::Catalog(event)).ok();
    }

    fn emit_changes(&self, root: &Path, report: &ReconcileReport) {
        let root = root.display().to_string();
        let strings = |paths: &[PathBuf]| paths.iter().map(|p| p.display().to_string()).collect();

        self.emit(CatalogEvent::TableChanged { root: root.clone() });
        if !report.media_added.is_empty() {
            self.emit(CatalogEvent::MediaAdded {
                root: root.clone(),
                paths: strings(&report.media_added),
            });
        }
        if !report.sidecars_added.is_empty() {
            self.emit(CatalogEvent::SidecarAdded {
                root: root.clone(),
                paths: strings(&report.sidecars_added),
            });
        }
        if !report.sidecars_removed.is_empty() {
            self.emit(CatalogEvent::SidecarRemoved {
                root,
                paths: strings(&report.sidecars_removed),
            });
        }
    }

    fn emit_watch_failures(&self, paths: &[PathBuf]) {
        warn!(count = paths.len(), "Some directories could not be watched");
        self.event_bus
            .emit(CoreEvent::Watch(WatchEvent::RegistrationFailed {
                paths: paths.iter().map(|p| p.display().to_string()).collect(),
            }))
            .ok();
    }
}

/// Compute the change set for a subtree from its catalog rows and a fresh scan.
fn plan(root: &Path, existing: &[CatalogEntry], snapshot: &DirectorySnapshot) -> (ChangeSet, ReconcileReport) {
    let mut changes = ChangeSet::default();
    let mut report = ReconcileReport::default();

    let media = PathDiff::compute(existing.iter().map(CatalogEntry::key), snapshot.media.keys().cloned());

    let mut added: Vec<&EntryKey> = media.added.iter().collect();
    added.sort();
    for key in added {
        let has_sidecar = snapshot.has_sidecar(key);
        let path = key.absolute_path(root);
        if !has_sidecar {
            report.missing_sidecars.push(path.clone());
        }
        report.media_added.push(path);
        let modified_time = snapshot.media.get(key).copied().flatten();
        changes
            .inserts
            .push(CatalogEntry::new(key.clone(), has_sidecar, modified_time));
    }

    // Absent from an unreadable listing is not the same as deleted
    let mut removed: Vec<EntryKey> = media
        .removed
        .into_iter()
        .filter(|key| !snapshot.is_obscured(key))
        .collect();
    removed.sort();
    report
        .media_removed
        .extend(removed.iter().map(|key| key.absolute_path(root)));
    changes.removals = removed;

    // Sidecar flags of entries that stay; inserted ones were probed above
    let surviving: Vec<&CatalogEntry> = existing
        .iter()
        .filter(|entry| snapshot.media.contains_key(&entry.key()))
        .collect();
    let flagged_before = surviving.iter().filter(|e| e.has_sidecar).map(|e| e.key());
    let flagged_now: HashSet<EntryKey> = surviving
        .iter()
        .map(|e| e.key())
        .filter(|key| snapshot.has_sidecar(key))
        .collect();
    let sidecars = PathDiff::compute(flagged_before, flagged_now);

    let mut gained: Vec<EntryKey> = sidecars.added.into_iter().collect();
    gained.sort();
    let mut lost: Vec<EntryKey> = sidecars.removed.into_iter().collect();
    lost.sort();
    for key in gained {
        report.sidecars_added.push(key.absolute_path(root));
        changes.sidecar_flags.push((key, true));
    }
    for key in lost {
        report.sidecars_removed.push(key.absolute_path(root));
        changes.sidecar_flags.push((key, false));
    }

    for entry in surviving {
        let key = entry.key();
        let observed = snapshot.media.get(&key).copied().flatten();
        if observed != entry.modified_time {
            changes.modified_times.push((key, observed));
        }
    }
    report.mtimes_updated = changes.modified_times.len();
    report.unreadable = snapshot
        .unreadable
        .iter()
        .map(|dir| {
            if dir.is_empty() {
                root.to_path_buf()
            } else {
                root.join(dir)
            }
        })
        .collect();

    (changes, report)
}
