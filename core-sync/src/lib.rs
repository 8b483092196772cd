//! # Sync Module
//!
//! Keeps a root's catalog consistent with the directory tree under it.
//!
//! ## Overview
//!
//! Change notifications are treated as hints. Each one triggers a rescan of the
//! affected subtree, and the result is diffed against the catalog, so missed or
//! duplicated notifications cannot leave the catalog out of step.
//!
//! ## Components
//!
//! - **Path Diff** (`diff`): set difference between catalog and disk
//! - **Scanner** (`scanner`): classifies media and sidecar files below a directory
//! - **Watch Subsystem** (`watcher`): non-recursive OS watches reduced to "directory changed"
//! - **Reconciler** (`reconciler`): applies diffs to the catalog and grows watch coverage
//! - **Pending Tracker** (`pending`): media files with sidecar creation in flight
//! - **Sidecar Workflow** (`sidecar`): bounded pool running the external generator
//! - **Sync Service** (`service`): the single-task event loop and error boundary

pub mod diff;
pub mod error;
pub mod pending;
pub mod reconciler;
pub mod scanner;
pub mod service;
pub mod sidecar;
pub mod watcher;

pub use diff::PathDiff;
pub use error::{Result, SidecarError, SyncError};
pub use pending::{PendingGuard, PendingTracker};
pub use reconciler::{ReconcileReport, Reconciler};
pub use scanner::{DirectorySnapshot, ScanRules};
pub use service::SyncService;
pub use sidecar::{ProcessSidecarGenerator, SidecarGenerator, SidecarOutcome, SidecarWorkflow};
pub use watcher::{DirectoryWatcher, NotifyWatcher};
