//! # Media Catalog Module
//!
//! Persistent store of tracked media files and their sidecar state.
//!
//! ## Overview
//!
//! This module manages:
//! - The SQLite connection pool backing the catalog file
//! - One table per watched root, named by an injective escaping of the root path
//! - Transactional batch writes and lazy, restartable selection queries
//! - Maintenance passes (stale entry purge, modified-time refresh)

pub mod catalog;
pub mod db;
pub mod error;
pub mod models;
pub mod naming;

pub use catalog::{Catalog, RootCatalog};
pub use db::{DatabaseConfig, DatabaseLocation};
pub use error::{CatalogError, Result};
pub use models::{modified_time_of, CatalogEntry, ChangeSet, EntryKey, Stage};
