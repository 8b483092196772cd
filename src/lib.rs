//! # Sidecar Sync
//!
//! Host crate that wires the workspace crates into a running engine.
//!
//! ## Overview
//!
//! - `core-runtime`: configuration, logging, event bus
//! - `core-catalog`: SQLite catalog with one table per root
//! - `core-sync`: scanning, watching, reconciliation and sidecar workers
//!
//! The catalog is opened once per process and handed to the service, which
//! owns it until shutdown.

pub use core_catalog;
pub use core_runtime;
pub use core_sync;

use core_catalog::{Catalog, DatabaseConfig};
use core_runtime::config::CoreConfig;
use core_runtime::events::EventBus;
use core_sync::{
    NotifyWatcher, PendingTracker, ProcessSidecarGenerator, Reconciler, ScanRules, SidecarWorkflow,
    SyncService,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Open the catalog database named by `config`.
pub async fn open_catalog(config: &CoreConfig) -> core_catalog::Result<Catalog> {
    info!(database = %config.database_path.display(), "Opening catalog");
    Catalog::open(DatabaseConfig::new(&config.database_path)).await
}

/// Sidecar workers for live additions, when enabled and usable.
pub fn sidecar_workflow(config: &CoreConfig, event_bus: &EventBus) -> Option<SidecarWorkflow> {
    if !config.sidecar.auto_create {
        return None;
    }
    match ProcessSidecarGenerator::from_config(config) {
        Ok(generator) => Some(SidecarWorkflow::new(
            Arc::new(generator),
            PendingTracker::new(),
            config.sidecar.max_workers,
            event_bus.clone(),
        )),
        Err(e) => {
            warn!(error = %e, "Automatic sidecar creation disabled");
            None
        }
    }
}

/// Build a service backed by the platform file watcher.
pub fn build_service(
    config: &CoreConfig,
    catalog: Catalog,
    event_bus: EventBus,
) -> core_sync::Result<SyncService<NotifyWatcher>> {
    let (watcher, events) = NotifyWatcher::new()?;
    let reconciler = Reconciler::new(catalog, watcher, ScanRules::from_config(config), event_bus.clone());
    let sidecars = sidecar_workflow(config, &event_bus);
    Ok(SyncService::new(reconciler, events, sidecars, event_bus))
}

/// The root to operate on: the explicit one if given, else the configured one.
///
/// Returned canonicalized, matching the path catalog tables are keyed by.
pub fn resolve_root(explicit: Option<PathBuf>, config: &CoreConfig) -> std::io::Result<PathBuf> {
    let root = explicit.or_else(|| config.root.clone()).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "no root given on the command line or in the configuration",
        )
    })?;
    std::fs::canonicalize(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_runtime::config::SidecarConfig;

    #[test]
    fn test_resolve_root_prefers_explicit() {
        let configured = tempfile::tempdir().unwrap();
        let explicit = tempfile::tempdir().unwrap();
        let config = CoreConfig::builder().root(configured.path()).build().unwrap();

        let root = resolve_root(Some(explicit.path().to_path_buf()), &config).unwrap();
        assert_eq!(root, explicit.path().canonicalize().unwrap());

        let root = resolve_root(None, &config).unwrap();
        assert_eq!(root, configured.path().canonicalize().unwrap());
    }

    #[test]
    fn test_resolve_root_requires_a_root() {
        let err = resolve_root(None, &CoreConfig::default()).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_sidecar_workflow_needs_executable() {
        let bus = EventBus::new(8);
        let disabled = CoreConfig::builder()
            .sidecar(SidecarConfig {
                auto_create: false,
                ..SidecarConfig::default()
            })
            .build()
            .unwrap();
        assert!(sidecar_workflow(&disabled, &bus).is_none());

        let no_executable = CoreConfig::default();
        assert!(no_executable.sidecar.executable.is_none());
        assert!(sidecar_workflow(&no_executable, &bus).is_none());

        let enabled = CoreConfig::builder()
            .sidecar(SidecarConfig {
                executable: Some(PathBuf::from("/usr/bin/true")),
                ..SidecarConfig::default()
            })
            .build()
            .unwrap();
        assert!(sidecar_workflow(&enabled, &bus).is_some());
    }

    #[tokio::test]
    async fn test_build_service_and_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.mkv"), b"x").unwrap();
        let config = CoreConfig::default();
        let catalog = Catalog::open(DatabaseConfig::in_memory()).await.unwrap();

        let mut service = build_service(&config, catalog, EventBus::new(16)).unwrap();
        let report = service.start(dir.path()).await.unwrap();

        assert_eq!(report.media_added.len(), 1);
        assert_eq!(report.missing_sidecars.len(), 1);
    }
}
