//! # Sync Service
//!
//! The event loop that connects the watch subsystem to the reconciler.
//!
//! ## Overview
//!
//! One task owns the [`Reconciler`] and consumes "directory changed"
//! notifications in arrival order, so reconciliation passes never overlap.
//! Notifications that queue up while a pass runs are drained and deduplicated
//! before the next pass.
//!
//! Failures are reported here and nowhere deeper: they are logged, published as
//! [`CoreEvent::Error`], and the loop keeps running. Watch registrations are
//! left as they were.

use crate::error::Result;
use crate::pending::PendingTracker;
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::sidecar::SidecarWorkflow;
use crate::watcher::DirectoryWatcher;
use core_runtime::events::{CoreEvent, ErrorEvent, EventBus};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct SyncService<W: DirectoryWatcher> {
    reconciler: Reconciler<W>,
    events: mpsc::UnboundedReceiver<PathBuf>,
    sidecars: Option<SidecarWorkflow>,
    pending: PendingTracker,
    event_bus: EventBus,
}

impl<W: DirectoryWatcher> SyncService<W> {
    /// `sidecars` enables automatic sidecar creation for live additions.
    pub fn new(
        reconciler: Reconciler<W>,
        events: mpsc::UnboundedReceiver<PathBuf>,
        sidecars: Option<SidecarWorkflow>,
        event_bus: EventBus,
    ) -> Self {
        let pending = sidecars
            .as_ref()
            .map(|workflow| workflow.pending().clone())
            .unwrap_or_default();
        Self {
            reconciler,
            events,
            sidecars,
            pending,
            event_bus,
        }
    }

    pub fn reconciler(&self) -> &Reconciler<W> {
        &self.reconciler
    }

    pub fn pending(&self) -> &PendingTracker {
        &self.pending
    }

    /// Register `root` and reconcile it in full.
    pub async fn start(&mut self, root: &Path) -> Result<ReconcileReport> {
        let report = self.reconciler.register_root(root).await?;
        if let Some(err) = report.watch_error() {
            self.report("register_root", &err.to_string());
        }
        if let Some(err) = report.scan_error() {
            self.report("register_root", &err.to_string());
        }
        Ok(report)
    }

    /// Process notifications until the watcher's channel closes.
    pub async fn run(&mut self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Process notifications until `shutdown` completes or the channel closes.
    pub async fn run_until<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!("Sync service running");

        loop {
            let first = tokio::select! {
                _ = &mut shutdown => {
                    info!("Sync service shutting down");
                    break;
                }
                received = self.events.recv() => match received {
                    Some(directory) => directory,
                    None => {
                        info!("Watch channel closed, stopping sync service");
                        break;
                    }
                },
            };

            for directory in self.drain_batch(first) {
                self.handle(&directory).await;
            }
        }
    }

    /// `first` plus everything already queued, duplicates removed, order kept.
    fn drain_batch(&mut self, first: PathBuf) -> Vec<PathBuf> {
        let mut batch = vec![first];
        while let Ok(directory) = self.events.try_recv() {
            if !batch.contains(&directory) {
                batch.push(directory);
            }
        }
        if batch.len() > 1 {
            debug!(directories = batch.len(), "Coalesced queued notifications");
        }
        batch
    }

    /// Reconcile one directory, reporting failures instead of returning them.
    pub async fn handle(&mut self, directory: &Path) {
        let report = match self.reconciler.on_directory_event(directory).await {
            Ok(report) => report,
            Err(e) => {
                self.report("reconcile", &e.to_string());
                return;
            }
        };

        if let Some(err) = report.watch_error() {
            self.report("watch", &err.to_string());
        }
        if let Some(err) = report.scan_error() {
            self.report("scan", &err.to_string());
        }

        if report.invalidated {
            self.recover_root().await;
            return;
        }

        self.dispatch_sidecars(report.missing_sidecars);
    }

    fn dispatch_sidecars(&self, media: Vec<PathBuf>) {
        if let Some(workflow) = &self.sidecars {
            if !media.is_empty() {
                // Results arrive as sidecar events; the handle is not awaited
                drop(workflow.dispatch(media));
            }
        }
    }

    /// Re-register the root if it still exists after an invalidation.
    ///
    /// The table was dropped, so every media file without a sidecar comes back
    /// as an addition and is handed to sidecar creation.
    async fn recover_root(&mut self) {
        let Some(root) = self.reconciler.root().map(Path::to_path_buf) else {
            return;
        };
        if !tokio::fs::metadata(&root).await.map(|m| m.is_dir()).unwrap_or(false) {
            warn!(root = %root.display(), "Root is gone, waiting for it to be registered again");
            return;
        }

        info!(root = %root.display(), "Re-registering root after a subdirectory vanished");
        match self.start(&root).await {
            Ok(report) => self.dispatch_sidecars(report.missing_sidecars),
            Err(e) => self.report("register_root", &e.to_string()),
        }
    }

    fn report(&self, operation: &str, message: &str) {
        error!(operation, error = message, "Sync operation failed");
        self.event_bus
            .emit(CoreEvent::Error(ErrorEvent {
                operation: operation.to_string(),
                message: message.to_string(),
            }))
            .ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ScanRules;
    use crate::sidecar::SidecarGenerator;
    use crate::error::SidecarError;
    use async_trait::async_trait;
    use core_catalog::{Catalog, DatabaseConfig, EntryKey};
    use core_runtime::events::{CatalogEvent, SidecarEvent};
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct SetWatcher(BTreeSet<PathBuf>);

    impl DirectoryWatcher for SetWatcher {
        fn add_paths(&mut self, paths: &[PathBuf]) -> Vec<PathBuf> {
            self.0.extend(paths.iter().cloned());
            Vec::new()
        }

        fn remove_paths(&mut self, paths: &[PathBuf]) {
            for path in paths {
                self.0.remove(path);
            }
        }

        fn directories(&self) -> Vec<PathBuf> {
            self.0.iter().cloned().collect()
        }

        fn is_watched(&self, path: &Path) -> bool {
            self.0.contains(path)
        }
    }

    /// Writes the sidecar next to the media file.
    struct WritingGenerator;

    #[async_trait]
    impl SidecarGenerator for WritingGenerator {
        async fn generate(&self, media: &Path) -> std::result::Result<PathBuf, SidecarError> {
            let sidecar = ScanRules::new([".mkv"], ".torrent").sidecar_path(media);
            tokio::fs::write(&sidecar, b"d8:announce0:e")
                .await
                .map_err(|source| SidecarError::Spawn {
                    path: media.to_path_buf(),
                    source,
                })?;
            Ok(sidecar)
        }
    }

    async fn service(
        sidecars: bool,
        bus: &EventBus,
    ) -> (SyncService<SetWatcher>, mpsc::UnboundedSender<PathBuf>) {
        let catalog = Catalog::open(DatabaseConfig::in_memory()).await.unwrap();
        let rules = ScanRules::new([".mkv"], ".torrent");
        let reconciler = Reconciler::new(catalog, SetWatcher::default(), rules, bus.clone());
        let workflow = sidecars.then(|| {
            SidecarWorkflow::new(Arc::new(WritingGenerator), PendingTracker::new(), 2, bus.clone())
        });
        let (tx, rx) = mpsc::unbounded_channel();
        (SyncService::new(reconciler, rx, workflow, bus.clone()), tx)
    }

    #[tokio::test]
    async fn test_loop_reconciles_queued_events_and_stops_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let bus = EventBus::new(64);
        let (mut service, tx) = service(false, &bus).await;
        service.start(&root).await.unwrap();

        std::fs::write(root.join("a.mkv"), b"x").unwrap();
        tx.send(root.clone()).unwrap();
        tx.send(root.clone()).unwrap();
        drop(tx);

        let mut events = bus.subscribe();
        service.run().await;

        let table = service.reconciler().root_catalog().unwrap();
        assert_eq!(table.count().await.unwrap(), 1);

        // Duplicate notifications were coalesced into one pass
        let mut table_changed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CoreEvent::Catalog(CatalogEvent::TableChanged { .. })) {
                table_changed += 1;
            }
        }
        assert_eq!(table_changed, 1);
    }

    #[tokio::test]
    async fn test_errors_are_reported_and_loop_continues() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let bus = EventBus::new(64);
        let mut events = bus.subscribe();
        let (mut service, tx) = service(false, &bus).await;
        service.start(&root).await.unwrap();

        std::fs::write(root.join("b.mkv"), b"x").unwrap();
        tx.send(PathBuf::from("/definitely/not/below/root")).unwrap();
        tx.send(root.clone()).unwrap();
        drop(tx);
        service.run().await;

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::Error(ErrorEvent { operation, .. }) = event {
                assert_eq!(operation, "reconcile");
                saw_error = true;
            }
        }
        assert!(saw_error);
        let table = service.reconciler().root_catalog().unwrap();
        assert!(table.get(&EntryKey::new("b.mkv", "")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidated_root_is_registered_again() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("show")).unwrap();
        std::fs::write(root.join("top.mkv"), b"x").unwrap();
        std::fs::write(root.join("show/ep.mkv"), b"x").unwrap();

        let bus = EventBus::new(64);
        let (mut service, _tx) = service(false, &bus).await;
        service.start(&root).await.unwrap();

        std::fs::remove_dir_all(root.join("show")).unwrap();
        service.handle(&root.join("show")).await;

        assert!(!service.reconciler().is_invalidated());
        let table = service.reconciler().root_catalog().unwrap();
        assert!(table.exists().await.unwrap());
        assert_eq!(table.count().await.unwrap(), 1);
        assert!(!service.reconciler().watcher().is_watched(&root.join("show")));
    }

    #[tokio::test]
    async fn test_recovery_dispatches_media_added_in_same_burst() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("show")).unwrap();
        let bus = EventBus::new(64);
        let (mut service, _tx) = service(true, &bus).await;
        service.start(&root).await.unwrap();

        std::fs::remove_dir_all(root.join("show")).unwrap();
        let media = root.join("arrived.mkv");
        std::fs::write(&media, b"x").unwrap();
        service.handle(&root.join("show")).await;

        assert!(!service.reconciler().is_invalidated());
        tokio::time::timeout(Duration::from_secs(5), async {
            while !root.join("arrived.mkv.torrent").exists() || service.pending().contains(&media) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sidecar was not created after recovery");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_directory_is_reported_and_kept() {
        use core_catalog::Stage;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::create_dir(root.join("show")).unwrap();
        std::fs::write(root.join("show/ep1.mkv"), b"x").unwrap();
        let bus = EventBus::new(64);
        let mut events = bus.subscribe();
        let (mut service, _tx) = service(false, &bus).await;
        service.start(&root).await.unwrap();

        let key = EntryKey::new("ep1.mkv", "show");
        let table = service.reconciler().root_catalog().unwrap().clone();
        table.update_stage(&[key.clone()], Stage::Completed).await.unwrap();

        let locked = root.join("show");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        let privileged = std::fs::read_dir(&locked).is_ok();
        service.handle(&root).await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        if privileged {
            return;
        }

        let entry = table.get(&key).await.unwrap().expect("entry was removed");
        assert_eq!(entry.stage, Stage::Completed);

        let mut saw_scan_error = false;
        while let Ok(event) = events.try_recv() {
            if let CoreEvent::Error(ErrorEvent { operation, .. }) = event {
                saw_scan_error |= operation == "scan";
            }
        }
        assert!(saw_scan_error);

        // Readable again: nothing to change, the stage survives
        service.handle(&root).await;
        let entry = table.get(&key).await.unwrap().unwrap();
        assert_eq!(entry.stage, Stage::Completed);
    }

    #[tokio::test]
    async fn test_auto_create_dispatches_missing_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let bus = EventBus::new(64);
        let mut events = bus.subscribe();
        let (mut service, _tx) = service(true, &bus).await;
        service.start(&root).await.unwrap();

        let media = root.join("new.mkv");
        std::fs::write(&media, b"x").unwrap();
        service.handle(&root).await;

        let created = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(CoreEvent::Sidecar(SidecarEvent::Created { sidecar, .. })) = events.recv().await {
                    return sidecar;
                }
            }
        })
        .await
        .expect("sidecar was not created");

        assert_eq!(PathBuf::from(created), root.join("new.mkv.torrent"));
        tokio::time::timeout(Duration::from_secs(5), async {
            while service.pending().contains(&media) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pending entry was not cleared");

        // The next pass picks up the new sidecar
        service.handle(&root).await;
        let table = service.reconciler().root_catalog().unwrap();
        let entry = table.get(&EntryKey::new("new.mkv", "")).await.unwrap().unwrap();
        assert!(entry.has_sidecar);
    }
}
