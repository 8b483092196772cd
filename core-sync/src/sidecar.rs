//! # Sidecar Creation
//!
//! Background creation of sidecar files by an external generator.
//!
//! ## Overview
//!
//! - [`SidecarGenerator`] is the seam to the external tool: given a media
//!   path, produce its sidecar or fail.
//! - [`ProcessSidecarGenerator`] runs `<executable> -m <media> [-s]` and polls
//!   for the sidecar with a fixed number of attempts.
//! - [`SidecarWorkflow`] runs generators on a bounded worker pool and keeps the
//!   [`PendingTracker`] accurate: every dispatched path is marked pending
//!   before `dispatch` returns and cleared when its worker ends, however it
//!   ends.

use crate::error::SidecarError;
use crate::pending::PendingTracker;
use async_trait::async_trait;
use core_runtime::config::{CoreConfig, SidecarConfig};
use core_runtime::events::{CoreEvent, EventBus, SidecarEvent};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

// ============================================================================
// Generator
// ============================================================================

#[async_trait]
pub trait SidecarGenerator: Send + Sync {
    /// Create the sidecar for `media`. Returns the sidecar path once it exists.
    async fn generate(&self, media: &Path) -> Result<PathBuf, SidecarError>;
}

/// Runs the configured generator executable as a subprocess.
#[derive(Debug, Clone)]
pub struct ProcessSidecarGenerator {
    executable: PathBuf,
    silent: bool,
    sidecar_suffix: String,
    poll_attempts: u32,
    poll_interval: Duration,
}

impl ProcessSidecarGenerator {
    pub fn new(executable: impl Into<PathBuf>, sidecar_suffix: impl Into<String>, config: &SidecarConfig) -> Self {
        Self {
            executable: executable.into(),
            silent: config.silent,
            sidecar_suffix: sidecar_suffix.into(),
            poll_attempts: config.poll_attempts,
            poll_interval: config.poll_interval(),
        }
    }

    /// # Errors
    ///
    /// [`SidecarError::ExecutableNotConfigured`] if no executable is set.
    pub fn from_config(config: &CoreConfig) -> Result<Self, SidecarError> {
        let executable = config
            .sidecar
            .executable
            .clone()
            .ok_or(SidecarError::ExecutableNotConfigured)?;
        Ok(Self::new(executable, config.sidecar_suffix.clone(), &config.sidecar))
    }

    /// Override the silent flag, e.g. for an interactive one-off run.
    pub fn with_silent(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    fn sidecar_path(&self, media: &Path) -> PathBuf {
        let mut path = media.as_os_str().to_owned();
        path.push(&self.sidecar_suffix);
        PathBuf::from(path)
    }

    fn command(&self, media: &Path) -> Command {
        let mut command = Command::new(&self.executable);
        command.arg("-m").arg(media);
        if self.silent {
            command.arg("-s");
        }
        command.stdin(Stdio::null());
        command
    }

    async fn wait_for(&self, sidecar: &Path) -> bool {
        for attempt in 1..=self.poll_attempts {
            if matches!(tokio::fs::try_exists(sidecar).await, Ok(true)) {
                debug!(attempt, "Sidecar present");
                return true;
            }
            if attempt < self.poll_attempts {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        false
    }
}

#[async_trait]
impl SidecarGenerator for ProcessSidecarGenerator {
    #[instrument(skip(self, media), fields(media = %media.display()))]
    async fn generate(&self, media: &Path) -> Result<PathBuf, SidecarError> {
        if !matches!(tokio::fs::try_exists(&self.executable).await, Ok(true)) {
            return Err(SidecarError::ExecutableMissing(self.executable.clone()));
        }

        let status = self
            .command(media)
            .status()
            .await
            .map_err(|source| SidecarError::Spawn {
                path: media.to_path_buf(),
                source,
            })?;
        if !status.success() {
            // The tool may still have written the sidecar; polling decides
            warn!(%status, "Sidecar generator exited unsuccessfully");
        }

        let sidecar = self.sidecar_path(media);
        if self.wait_for(&sidecar).await {
            Ok(sidecar)
        } else {
            Err(SidecarError::NotProduced {
                path: media.to_path_buf(),
                attempts: self.poll_attempts,
            })
        }
    }
}

// ============================================================================
// Workflow
// ============================================================================

/// Result of one dispatched sidecar creation.
#[derive(Debug)]
pub struct SidecarOutcome {
    pub media: PathBuf,
    pub result: Result<PathBuf, SidecarError>,
}

impl SidecarOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Bounded pool of sidecar creation workers.
#[derive(Clone)]
pub struct SidecarWorkflow {
    generator: Arc<dyn SidecarGenerator>,
    pending: PendingTracker,
    permits: Arc<Semaphore>,
    event_bus: EventBus,
}

impl SidecarWorkflow {
    pub fn new(
        generator: Arc<dyn SidecarGenerator>,
        pending: PendingTracker,
        max_workers: usize,
        event_bus: EventBus,
    ) -> Self {
        Self {
            generator,
            pending,
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            event_bus,
        }
    }

    pub fn pending(&self) -> &PendingTracker {
        &self.pending
    }

    /// Start sidecar creation for every path.
    ///
    /// All paths are pending when this returns. Dropping or aborting the
    /// returned handle abandons the results but not the workers, which still
    /// clear their pending entries.
    pub fn dispatch(&self, paths: Vec<PathBuf>) -> JoinHandle<Vec<SidecarOutcome>> {
        info!(count = paths.len(), "Dispatching sidecar creation");

        let workers: Vec<(PathBuf, JoinHandle<Result<PathBuf, SidecarError>>)> = paths
            .into_iter()
            .map(|media| {
                let guard = self.pending.track(media.clone());
                let generator = Arc::clone(&self.generator);
                let permits = Arc::clone(&self.permits);
                let event_bus = self.event_bus.clone();
                let worker = tokio::spawn(async move {
                    // Held until the worker ends, even if its result is never collected
                    let media = guard.path().to_path_buf();
                    let _permit = permits.acquire_owned().await.map_err(|e| SidecarError::Aborted {
                        path: media.clone(),
                        message: e.to_string(),
                    })?;
                    run_one(generator.as_ref(), &media, &event_bus).await
                });
                (media, worker)
            })
            .collect();

        tokio::spawn(async move {
            let (media, handles): (Vec<PathBuf>, Vec<_>) = workers.into_iter().unzip();
            join_all(handles)
                .await
                .into_iter()
                .zip(media)
                .map(|(joined, media)| {
                    let result = joined.unwrap_or_else(|e| {
                        Err(SidecarError::Aborted {
                            path: media.clone(),
                            message: e.to_string(),
                        })
                    });
                    SidecarOutcome { media, result }
                })
                .collect()
        })
    }
}

async fn run_one(
    generator: &dyn SidecarGenerator,
    media: &Path,
    event_bus: &EventBus,
) -> Result<PathBuf, SidecarError> {
    let path = media.display().to_string();
    event_bus
        .emit(CoreEvent::Sidecar(SidecarEvent::Started { path: path.clone() }))
        .ok();

    let result = generator.generate(media).await;
    match &result {
        Ok(sidecar) => {
            info!(media = %path, sidecar = %sidecar.display(), "Sidecar created");
            event_bus
                .emit(CoreEvent::Sidecar(SidecarEvent::Created {
                    path,
                    sidecar: sidecar.display().to_string(),
                }))
                .ok();
        }
        Err(e) => {
            warn!(media = %path, error = %e, "Sidecar creation failed");
            event_bus
                .emit(CoreEvent::Sidecar(SidecarEvent::Failed {
                    path,
                    message: e.to_string(),
                }))
                .ok();
        }
    }
    result
}

impl std::fmt::Debug for SidecarWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarWorkflow")
            .field("pending", &self.pending.len())
            .field("available_workers", &self.permits.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_runtime::events::EventStream;
    use mockall::mock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    mock! {
        Generator {}

        #[async_trait]
        impl SidecarGenerator for Generator {
            async fn generate(&self, media: &Path) -> Result<PathBuf, SidecarError>;
        }
    }

    fn workflow(generator: impl SidecarGenerator + 'static, workers: usize) -> (SidecarWorkflow, EventBus) {
        let bus = EventBus::new(64);
        let workflow = SidecarWorkflow::new(Arc::new(generator), PendingTracker::new(), workers, bus.clone());
        (workflow, bus)
    }

    #[tokio::test]
    async fn test_success_clears_pending_and_reports() {
        let mut generator = MockGenerator::new();
        generator
            .expect_generate()
            .times(2)
            .returning(|media| Ok(PathBuf::from(format!("{}.torrent", media.display()))));
        let (workflow, bus) = workflow(generator, 2);
        let mut created = EventStream::new(bus.subscribe())
            .filter(|e| matches!(e, CoreEvent::Sidecar(SidecarEvent::Created { .. })));

        let handle = workflow.dispatch(vec![PathBuf::from("/r/x.mkv"), PathBuf::from("/r/y.mkv")]);
        assert!(workflow.pending().contains(Path::new("/r/x.mkv")));
        assert!(workflow.pending().contains(Path::new("/r/y.mkv")));

        let outcomes = handle.await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(SidecarOutcome::is_success));
        assert_eq!(outcomes[0].media, PathBuf::from("/r/x.mkv"));
        assert!(workflow.pending().is_empty());
        assert!(created.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_still_clears_pending() {
        let mut generator = MockGenerator::new();
        generator.expect_generate().returning(|media| {
            Err(SidecarError::NotProduced {
                path: media.to_path_buf(),
                attempts: 3,
            })
        });
        let (workflow, bus) = workflow(generator, 1);
        let mut failed = EventStream::new(bus.subscribe())
            .filter(|e| matches!(e, CoreEvent::Sidecar(SidecarEvent::Failed { .. })));

        let outcomes = workflow.dispatch(vec![PathBuf::from("/r/a.mkv")]).await.unwrap();

        assert!(matches!(
            outcomes[0].result,
            Err(SidecarError::NotProduced { attempts: 3, .. })
        ));
        assert!(workflow.pending().is_empty());
        assert!(failed.recv().await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_dispatch_clears_pending() {
        let mut generator = MockGenerator::new();
        generator
            .expect_generate()
            .returning(|media| Ok(media.to_path_buf()));
        let (workflow, _bus) = workflow(generator, 1);

        let handle = workflow.dispatch(vec![PathBuf::from("/r/a.mkv")]);
        handle.abort();

        // Workers are independent of the aborted collector
        tokio::time::timeout(Duration::from_secs(5), async {
            while !workflow.pending().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pending entry was never cleared");
    }

    struct CountingGenerator {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl SidecarGenerator for Arc<CountingGenerator> {
        async fn generate(&self, media: &Path) -> Result<PathBuf, SidecarError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(media.to_path_buf())
        }
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let counter = Arc::new(CountingGenerator {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let (workflow, _bus) = workflow(Arc::clone(&counter), 2);

        let paths = (0..6).map(|i| PathBuf::from(format!("/r/{}.mkv", i))).collect();
        let outcomes = workflow.dispatch(paths).await.unwrap();

        assert_eq!(outcomes.len(), 6);
        assert!(counter.peak.load(Ordering::SeqCst) <= 2);
    }

    /// Each call waits for one permit from `gate`.
    struct GatedGenerator {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl SidecarGenerator for GatedGenerator {
        async fn generate(&self, media: &Path) -> Result<PathBuf, SidecarError> {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            Ok(media.to_path_buf())
        }
    }

    #[tokio::test]
    async fn test_redispatched_path_stays_pending_until_last_worker() {
        let gate = Arc::new(Semaphore::new(0));
        let (workflow, _bus) = workflow(GatedGenerator { gate: Arc::clone(&gate) }, 2);
        let media = PathBuf::from("/r/a.mkv");

        let first = workflow.dispatch(vec![media.clone()]);
        let second = workflow.dispatch(vec![media.clone()]);

        gate.add_permits(1);
        let (done, _, remaining) = futures::future::select_all(vec![first, second]).await;
        assert!(done.unwrap()[0].is_success());
        assert!(workflow.pending().contains(&media));

        gate.add_permits(1);
        futures::future::join_all(remaining).await;
        assert!(workflow.pending().is_empty());
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let config = SidecarConfig::default();
        let generator = ProcessSidecarGenerator::new("/definitely/not/here", ".torrent", &config);
        let err = generator.generate(Path::new("/r/a.mkv")).await.unwrap_err();
        assert!(matches!(err, SidecarError::ExecutableMissing(_)));
    }

    #[test]
    fn test_unconfigured_executable() {
        let config = CoreConfig::default();
        assert!(matches!(
            ProcessSidecarGenerator::from_config(&config),
            Err(SidecarError::ExecutableNotConfigured)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_generator_invocation() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let media = dir.path().join("a.mkv");
        std::fs::write(&media, b"x").unwrap();
        let args_file = dir.path().join("args.txt");

        // Records its arguments, then writes "<media>.torrent"
        let script = dir.path().join("generator.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" > '{}'\ntouch \"$2.torrent\"\n",
                args_file.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let config = SidecarConfig {
            silent: true,
            poll_attempts: 20,
            poll_interval_ms: 50,
            ..SidecarConfig::default()
        };
        let generator = ProcessSidecarGenerator::new(&script, ".torrent", &config);

        let sidecar = generator.generate(&media).await.unwrap();
        assert_eq!(sidecar, dir.path().join("a.mkv.torrent"));

        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(args.trim(), format!("-m {} -s", media.display()));

        // A generator that never writes the sidecar exhausts its attempts
        let lazy = ProcessSidecarGenerator::new(&script, ".never", &SidecarConfig {
            poll_attempts: 2,
            poll_interval_ms: 1,
            ..SidecarConfig::default()
        });
        let err = lazy.generate(&media).await.unwrap_err();
        assert!(matches!(err, SidecarError::NotProduced { attempts: 2, .. }));
    }
}
