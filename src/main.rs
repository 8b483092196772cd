use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use core_catalog::{CatalogEntry, EntryKey, Stage};
use core_runtime::config::CoreConfig;
use core_runtime::events::EventBus;
use core_runtime::logging::{init_logging, LogFormat, LogLevel, LoggingConfig};
use core_sync::{PendingTracker, ProcessSidecarGenerator, SidecarWorkflow};
use futures::TryStreamExt;
use sidecar_sync::{build_service, open_catalog, resolve_root};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "sidecar-sync")]
#[command(about = "Keep a catalog of media files and their sidecars in sync with a directory tree")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Minimum log level
    #[arg(long, global = true, default_value = "info")]
    log_level: LogLevel,
    /// Log output format (pretty, json, compact)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the root and keep the catalog in sync until interrupted
    Watch {
        /// Root directory, overrides the configuration
        #[arg(short, long)]
        root: Option<PathBuf>,
    },
    /// Reconcile the root once and exit
    Scan {
        #[arg(short, long)]
        root: Option<PathBuf>,
    },
    /// List catalog entries of the root
    List {
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Only entries in this stage (pending, completed)
        #[arg(short, long)]
        stage: Option<Stage>,
    },
    /// Move entries to a stage
    Mark {
        /// Target stage (pending, completed)
        stage: Stage,
        /// Media paths relative to the root
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(short, long)]
        root: Option<PathBuf>,
    },
    /// Run the sidecar generator for media files and wait for the results
    Make {
        /// Media paths relative to the root
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Pass the generator's silent flag regardless of the configuration
        #[arg(short, long)]
        silent: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::default().with_level(cli.log_level);
    if let Some(format) = cli.log_format {
        logging = logging.with_format(format);
    }
    init_logging(logging)?;

    let config = match &cli.config {
        Some(path) => CoreConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => CoreConfig::default(),
    };

    match cli.command {
        Commands::Watch { root } => watch(&config, root).await,
        Commands::Scan { root } => scan(&config, root).await,
        Commands::List { root, stage } => list(&config, root, stage).await,
        Commands::Mark { stage, paths, root } => mark(&config, root, stage, &paths).await,
        Commands::Make { paths, root, silent } => make(&config, root, &paths, silent).await,
    }
}

async fn watch(config: &CoreConfig, root: Option<PathBuf>) -> Result<()> {
    let root = resolve_root(root, config).context("cannot resolve root")?;
    let catalog = open_catalog(config).await?;
    let event_bus = EventBus::new(config.event_buffer_size);
    let mut service = build_service(config, catalog.clone(), event_bus)?;

    let report = service.start(&root).await?;
    info!(
        root = %root.display(),
        added = report.media_added.len(),
        removed = report.media_removed.len(),
        "Initial reconciliation complete"
    );

    service
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await;

    drop(service);
    catalog.close().await;
    Ok(())
}

async fn scan(config: &CoreConfig, root: Option<PathBuf>) -> Result<()> {
    let root = resolve_root(root, config).context("cannot resolve root")?;
    let catalog = open_catalog(config).await?;
    let mut service = build_service(config, catalog.clone(), EventBus::new(config.event_buffer_size))?;

    let report = service.start(&root).await?;
    println!(
        "{}: {} added, {} removed, {} sidecars found, {} sidecars lost, {} without sidecar",
        root.display(),
        report.media_added.len(),
        report.media_removed.len(),
        report.sidecars_added.len(),
        report.sidecars_removed.len(),
        report.missing_sidecars.len(),
    );
    if let Some(err) = report.watch_error() {
        println!("warning: {}", err);
    }

    drop(service);
    catalog.close().await;
    Ok(())
}

async fn list(config: &CoreConfig, root: Option<PathBuf>, stage: Option<Stage>) -> Result<()> {
    let root = resolve_root(root, config).context("cannot resolve root")?;
    let catalog = open_catalog(config).await?;
    let table = catalog.root(&root);
    if !table.exists().await? {
        bail!("{} has not been scanned yet", root.display());
    }

    let entries: Vec<CatalogEntry> = match stage {
        Some(stage) => table.select_by_stage(stage).try_collect().await?,
        None => table.select_all().try_collect().await?,
    };
    for entry in &entries {
        let sidecar = if entry.has_sidecar { "sidecar" } else { "-" };
        println!("{:<9} {:<7} {}", entry.stage.to_string(), sidecar, entry.relative_path());
    }

    catalog.close().await;
    Ok(())
}

async fn mark(config: &CoreConfig, root: Option<PathBuf>, stage: Stage, paths: &[String]) -> Result<()> {
    let root = resolve_root(root, config).context("cannot resolve root")?;
    let keys = parse_keys(paths)?;
    let catalog = open_catalog(config).await?;
    let table = catalog.root(&root);
    if !table.exists().await? {
        bail!("{} has not been scanned yet", root.display());
    }

    let updated = table.update_stage(&keys, stage).await?;
    println!("{} of {} entries marked {}", updated, keys.len(), stage);

    catalog.close().await;
    Ok(())
}

async fn make(config: &CoreConfig, root: Option<PathBuf>, paths: &[String], silent: bool) -> Result<()> {
    let root = resolve_root(root, config).context("cannot resolve root")?;
    let media: Vec<PathBuf> = parse_keys(paths)?
        .iter()
        .map(|key| key.absolute_path(&root))
        .collect();

    let generator = ProcessSidecarGenerator::from_config(config)?.with_silent(silent || config.sidecar.silent);
    let workflow = SidecarWorkflow::new(
        Arc::new(generator),
        PendingTracker::new(),
        config.sidecar.max_workers,
        EventBus::new(config.event_buffer_size),
    );

    let outcomes = workflow.dispatch(media).await?;
    let mut failed = 0;
    for outcome in &outcomes {
        match &outcome.result {
            Ok(sidecar) => println!("created {}", sidecar.display()),
            Err(e) => {
                failed += 1;
                println!("failed  {}: {}", outcome.media.display(), e);
            }
        }
    }
    if failed > 0 {
        bail!("{} of {} sidecars could not be created", failed, outcomes.len());
    }
    Ok(())
}

fn parse_keys(paths: &[String]) -> Result<Vec<EntryKey>> {
    paths
        .iter()
        .map(|path| {
            EntryKey::from_relative_path(path).with_context(|| format!("not a file path: {:?}", path))
        })
        .collect()
}
