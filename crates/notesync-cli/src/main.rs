use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use notesync_adapters::{
    BoundaryRefresher, BoundingBoxRegionLookup, HttpBoundarySource, HttpIncrementalSource,
    HttpSnapshotSource,
};
use notesync_core::{NoRegionLookup, RegionLookup};
use notesync_storage::{ArtifactStore, LeaseLock, NoteStore, PgStore, RateLimitedFetcher};
use notesync_sync::marker::FailedMarkerFile;
use notesync_sync::{
    alert, build_scheduler, ConfigError, GapReconciler, SyncConfig, SyncError, SyncOrchestrator,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "notesync-cli")]
#[command(about = "Map notes synchronization engine")]
struct Cli {
    /// YAML configuration; defaults to ./notesync.yaml when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run sync cycles at the configured cadence.
    Sync {
        #[arg(long)]
        once: bool,
        /// Also run the gap reconciler on `reconcile_cron`.
        #[arg(long)]
        with_reconciler: bool,
    },
    /// Reconcile the store against the full snapshot now.
    Reconcile,
    /// Download the configured boundary geometries.
    Boundaries,
    /// Remove the failed-execution marker.
    ClearFailed,
    Status,
    Migrate,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_code(&err);
            error!(error = %format!("{err:#}"), exit_code = code, "notesync failed");
            ExitCode::from(code)
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(sync) = err.downcast_ref::<SyncError>() {
        return sync.exit_code() as u8;
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return 2;
    }
    1
}

async fn run(cli: Cli) -> Result<()> {
    let config = SyncConfig::load(cli.config.as_deref())?;

    match cli.command.unwrap_or(Commands::Sync {
        once: false,
        with_reconciler: false,
    }) {
        Commands::Sync {
            once,
            with_reconciler,
        } => sync(config, once, with_reconciler).await,
        Commands::Reconcile => {
            let shutdown = shutdown_channel();
            let store = open_store(&config).await?;
            let reconciler = reconciler(&config, store)?;
            let run = reconciler.run(shutdown).await?;
            println!(
                "reconcile complete: run_id={} inserted={} hidden={} gaps_processed={} manifest={}",
                run.run_id,
                run.report.inserted_record_ids.len(),
                run.report.hidden_record_ids.len(),
                run.report.gaps_processed,
                run.manifest_path.display()
            );
            Ok(())
        }
        Commands::Boundaries => {
            let targets = config.boundary_targets();
            if targets.is_empty() {
                warn!("no boundary_targets configured");
                return Ok(());
            }
            let fetcher = fetcher(&config, "boundaries")?;
            let source = Arc::new(HttpBoundarySource::new(fetcher, config.boundary_url.clone()));
            let refresher =
                BoundaryRefresher::new(source, ArtifactStore::new(config.artifacts_dir.clone()));
            let report = refresher.refresh(&targets).await;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("serializing boundary report")?
            );
            if !report.is_complete() {
                anyhow::bail!(
                    "{} of {} boundaries failed",
                    report.failed.len(),
                    targets.len()
                );
            }
            Ok(())
        }
        Commands::ClearFailed => {
            let marker = FailedMarkerFile::new(config.marker_path());
            match marker.clear()? {
                Some(cleared) => println!(
                    "cleared failed marker: cycle={} stage={} cause={}",
                    cleared.cycle_id, cleared.stage, cleared.cause
                ),
                None => println!("no failed marker at {}", marker.path().display()),
            }
            Ok(())
        }
        Commands::Status => status(&config).await,
        Commands::Migrate => {
            let url = database_url(&config)?;
            let store = PgStore::connect(url).await?;
            store.migrate().await?;
            println!("migrations applied");
            Ok(())
        }
    }
}

async fn sync(config: SyncConfig, once: bool, with_reconciler: bool) -> Result<()> {
    let shutdown = shutdown_channel();
    let store = open_store(&config).await?;
    let fetcher = fetcher(&config, "notes")?;
    let incremental = Arc::new(HttpIncrementalSource::new(
        Arc::clone(&fetcher),
        config.incremental_url.clone(),
        config.incremental_ceiling,
    ));
    let snapshot = Arc::new(HttpSnapshotSource::new(fetcher, config.snapshot_url.clone()));
    let alerts = alert::sink_for(config.alert_webhook_url.as_deref())?;

    let scheduler = if with_reconciler && !once {
        let reconciler = Arc::new(reconciler(&config, Arc::clone(&store))?);
        let sched = build_scheduler(&config.reconcile_cron, reconciler, shutdown.clone()).await?;
        sched.start().await.context("starting scheduler")?;
        info!(cron = %config.reconcile_cron, "reconciler scheduled");
        Some(sched)
    } else {
        None
    };

    let orchestrator = SyncOrchestrator::new(config.clone(), store, incremental, snapshot)
        .with_regions(region_lookup(&config)?)
        .with_alerts(Arc::from(alerts));
    let result = orchestrator.run_loop(once, shutdown).await;

    if let Some(mut sched) = scheduler {
        if let Err(err) = sched.shutdown().await {
            warn!(error = %err, "scheduler shutdown failed");
        }
    }
    result?;
    Ok(())
}

async fn status(config: &SyncConfig) -> Result<()> {
    let store = open_store(config).await?;
    let checkpoint = store.checkpoint().await?;
    let gaps = store.unprocessed_gaps().await?;
    println!(
        "checkpoint: {} (integrity_passed={}, updated_at={})",
        checkpoint.timestamp, checkpoint.integrity_passed, checkpoint.updated_at
    );
    println!("unprocessed gaps: {}", gaps.len());
    for gap in &gaps {
        println!(
            "  {} {} affected={}/{} ({:.2}%) detected_at={}",
            gap.id,
            gap.kind.as_str(),
            gap.affected_count,
            gap.total_count,
            gap.percentage,
            gap.detected_at
        );
    }
    match LeaseLock::read_owner(&config.lock_path())? {
        Some(owner) => println!(
            "lock: held by pid {} on {} ({}) heartbeat {}",
            owner.pid, owner.host, owner.purpose, owner.heartbeat_at
        ),
        None => println!("lock: free"),
    }
    match FailedMarkerFile::new(config.marker_path()).read()? {
        Some(marker) => println!(
            "failed marker: cycle={} stage={} at {}: {}",
            marker.cycle_id, marker.stage, marker.failed_at, marker.cause
        ),
        None => println!("failed marker: none"),
    }
    Ok(())
}

fn database_url(config: &SyncConfig) -> Result<&str, ConfigError> {
    config
        .database_url
        .as_deref()
        .ok_or_else(|| ConfigError::Invalid("DATABASE_URL is not set".into()))
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn NoteStore>> {
    let url = database_url(config)?;
    let store = PgStore::connect(url).await.context("connecting to database")?;
    Ok(Arc::new(store))
}

fn fetcher(config: &SyncConfig, name: &str) -> Result<Arc<RateLimitedFetcher>> {
    let fetcher = RateLimitedFetcher::with_http(
        name,
        &config.http_client_config(),
        config.fetcher_config(),
    )?;
    Ok(Arc::new(fetcher))
}

fn region_lookup(config: &SyncConfig) -> Result<Arc<dyn RegionLookup>> {
    let dir = config
        .boundaries_dir
        .clone()
        .unwrap_or_else(|| config.artifacts_dir.join("boundaries"));
    if !dir.exists() {
        return Ok(Arc::new(NoRegionLookup));
    }
    let lookup = BoundingBoxRegionLookup::load_dir(&dir)?;
    info!(regions = lookup.len(), dir = %dir.display(), "region boxes loaded");
    Ok(Arc::new(lookup))
}

fn reconciler(config: &SyncConfig, store: Arc<dyn NoteStore>) -> Result<GapReconciler> {
    let fetcher = fetcher(config, "snapshot")?;
    let snapshot = Arc::new(HttpSnapshotSource::new(fetcher, config.snapshot_url.clone()));
    Ok(GapReconciler::new(config, store, snapshot).with_regions(region_lookup(config)?))
}

/// Flips to `true` on Ctrl-C.
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing in-flight work");
            let _ = tx.send(true);
        }
    });
    rx
}
