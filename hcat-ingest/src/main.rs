//! hcat-ingest - Catalog ingestion pipeline
//!
//! Subcommands:
//! - `serve`: HTTP service (REST + SSE) with a commit worker pool
//! - `run --job <id> | --session <id>`: commit a job in this process,
//!   streaming progress; exits 1 if the job ends `failed`
//! - `status`, `cancel`, `rollback`: job maintenance
//! - `cleanup`: delete expired terminal sessions

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hcat_common::config::{resolve_root_folder, RootFolderInitializer, TomlConfig};
use hcat_common::events::{EventBus, IngestEvent};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use hcat_ingest::capabilities::{Capabilities, FsAssetStore, SqliteCatalog};
use hcat_ingest::config::IngestSettings;
use hcat_ingest::models::JobStatus;
use hcat_ingest::services::{StartOutcome, TaskQueue, WorkerQueue};
use hcat_ingest::{AppState, Pipeline};

const ROOT_FOLDER_ENV: &str = "HCAT_ROOT_FOLDER";
const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:5740";
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Exit code when `run` did not execute the job (already running elsewhere)
const EXIT_NOT_RUN: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "hcat-ingest")]
#[command(about = "Staged catalog ingestion pipeline")]
#[command(version)]
struct Cli {
    /// Root folder holding databases, assets and manifests
    #[arg(long, global = true)]
    root_folder: Option<PathBuf>,

    /// TOML config file (default: HCAT_CONFIG, then the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP service
    Serve {
        /// Listen address (default: TOML bind_address, then 127.0.0.1:5740)
        #[arg(long, env = "HCAT_BIND_ADDRESS")]
        bind: Option<String>,
    },
    /// Commit a job in this process and stream its progress
    Run(RunTarget),
    /// Print a job's status, counts and error log
    Status {
        #[arg(long)]
        job: Uuid,
    },
    /// Request cancellation of a queued or running job
    Cancel {
        #[arg(long)]
        job: Uuid,
    },
    /// Revert everything a job committed
    Rollback {
        #[arg(long)]
        job: Uuid,
    },
    /// Delete terminal sessions past the retention window
    Cleanup,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct RunTarget {
    /// Existing queued job
    #[arg(long)]
    job: Option<Uuid>,
    /// Previewed session; a new job is created for it
    #[arg(long)]
    session: Option<Uuid>,
}

/// Opened databases, stores and services
struct Runtime {
    db: sqlx::SqlitePool,
    pipeline: Pipeline,
    event_bus: EventBus,
    settings: IngestSettings,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let toml = hcat_common::config::load_toml_config_or_default(cli.config.as_deref());
    init_tracing(&toml)?;

    let runtime = open_runtime(&cli, &toml).await?;

    match cli.command {
        Command::Serve { bind } => {
            let bind = bind
                .or_else(|| toml.bind_address.clone())
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());
            serve(runtime, &bind).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Run(target) => run(runtime, target).await,
        Command::Status { job } => {
            let job = runtime.pipeline.runner.status(job).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
            println!("outcome: {}", job.outcome());
            Ok(ExitCode::SUCCESS)
        }
        Command::Cancel { job } => {
            let job = runtime.pipeline.runner.cancel(job).await?;
            println!("job {} is {} (cancellation requested)", job.id, job.status);
            Ok(ExitCode::SUCCESS)
        }
        Command::Rollback { job } => {
            let report = runtime.pipeline.runner.rollback(job).await?;
            println!(
                "job {}: {} records reverted, {} failures, status {}",
                report.job_id,
                report.reverted_records,
                report.failures.len(),
                report.status
            );
            for failure in &report.failures {
                println!(
                    "  row {} (record {}): {}",
                    failure.row_index, failure.record_id, failure.message
                );
            }
            Ok(if report.failures.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Cleanup => {
            let deleted = runtime.pipeline.sessions.cleanup_expired().await?;
            println!("{} expired sessions deleted", deleted.len());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// RUST_LOG, else TOML `[logging] level`; optional log file
fn init_tracing(toml: &TomlConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", toml.logging.level)));

    match &toml.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

async fn open_runtime(cli: &Cli, toml: &TomlConfig) -> Result<Runtime> {
    let root = resolve_root_folder(cli.root_folder.as_deref(), ROOT_FOLDER_ENV, toml);
    let initializer = RootFolderInitializer::new(root);
    initializer
        .ensure_directory_exists()
        .map_err(|e| anyhow::anyhow!("Failed to initialize root folder: {}", e))?;
    info!("Root folder: {}", initializer.root().display());

    let settings = IngestSettings::resolve(&toml.ingest);

    let db = hcat_ingest::db::init_database_pool(&initializer.database_path())
        .await
        .context("Failed to open pipeline database")?;
    let catalog = SqliteCatalog::open(&initializer.catalog_database_path())
        .await
        .context("Failed to open catalog database")?;
    let assets = FsAssetStore::new(initializer.asset_dir());
    let caps = Capabilities::with_defaults(Arc::new(catalog), Arc::new(assets));

    let event_bus = EventBus::new(settings.event_capacity);
    let pipeline = Pipeline::new(
        db.clone(),
        caps,
        settings.clone(),
        event_bus.clone(),
        initializer.manifest_dir(),
    );

    Ok(Runtime {
        db,
        pipeline,
        event_bus,
        settings,
    })
}

// ============================================================================
// serve
// ============================================================================

async fn serve(runtime: Runtime, bind: &str) -> Result<()> {
    info!("Starting hcat-ingest v{} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));

    let runner = runtime.pipeline.runner.clone();
    let interrupted = runner.recover_interrupted().await?;
    if interrupted > 0 {
        warn!(interrupted, "Jobs interrupted by the previous shutdown were marked failed");
    }

    let shutdown = CancellationToken::new();
    let queue = Arc::new(WorkerQueue::start(
        runner.clone(),
        runtime.settings.worker_count,
        shutdown.clone(),
    ));

    for job_id in runner.queued_jobs().await? {
        info!(job_id = %job_id, "Re-dispatching queued job");
        queue.enqueue(job_id).await?;
    }

    let sessions = runtime.pipeline.sessions.clone();
    let cleanup_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cleanup_shutdown.cancelled() => break,
                _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                    if let Err(e) = sessions.cleanup_expired().await {
                        error!(error = %e, "Session cleanup failed");
                    }
                }
            }
        }
    });

    let state = AppState::new(
        runtime.db,
        runtime.pipeline,
        queue.clone() as Arc<dyn TaskQueue>,
        runtime.event_bus,
    );
    let app = hcat_ingest::build_router(state);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;
    info!("Listening on http://{}", bind);
    info!("Health check: http://{}/health", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Waiting for running commits to finish");
    shutdown.cancel();
    match Arc::try_unwrap(queue) {
        Ok(queue) => queue.join().await,
        Err(_) => warn!("Worker pool still referenced; not waiting for workers"),
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received terminate signal, shutting down"),
    }
}

// ============================================================================
// run
// ============================================================================

async fn run(runtime: Runtime, target: RunTarget) -> Result<ExitCode> {
    let job_id = match (target.job, target.session) {
        (Some(job_id), _) => job_id,
        (None, Some(session_id)) => {
            let job = runtime.pipeline.sessions.create_job(session_id).await?;
            println!("created job {} for session {}", job.id, session_id);
            job.id
        }
        (None, None) => anyhow::bail!("either --job or --session is required"),
    };

    let printer = tokio::spawn(print_progress(runtime.event_bus.subscribe(), job_id));

    let outcome = runtime.pipeline.runner.run(job_id).await;
    if tokio::time::timeout(Duration::from_secs(1), printer).await.is_err() {
        warn!("Progress printer did not drain in time");
    }

    match outcome? {
        StartOutcome::AlreadyRunning => {
            println!("job {} is already running", job_id);
            Ok(ExitCode::from(EXIT_NOT_RUN))
        }
        StartOutcome::Finished(job) => {
            println!(
                "job {} {}: {} records, {} assets, {} errors",
                job.id,
                job.outcome(),
                job.created_records,
                job.created_assets,
                job.error_count
            );
            if let Some(manifest) = &job.manifest_ref {
                println!("manifest: {}", manifest);
            }
            Ok(if job.status == JobStatus::Failed {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            })
        }
    }
}

/// One line per progress event of `job_id`, until it finishes
async fn print_progress(
    mut rx: tokio::sync::broadcast::Receiver<IngestEvent>,
    job_id: Uuid,
) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        };
        if event.job_id() != Some(job_id) {
            continue;
        }
        match event {
            IngestEvent::JobStarted { .. } => println!("started"),
            IngestEvent::JobProgress {
                processed,
                total,
                created_records,
                error_count,
                ..
            } => println!(
                "[{}/{}] records={} errors={}",
                processed, total, created_records, error_count
            ),
            IngestEvent::RowFailed {
                row_index,
                stage,
                message,
                ..
            } => println!("row {} failed at {}: {}", row_index, stage, message),
            IngestEvent::JobFinished { status, .. } => {
                println!("finished: {}", status);
                return;
            }
            _ => {}
        }
    }
}
