//! gisdash worker - standalone queue poller
//!
//! ```text
//! gisdash-worker run            # poll until SIGINT/SIGTERM
//! gisdash-worker once           # process at most one job, then exit
//! gisdash-worker reap           # fail jobs whose lease lapsed too often
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gisdash_common::logging::{init_logging, LogConfig, LogLevel};
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gisdash_server::{
    config::Config,
    db::{self, jobs::PgJobQueue, DbConfig},
    ingest::{IngestPipeline, PollOutcome, QueuePoller},
    shutdown::cancel_on_signal,
    storage::{config::StorageConfig, Storage},
};

#[derive(Debug, Parser)]
#[command(name = "gisdash-worker", version, about = "Claims and runs gisdash ingestion jobs")]
struct Cli {
    /// Worker id recorded on claimed jobs (defaults to hostname-pid-suffix)
    #[arg(long, env = "WORKER_ID", global = true)]
    worker_id: Option<String>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll the queue until interrupted, draining the in-flight job
    Run,
    /// Process at most one job and exit
    Once,
    /// Fail jobs whose lease lapsed after the maximum number of claims
    Reap,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(level)
        .log_file_prefix("gisdash-worker")
        .filter_directives("sqlx=warn")
        .build();

    let _log_guard = match log_config.merge_env().and_then(|config| init_logging(&config)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialise logging: {}", e);
            process::exit(2);
        },
    };

    if let Err(e) = execute(cli).await {
        error!(error = %e, "Worker command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn build_poller(worker_id: Option<String>) -> Result<QueuePoller> {
    let config = Config::load().context("Failed to load configuration")?;

    let pool = db::create_pool(&DbConfig::from(&config.database))
        .await
        .context("Failed to connect to database")?;
    db::migrate(&pool).await.context("Failed to run migrations")?;

    let storage = Storage::new(StorageConfig::from_env()?).await?;
    let pipeline = IngestPipeline::postgres(config.pipeline.clone(), pool.clone(), Arc::new(storage))?;
    let queue = Arc::new(PgJobQueue::new(pool));

    let poller = QueuePoller::new(queue, Arc::new(pipeline));
    Ok(match worker_id {
        Some(id) => poller.with_worker_id(id),
        None => poller,
    })
}

async fn execute(cli: Cli) -> Result<()> {
    let poller = build_poller(cli.worker_id).await?;

    match cli.command {
        Command::Run => {
            let shutdown = CancellationToken::new();
            let signals = cancel_on_signal(shutdown.clone());
            poller.run(shutdown.clone()).await;
            shutdown.cancel();
            signals.await.context("Signal handler task failed")?;
        },
        Command::Once => match poller.poll_once().await? {
            PollOutcome::Idle => info!("No claimable job"),
            PollOutcome::LostRace { job_id } => info!(%job_id, "Job claimed by another worker"),
            PollOutcome::Processed { job_id, status } => match status {
                Some(status) => info!(%job_id, %status, "Job processed"),
                None => info!(%job_id, "Job processed but ownership was lost"),
            },
        },
        Command::Reap => {
            let reaped = poller.reap().await?;
            info!(count = reaped.len(), "Reaped expired jobs");
        },
    }

    Ok(())
}
