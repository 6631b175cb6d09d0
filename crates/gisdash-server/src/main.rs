//! gisdash server - Main entry point

use anyhow::{Context, Result};
use gisdash_common::logging::{init_logging, LogConfig};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

use gisdash_server::{
    api,
    config::Config,
    db::{self, jobs::PgJobQueue, DbConfig},
    features::FeatureState,
    ingest::{IngestPipeline, JobQueue, QueuePoller},
    shutdown::shutdown_signal,
    storage::{config::StorageConfig, Storage},
};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("gisdash-server")
        .filter_directives("gisdash_server=debug,tower_http=debug,sqlx=info")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    info!("Starting gisdash server");

    let config = Config::load().context("Failed to load configuration")?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let db_pool = db::create_pool(&DbConfig::from(&config.database))
        .await
        .context("Failed to connect to database")?;
    info!("Database connection pool established");

    db::migrate(&db_pool).await.context("Failed to run migrations")?;

    let storage_config = StorageConfig::from_env()?;
    let storage = Storage::new(storage_config).await?;
    info!("Storage client initialized");

    let pipeline = Arc::new(IngestPipeline::postgres(
        config.pipeline.clone(),
        db_pool.clone(),
        Arc::new(storage),
    )?);
    let queue: Arc<dyn JobQueue> = Arc::new(PgJobQueue::new(db_pool.clone()));

    let shutdown = CancellationToken::new();
    let poller_handle = if config.server.worker_embedded {
        let poller = QueuePoller::new(queue.clone(), pipeline.clone());
        info!(worker_id = %poller.worker_id(), "Starting embedded queue poller");
        let token = shutdown.clone();
        Some(tokio::spawn(async move { poller.run(token).await }))
    } else {
        info!("Embedded queue poller disabled (WORKER_EMBEDDED=false)");
        None
    };

    let state = FeatureState {
        db: db_pool,
        queue,
        pipeline,
    };
    let app = api::create_router(state, &config);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid bind address")?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Some(handle) = poller_handle {
        let grace = Duration::from_secs(config.server.shutdown_timeout_secs);
        info!("Waiting up to {} seconds for the poller to drain", grace.as_secs());
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => info!("Queue poller drained"),
            Ok(Err(e)) => tracing::error!("Queue poller task failed: {}", e),
            Err(_) => tracing::warn!("Queue poller still busy after grace period; its lease will lapse"),
        }
    }

    info!("Server shut down gracefully");

    Ok(())
}
