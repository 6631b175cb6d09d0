//! gisdash Server Library
//!
//! Ingestion and conversion backend for the gisdash dashboard. Raw boundary
//! archives uploaded to object storage become published, versioned GeoJSON
//! layers with their features stored in PostgreSQL.
//!
//! # Overview
//!
//! - **ingest**: the pipeline (fetch, extract, convert, load, publish), the
//!   claim-and-lease job queue and its poller
//! - **features**: HTTP slices for submission, job status and versions
//! - **db**: pool setup, migrations, Postgres queue and catalog
//! - **storage**: S3-compatible blob store
//! - **config**: environment-based configuration
//! - **middleware**: CORS and request tracing
//!
//! # Architecture
//!
//! Two entry paths share one orchestration core,
//! [`ingest::IngestPipeline::run`]:
//!
//! - `POST /api/v1/convert` runs it inside the request
//! - `POST /api/v1/jobs` inserts a `pending` job that a
//!   [`ingest::QueuePoller`] claims under a lease and runs
//!
//! Activation of a new dataset version happens in one transaction, so a
//! country never has more than one active version.
//!
//! # Example
//!
//! ```no_run
//! use gisdash_server::{api, config::Config, db, features::FeatureState};
//! use gisdash_server::ingest::IngestPipeline;
//! use gisdash_server::storage::{config::StorageConfig, Storage};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&(&config.database).into()).await?;
//!     let storage = Storage::new(StorageConfig::from_env()?).await?;
//!     let pipeline = IngestPipeline::postgres(config.pipeline.clone(), pool.clone(), Arc::new(storage))?;
//!     let state = FeatureState {
//!         db: pool.clone(),
//!         queue: Arc::new(db::jobs::PgJobQueue::new(pool)),
//!         pipeline: Arc::new(pipeline),
//!     };
//!     let _app = api::create_router(state, &config);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod features;
pub mod ingest;
pub mod middleware;
pub mod shutdown;
pub mod storage;

// Re-export commonly used types
pub use error::{AppError, AppResult};
