//! Feature modules implementing the gisdash ingestion API
//!
//! Each feature is a vertical slice with its own commands, queries, and
//! routes, following the CQRS (Command Query Responsibility Segregation)
//! layout.
//!
//! # Features
//!
//! - **jobs**: conversion submission (`/convert`, `/jobs`) and job status
//! - **versions**: dataset versions and the active version per country
//!
//! Commands and queries implement the mediator pattern using the `mediator`
//! crate.

pub mod jobs;
pub mod shared;
pub mod versions;

use axum::Router;
use std::sync::Arc;

use crate::ingest::{IngestPipeline, JobQueue};

/// Shared state for all feature routes
#[derive(Clone)]
pub struct FeatureState {
    /// PostgreSQL connection pool for read queries
    pub db: sqlx::PgPool,
    /// Queue that `POST /jobs` enqueues into
    pub queue: Arc<dyn JobQueue>,
    /// Orchestration core used by inline conversions
    pub pipeline: Arc<IngestPipeline>,
}

/// Creates the API router with all feature routes mounted
///
/// - `/convert`, `/jobs`, `/jobs/:job_id`
/// - `/versions`, `/versions/active/:country_iso`
pub fn router(state: FeatureState) -> Router<()> {
    Router::new()
        .merge(jobs::jobs_routes())
        .merge(versions::versions_routes())
        .with_state(state)
}
