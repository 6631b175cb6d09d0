//! Get job query
//!
//! Query to get a single ingestion job by ID.

use mediator::Request;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ingest::{Job, JobQueue, StoreError};

/// Query to get a job by ID
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetJobQuery {
    pub job_id: Uuid,
}

/// Error type for get job query
#[derive(Debug, thiserror::Error)]
pub enum GetJobError {
    #[error("Job not found")]
    NotFound,
    #[error("{0}")]
    Store(#[from] StoreError),
}

impl Request<Result<Job, GetJobError>> for GetJobQuery {}

pub async fn handle(queue: &dyn JobQueue, query: GetJobQuery) -> Result<Job, GetJobError> {
    queue.get(query.job_id).await?.ok_or(GetJobError::NotFound)
}
