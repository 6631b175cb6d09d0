//! Job queue store contract
//!
//! Claiming is a compare-and-set on the row: whichever worker's `UPDATE`
//! matches first owns the job, every other worker sees zero rows and moves
//! on. Terminal updates are checked against the owning worker so a worker
//! that lost its lease can never overwrite the new owner's outcome.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use super::error::StoreError;
use super::models::{IngestRequest, Job};

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert one `pending` job
    async fn enqueue(&self, request: &IngestRequest) -> Result<Job, StoreError>;

    /// Oldest claimable job: `pending`, or `processing` with a lapsed lease
    /// and fewer than `max_claims` claims so far
    async fn next_candidate(&self, max_claims: i32) -> Result<Option<Job>, StoreError>;

    /// Atomically claim `job_id` for `worker_id`. `None` means another
    /// worker got there first.
    async fn try_claim(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
        max_claims: i32,
    ) -> Result<Option<Job>, StoreError>;

    /// Extend the lease. `false` means the worker no longer owns the job.
    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError>;

    /// Fail jobs whose lease lapsed after `max_claims` claims
    async fn reap_expired(&self, max_claims: i32) -> Result<Vec<Uuid>, StoreError>;

    /// `processing -> done`, owner-checked
    async fn mark_done(
        &self,
        job_id: Uuid,
        worker_id: &str,
        layer_id: Uuid,
    ) -> Result<bool, StoreError>;

    /// `processing -> failed`, owner-checked
    async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error_message: &str,
    ) -> Result<bool, StoreError>;

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;
}

/// Worker identity: host name plus a per-process suffix
pub fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "worker".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}
