//! Queue poller
//!
//! Each poll:
//!
//! 1. fails jobs whose lease lapsed after too many claims
//! 2. picks the oldest claimable job
//! 3. tries to claim it; losing the race just means polling again
//! 4. runs the pipeline under a heartbeat that keeps the lease alive
//! 5. records the outcome, owner-checked
//!
//! Losing the lease mid-run (the heartbeat sees another owner) cancels the
//! run. Right before publishing, the worker renews its lease once more and
//! aborts if that fails, so a job reclaimed by another worker is published
//! by the new owner only.
//!
//! A worker holds at most one job at a time. Shutdown is observed between
//! jobs and during the idle sleep, never in the middle of a run.

use async_trait::async_trait;
use gisdash_common::types::JobStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cleanup::finalize_job;
use super::error::StoreError;
use super::models::{Job, Trigger};
use super::pipeline::{IngestPipeline, PublishGate, RunControl};
use super::queue::{default_worker_id, JobQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing claimable
    Idle,
    /// Another worker claimed the candidate first
    LostRace { job_id: Uuid },
    /// The job ran; `status` is `None` when ownership was lost mid-run
    Processed {
        job_id: Uuid,
        status: Option<JobStatus>,
    },
}

pub struct QueuePoller {
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<IngestPipeline>,
    worker_id: String,
}

impl QueuePoller {
    pub fn new(queue: Arc<dyn JobQueue>, pipeline: Arc<IngestPipeline>) -> Self {
        Self {
            queue,
            pipeline,
            worker_id: default_worker_id(),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Poll until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        let interval = self.pipeline.config().poll_interval();
        info!(worker_id = %self.worker_id, interval_secs = interval.as_secs(), "Queue poller started");

        while !shutdown.is_cancelled() {
            match self.poll_once().await {
                Ok(PollOutcome::Processed { .. }) | Ok(PollOutcome::LostRace { .. }) => continue,
                Ok(PollOutcome::Idle) => {},
                Err(e) => error!(worker_id = %self.worker_id, error = %e, "Poll failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {},
            }
        }

        info!(worker_id = %self.worker_id, "Queue poller stopped");
    }

    /// Fail jobs whose lease lapsed after the maximum number of claims
    pub async fn reap(&self) -> Result<Vec<Uuid>, StoreError> {
        let reaped = self
            .queue
            .reap_expired(self.pipeline.config().max_claims)
            .await?;
        for job_id in &reaped {
            warn!(%job_id, "Failed job after repeated lease expiry");
        }
        Ok(reaped)
    }

    pub async fn poll_once(&self) -> Result<PollOutcome, StoreError> {
        let config = self.pipeline.config();
        self.reap().await?;

        let Some(candidate) = self.queue.next_candidate(config.max_claims).await? else {
            return Ok(PollOutcome::Idle);
        };

        let claimed = self
            .queue
            .try_claim(candidate.id, &self.worker_id, config.lease(), config.max_claims)
            .await?;
        let Some(job) = claimed else {
            debug!(job_id = %candidate.id, "Job claimed by another worker");
            return Ok(PollOutcome::LostRace {
                job_id: candidate.id,
            });
        };

        info!(
            job_id = %job.id,
            worker_id = %self.worker_id,
            attempt = job.attempts,
            country_iso = %job.country_iso,
            "Claimed job"
        );

        let job_id = job.id;
        let status = self.process(&job).await?;
        Ok(PollOutcome::Processed { job_id, status })
    }

    async fn process(&self, job: &Job) -> Result<Option<JobStatus>, StoreError> {
        let lost = CancellationToken::new();
        let heartbeat = self.spawn_heartbeat(job.id, lost.clone());
        let control = RunControl {
            scratch_key: Some(format!("{}-{}", job.id, job.attempts)),
            cancel: lost.clone(),
            gate: Some(Arc::new(LeaseGate {
                queue: self.queue.clone(),
                job_id: job.id,
                worker_id: self.worker_id.clone(),
                lease: self.pipeline.config().lease(),
                lost,
            })),
        };

        let outcome = match job.to_request() {
            Ok(request) => {
                self.pipeline
                    .run_with(job.id, &request, Trigger::Queue, control)
                    .await
            },
            Err(e) => Err(e),
        };

        heartbeat.abort();
        finalize_job(self.queue.as_ref(), job, &self.worker_id, &outcome).await
    }

    fn spawn_heartbeat(&self, job_id: Uuid, lost: CancellationToken) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let worker_id = self.worker_id.clone();
        let lease = self.pipeline.config().lease();
        let period = self.pipeline.config().heartbeat_interval();

        tokio::spawn(heartbeat(queue, job_id, worker_id, lease, period, lost))
    }
}

/// Renews the lease before publish; a refused renewal means another worker
/// has reclaimed the job
struct LeaseGate {
    queue: Arc<dyn JobQueue>,
    job_id: Uuid,
    worker_id: String,
    lease: Duration,
    lost: CancellationToken,
}

#[async_trait]
impl PublishGate for LeaseGate {
    async fn confirm(&self) -> Result<bool, StoreError> {
        if self.lost.is_cancelled() {
            return Ok(false);
        }
        let owned = self
            .queue
            .renew_lease(self.job_id, &self.worker_id, self.lease)
            .await?;
        if !owned {
            warn!(job_id = %self.job_id, worker_id = %self.worker_id, "Lease lost before publish");
            self.lost.cancel();
        }
        Ok(owned)
    }
}

async fn heartbeat(
    queue: Arc<dyn JobQueue>,
    job_id: Uuid,
    worker_id: String,
    lease: Duration,
    period: Duration,
    lost: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match queue.renew_lease(job_id, &worker_id, lease).await {
            Ok(true) => debug!(%job_id, "Lease renewed"),
            Ok(false) => {
                warn!(%job_id, %worker_id, "Lease lost; another worker owns the job");
                lost.cancel();
                return;
            },
            Err(e) => warn!(%job_id, error = %e, "Lease renewal failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::config::PipelineConfig;
    use crate::ingest::memory::{
        synthetic_collection, MemoryBlobStore, MemoryCatalog, MemoryJobQueue, StaticConverter,
    };
    use crate::ingest::models::{IngestRequest, LayerTarget, SourceRef};

    fn setup(scratch: &std::path::Path) -> (QueuePoller, Arc<MemoryJobQueue>, Arc<MemoryCatalog>) {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.insert("gis_raw", "phl.geojson", b"{}".to_vec());
        let catalog = Arc::new(MemoryCatalog::new());
        let queue = Arc::new(MemoryJobQueue::new());
        let pipeline = IngestPipeline::new(
            PipelineConfig {
                scratch_root: scratch.to_path_buf(),
                ..Default::default()
            },
            blobs,
            Arc::new(StaticConverter::new(synthetic_collection(3, 0))),
            catalog.clone(),
            catalog.clone(),
        );
        let poller = QueuePoller::new(queue.clone(), Arc::new(pipeline)).with_worker_id("worker-a");
        (poller, queue, catalog)
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let scratch = tempfile::tempdir().unwrap();
        let (poller, _, _) = setup(scratch.path());
        assert_eq!(poller.poll_once().await.unwrap(), PollOutcome::Idle);
    }

    #[tokio::test]
    async fn test_poll_processes_oldest_job() {
        let scratch = tempfile::tempdir().unwrap();
        let (poller, queue, catalog) = setup(scratch.path());

        let request = IngestRequest {
            source: SourceRef::new("gis_raw", "phl.geojson"),
            country: "PHL".parse().unwrap(),
            target: LayerTarget::new("phl-adm0", 0),
        };
        let first = queue.enqueue(&request).await.unwrap();
        let second = queue.enqueue(&request).await.unwrap();

        let outcome = poller.poll_once().await.unwrap();
        assert_eq!(
            outcome,
            PollOutcome::Processed {
                job_id: first.id,
                status: Some(JobStatus::Done),
            }
        );

        let done = queue.get(first.id).await.unwrap().unwrap();
        assert_eq!(done.worker_id.as_deref(), Some("worker-a"));
        assert!(done.layer_id.is_some());
        assert_eq!(
            queue.get(second.id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(catalog.active_count("PHL"), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let scratch = tempfile::tempdir().unwrap();
        let (poller, _, _) = setup(scratch.path());

        let token = CancellationToken::new();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), poller.run(token))
            .await
            .unwrap();
    }
}
