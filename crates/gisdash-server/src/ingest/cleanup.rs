//! Scratch space and terminal job bookkeeping
//!
//! Every run gets a private directory under the scratch root. HTTP runs key
//! it by run id; queued runs by job id and claim attempt, so a worker that
//! reclaims an expired job never touches the previous owner's files.
//! [`ScratchDir`] removes it on [`ScratchDir::release`] and, if a run unwinds
//! before reaching that point, on drop.

use gisdash_common::types::JobStatus;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::error::{PipelineError, StoreError};
use super::models::{Job, PipelineReport};
use super::queue::JobQueue;

#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    released: bool,
}

impl ScratchDir {
    /// Create `<root>/<key>`, clearing leftovers from a crashed run with the
    /// same key. Blocking; extraction calls it on the blocking pool.
    pub fn create(root: &Path, key: &str) -> io::Result<Self> {
        let path = root.join(key);

        match std::fs::remove_dir_all(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale scratch directory"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(e),
        }

        std::fs::create_dir_all(&path)?;

        Ok(Self {
            path,
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn release(mut self) -> io::Result<()> {
        let result = match tokio::fs::remove_dir_all(&self.path).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        };
        self.released = true;
        debug!(path = %self.path.display(), "Released scratch directory");
        result
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "Failed to remove scratch directory");
            }
        }
    }
}

/// Record the outcome of a claimed job. Returns the status written, or
/// `None` when the worker no longer owns the job.
pub async fn finalize_job(
    queue: &dyn JobQueue,
    job: &Job,
    worker_id: &str,
    outcome: &Result<PipelineReport, PipelineError>,
) -> Result<Option<JobStatus>, StoreError> {
    let (status, recorded) = match outcome {
        Ok(report) => {
            let recorded = queue.mark_done(job.id, worker_id, report.layer_id).await?;
            (JobStatus::Done, recorded)
        },
        Err(err) => {
            let recorded = queue
                .mark_failed(job.id, worker_id, &err.to_error_message())
                .await?;
            (JobStatus::Failed, recorded)
        },
    };

    if !recorded {
        warn!(
            job_id = %job.id,
            worker_id,
            outcome = status.as_str(),
            "Lost ownership of job before recording its outcome"
        );
        return Ok(None);
    }

    match outcome {
        Ok(report) => info!(
            job_id = %job.id,
            layer_id = %report.layer_id,
            feature_count = report.feature_count,
            "Job done"
        ),
        Err(err) => warn!(job_id = %job.id, kind = err.kind(), error = %err, "Job failed"),
    }

    Ok(Some(status))
}
