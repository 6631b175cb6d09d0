//! Submit conversion command
//!
//! One command backs both submission endpoints. Depending on the mode it
//! either runs the pipeline inline or inserts exactly one `pending` job,
//! never both.
//!
//! # Modes
//!
//! - `sync`: run the pipeline in the request (`POST /convert` always uses this)
//! - `async`: enqueue a job for the poller
//! - `auto`: look up the archive size and run inline when it is small enough

use gisdash_common::types::CountryCode;
use gisdash_common::GisError;
use mediator::Request;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::features::shared::validation::{
    validate_max_length, validate_object_path, validate_required, validate_version_id,
    FieldValidationError, PathValidationError, VersionIdValidationError,
};
use crate::ingest::models::{LayerTarget, MAX_ADMIN_LEVEL};
use crate::ingest::{
    IngestPipeline, IngestRequest, Job, JobQueue, PipelineError, PipelineReport, SourceRef,
    StoreError, Trigger,
};

const MAX_VERSION_ID_LENGTH: usize = 100;
const MAX_TITLE_LENGTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitMode {
    Sync,
    #[default]
    Async,
    Auto,
}

/// Command to convert one raw archive into a dataset version layer
///
/// # Examples
///
/// ```rust,ignore
/// let command = SubmitConversionCommand {
///     bucket: "gis_raw".to_string(),
///     path: "uploads/phl_adm2.zip".to_string(),
///     country_iso: "PHL".to_string(),
///     version_id: "phl-2026-v1".to_string(),
///     title: Some("Philippines 2026".to_string()),
///     admin_level: Some(2),
///     format: None,
///     mode: SubmitMode::Async,
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitConversionCommand {
    pub bucket: String,
    pub path: String,
    pub country_iso: String,
    pub version_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Defaults to 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_level: Option<i16>,
    /// Defaults to `geojson`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default)]
    pub mode: SubmitMode,
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// The pipeline ran inline and published the version
    Completed(PipelineReport),
    /// A `pending` job was inserted
    Enqueued(Job),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// JSON that does not deserialize into a command
    #[error("invalid request body: {0}")]
    Body(String),

    #[error("{0}")]
    Field(#[from] FieldValidationError),

    #[error("{0}")]
    Path(#[from] PathValidationError),

    #[error("{0}")]
    VersionId(#[from] VersionIdValidationError),

    #[error("{0}")]
    Country(#[from] GisError),

    #[error("admin_level must be between 0 and {max}, got {got}")]
    AdminLevel { got: i16, max: i16 },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SubmitError {
    /// Whether the request itself was bad, as opposed to a failed run
    pub fn is_validation(&self) -> bool {
        match self {
            SubmitError::Pipeline(e) => matches!(e, PipelineError::Validation(_)),
            SubmitError::Store(_) => false,
            _ => true,
        }
    }

    /// Short machine-readable category
    pub fn kind(&self) -> &'static str {
        match self {
            SubmitError::Pipeline(e) => e.kind(),
            SubmitError::Store(_) => "store_error",
            _ => "validation_error",
        }
    }
}

impl Request<Result<SubmitOutcome, SubmitError>> for SubmitConversionCommand {}

impl SubmitConversionCommand {
    /// Validate the command and build the pipeline request
    #[tracing::instrument(skip(self), fields(bucket = %self.bucket, path = %self.path))]
    pub fn validate(&self) -> Result<IngestRequest, SubmitError> {
        validate_required("bucket", &self.bucket)?;
        validate_object_path(&self.path)?;
        validate_required("country_iso", &self.country_iso)?;
        validate_version_id(&self.version_id, MAX_VERSION_ID_LENGTH)?;
        validate_max_length("title", self.title.as_deref(), MAX_TITLE_LENGTH)?;

        let country: CountryCode = self.country_iso.parse()?;

        let admin_level = self.admin_level.unwrap_or(0);
        if !(0..=MAX_ADMIN_LEVEL).contains(&admin_level) {
            return Err(SubmitError::AdminLevel {
                got: admin_level,
                max: MAX_ADMIN_LEVEL,
            });
        }

        let mut target = LayerTarget::new(self.version_id.clone(), admin_level);
        target.title = self.title.clone().filter(|t| !t.trim().is_empty());
        if let Some(format) = self.format.as_deref().filter(|f| !f.trim().is_empty()) {
            target.format = format.trim().to_lowercase();
        }

        Ok(IngestRequest {
            source: SourceRef::new(self.bucket.trim(), self.path.trim()),
            country,
            target,
        })
    }
}

/// Resolve `auto` to `sync` or `async` from the archive size
async fn resolve_mode(
    pipeline: &IngestPipeline,
    request: &IngestRequest,
    mode: SubmitMode,
) -> Result<SubmitMode, SubmitError> {
    if mode != SubmitMode::Auto {
        return Ok(mode);
    }

    let size = pipeline
        .blobs()
        .size(&request.source.bucket, &request.source.path)
        .await
        .map_err(PipelineError::Retrieval)?;
    let threshold = pipeline.config().sync_max_bytes;

    let resolved = if size <= threshold {
        SubmitMode::Sync
    } else {
        SubmitMode::Async
    };
    tracing::debug!(size, threshold, ?resolved, "Resolved auto submission mode");
    Ok(resolved)
}

#[tracing::instrument(
    skip(queue, pipeline, command),
    fields(country_iso = %command.country_iso, version_id = %command.version_id, mode = ?command.mode)
)]
pub async fn handle(
    queue: Arc<dyn JobQueue>,
    pipeline: Arc<IngestPipeline>,
    command: SubmitConversionCommand,
) -> Result<SubmitOutcome, SubmitError> {
    let request = command.validate()?;

    match resolve_mode(&pipeline, &request, command.mode).await? {
        SubmitMode::Async => {
            let job = queue.enqueue(&request).await?;
            tracing::info!(job_id = %job.id, "Conversion job enqueued");
            Ok(SubmitOutcome::Enqueued(job))
        },
        SubmitMode::Sync | SubmitMode::Auto => {
            let report = pipeline.run(Uuid::new_v4(), &request, Trigger::Http).await?;
            Ok(SubmitOutcome::Completed(report))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::config::PipelineConfig;
    use crate::ingest::memory::{
        synthetic_collection, MemoryBlobStore, MemoryCatalog, MemoryJobQueue, StaticConverter,
    };

    fn command(mode: SubmitMode) -> SubmitConversionCommand {
        SubmitConversionCommand {
            bucket: "gis_raw".to_string(),
            path: "uploads/phl_adm1.geojson".to_string(),
            country_iso: "phl".to_string(),
            version_id: "phl-2026-v1".to_string(),
            title: None,
            admin_level: Some(1),
            format: None,
            mode,
        }
    }

    struct Harness {
        queue: Arc<MemoryJobQueue>,
        pipeline: Arc<IngestPipeline>,
        catalog: Arc<MemoryCatalog>,
        _scratch: tempfile::TempDir,
    }

    fn harness(sync_max_bytes: u64) -> Harness {
        let scratch = tempfile::tempdir().unwrap();
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.insert("gis_raw", "uploads/phl_adm1.geojson", vec![b' '; 64]);
        let catalog = Arc::new(MemoryCatalog::new());
        let pipeline = IngestPipeline::new(
            PipelineConfig {
                scratch_root: scratch.path().to_path_buf(),
                sync_max_bytes,
                ..Default::default()
            },
            blobs,
            Arc::new(StaticConverter::new(synthetic_collection(4, 1))),
            catalog.clone(),
            catalog.clone(),
        );
        Harness {
            queue: Arc::new(MemoryJobQueue::new()),
            pipeline: Arc::new(pipeline),
            catalog,
            _scratch: scratch,
        }
    }

    #[test]
    fn test_validate_builds_request() {
        let request = command(SubmitMode::Sync).validate().unwrap();
        assert_eq!(request.country.as_str(), "PHL");
        assert_eq!(request.target.admin_level, 1);
        assert_eq!(request.target.format, "geojson");
        assert_eq!(request.source.file_name(), "phl_adm1.geojson");
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let mut cmd = command(SubmitMode::Sync);
        cmd.bucket = String::new();
        assert!(matches!(cmd.validate(), Err(SubmitError::Field(_))));

        let mut cmd = command(SubmitMode::Sync);
        cmd.country_iso = "PH".to_string();
        let err = cmd.validate().unwrap_err();
        assert!(matches!(err, SubmitError::Country(_)));
        assert!(err.is_validation());

        let mut cmd = command(SubmitMode::Sync);
        cmd.admin_level = Some(9);
        assert!(matches!(cmd.validate(), Err(SubmitError::AdminLevel { got: 9, .. })));

        let mut cmd = command(SubmitMode::Sync);
        cmd.path = "../outside.zip".to_string();
        assert!(matches!(cmd.validate(), Err(SubmitError::Path(_))));
    }

    #[tokio::test]
    async fn test_async_inserts_exactly_one_job() {
        let h = harness(1024);
        let outcome = handle(h.queue.clone(), h.pipeline.clone(), command(SubmitMode::Async))
            .await
            .unwrap();

        assert!(matches!(outcome, SubmitOutcome::Enqueued(_)));
        assert_eq!(h.queue.jobs().len(), 1);
        assert!(h.catalog.versions().is_empty());
    }

    #[tokio::test]
    async fn test_sync_runs_without_job_row() {
        let h = harness(1024);
        let outcome = handle(h.queue.clone(), h.pipeline.clone(), command(SubmitMode::Sync))
            .await
            .unwrap();

        match outcome {
            SubmitOutcome::Completed(report) => {
                assert_eq!(report.trigger, Trigger::Http);
                assert_eq!(report.feature_count, 4);
            },
            other => panic!("expected completed run, got {:?}", other),
        }
        assert!(h.queue.jobs().is_empty());
        assert_eq!(h.catalog.active_count("PHL"), 1);
    }

    #[tokio::test]
    async fn test_auto_picks_mode_by_size() {
        let small = harness(1024);
        let outcome = handle(small.queue.clone(), small.pipeline.clone(), command(SubmitMode::Auto))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Completed(_)));

        let large = harness(16);
        let outcome = handle(large.queue.clone(), large.pipeline.clone(), command(SubmitMode::Auto))
            .await
            .unwrap();
        assert!(matches!(outcome, SubmitOutcome::Enqueued(_)));
    }

    #[tokio::test]
    async fn test_auto_with_missing_object_is_retrieval_error() {
        let h = harness(1024);
        let mut cmd = command(SubmitMode::Auto);
        cmd.path = "uploads/missing.zip".to_string();

        let err = handle(h.queue.clone(), h.pipeline.clone(), cmd).await.unwrap_err();
        assert_eq!(err.kind(), "retrieval_error");
        assert!(!err.is_validation());
        assert!(h.queue.jobs().is_empty());
    }
}
