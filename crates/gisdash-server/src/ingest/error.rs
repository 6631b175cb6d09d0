//! Pipeline error taxonomy

use std::fmt;
use thiserror::Error;

use crate::storage::BlobError;

/// Maximum length of a persisted `error_message`, in characters
pub const MAX_ERROR_MESSAGE_CHARS: usize = 4000;

/// Pipeline stage, used for timeouts and structured logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Extract,
    Convert,
    Load,
    Publish,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Extract => "extract",
            Stage::Convert => "convert",
            Stage::Load => "load",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way a pipeline run can fail. Each variant aborts the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Retrieval error: {0}")]
    Retrieval(#[from] BlobError),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Load error: {0}")]
    Load(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Timeout error: {stage} stage exceeded {secs}s")]
    Timeout { stage: Stage, secs: u64 },

    /// The run was stopped because its worker no longer owns the job
    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Short machine-readable category
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation(_) => "validation_error",
            PipelineError::Retrieval(_) => "retrieval_error",
            PipelineError::Extraction(_) => "extraction_error",
            PipelineError::Conversion(_) => "conversion_error",
            PipelineError::Load(_) => "load_error",
            PipelineError::Publish(_) => "publish_error",
            PipelineError::Timeout { .. } => "timeout_error",
            PipelineError::Cancelled(_) => "cancelled",
            PipelineError::Store(_) => "store_error",
        }
    }

    /// Message stored on a failed job
    pub fn to_error_message(&self) -> String {
        truncate_message(&self.to_string())
    }
}

/// Truncate to [`MAX_ERROR_MESSAGE_CHARS`] on a character boundary
pub fn truncate_message(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_MESSAGE_CHARS) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Errors from the job queue and dataset catalog stores
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Domain(#[from] gisdash_common::GisError),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;
