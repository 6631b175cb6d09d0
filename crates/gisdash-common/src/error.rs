//! Error types shared across gisdash crates

use thiserror::Error;

use crate::types::JobStatus;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, GisError>;

/// Main error type for shared gisdash functionality
#[derive(Error, Debug)]
pub enum GisError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid country code '{0}': expected three ASCII letters (ISO 3166-1 alpha-3)")]
    InvalidCountryCode(String),

    #[error("Unknown job status '{0}'")]
    UnknownJobStatus(String),

    #[error("Invalid job status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Configuration error: {0}")]
    Config(String),
}
