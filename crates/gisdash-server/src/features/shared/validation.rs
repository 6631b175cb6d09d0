//! Shared validation utilities
//!
//! Input checks used by the submission commands before anything touches the
//! blob store or the queue.
//!
//! # Examples
//!
//! ```rust,ignore
//! use gisdash_server::features::shared::validation::{validate_required, validate_version_id};
//!
//! validate_required("bucket", &command.bucket)?;
//! validate_version_id(&command.version_id, 100)?;
//! ```

use thiserror::Error;

/// Errors that can occur during field validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FieldValidationError {
    #[error("{field} is required and cannot be empty")]
    Required { field: &'static str },

    #[error("{field} must be at most {max_length} characters")]
    TooLong {
        field: &'static str,
        max_length: usize,
    },
}

/// Errors that can occur during version id validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionIdValidationError {
    #[error("version_id is required and cannot be empty")]
    Required,

    #[error("version_id must be between 1 and {max_length} characters")]
    TooLong { max_length: usize },

    #[error("version_id can only contain letters, numbers, '.', '_' and '-'")]
    InvalidFormat,
}

/// Errors that can occur during object path validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathValidationError {
    #[error("path is required and cannot be empty")]
    Required,

    #[error("path must be relative to the bucket")]
    Absolute,

    #[error("path must not contain '..' segments")]
    ParentSegment,
}

/// Validate that a field is present and non-blank
pub fn validate_required(field: &'static str, value: &str) -> Result<(), FieldValidationError> {
    if value.trim().is_empty() {
        return Err(FieldValidationError::Required { field });
    }
    Ok(())
}

/// Validate an optional free-text field's length
pub fn validate_max_length(
    field: &'static str,
    value: Option<&str>,
    max_length: usize,
) -> Result<(), FieldValidationError> {
    match value {
        Some(v) if v.chars().count() > max_length => {
            Err(FieldValidationError::TooLong { field, max_length })
        },
        _ => Ok(()),
    }
}

/// Validate a dataset version id
///
/// # Rules
/// - Must not be empty
/// - Must not exceed max_length characters
/// - Letters, digits, `.`, `_` and `-` only, since it becomes part of an
///   object key
pub fn validate_version_id(
    version_id: &str,
    max_length: usize,
) -> Result<(), VersionIdValidationError> {
    if version_id.is_empty() {
        return Err(VersionIdValidationError::Required);
    }

    if version_id.len() > max_length {
        return Err(VersionIdValidationError::TooLong { max_length });
    }

    if !version_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(VersionIdValidationError::InvalidFormat);
    }

    Ok(())
}

/// Validate an object path inside a bucket
pub fn validate_object_path(path: &str) -> Result<(), PathValidationError> {
    if path.trim().is_empty() {
        return Err(PathValidationError::Required);
    }
    if path.starts_with('/') {
        return Err(PathValidationError::Absolute);
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(PathValidationError::ParentSegment);
    }
    Ok(())
}
