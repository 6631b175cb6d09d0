//! Shared utilities for feature modules
//!
//! - **validation**: input checks for submission commands
//! - **error_helpers**: database constraint classification

pub mod error_helpers;
pub mod validation;

pub use validation::{
    validate_max_length, validate_object_path, validate_required, validate_version_id,
    FieldValidationError, PathValidationError, VersionIdValidationError,
};
