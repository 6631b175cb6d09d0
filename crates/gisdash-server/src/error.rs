//! Server-specific error types
//!
//! [`AppError`] is what read handlers return; it renders the standard
//! [`ErrorResponse`] envelope. The submission endpoints use their own
//! `{ok: false, error}` envelope instead.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::api::response::ErrorResponse;
use crate::db::DbError;
use crate::features::jobs::queries::{GetJobError, ListJobsError};
use crate::features::versions::queries::{GetActiveVersionError, ListVersionsError};
use crate::ingest::StoreError;

/// Result type alias for handler operations
pub type AppResult<T> = std::result::Result<T, AppError>;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),
            AppError::Store(StoreError::NotFound(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Store(StoreError::Conflict(_)) => (StatusCode::CONFLICT, "CONFLICT"),
            AppError::Store(StoreError::Domain(_)) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        let message = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                "A database error occurred".to_string()
            },
            AppError::Config(message) => {
                tracing::error!("Configuration error: {}", message);
                "Server configuration error".to_string()
            },
            AppError::Internal(message) => {
                tracing::error!("Internal error: {}", message);
                message.clone()
            },
            AppError::Store(e) if status.is_server_error() => {
                tracing::error!("Store error: {:?}", e);
                "A storage error occurred".to_string()
            },
            AppError::Store(e) => e.to_string(),
            AppError::NotFound(message)
            | AppError::Validation(message)
            | AppError::Conflict(message) => message.clone(),
        };

        (status, Json(ErrorResponse::new(code, message))).into_response()
    }
}

impl From<DbError> for AppError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Sqlx(e) => AppError::Database(e),
            DbError::Migrate(e) => AppError::Internal(e.to_string()),
            DbError::Config(msg) => AppError::Config(msg),
        }
    }
}

impl From<GetJobError> for AppError {
    fn from(err: GetJobError) -> Self {
        match err {
            GetJobError::NotFound => AppError::NotFound("Job not found".to_string()),
            GetJobError::Store(e) => AppError::Store(e),
        }
    }
}

impl From<ListJobsError> for AppError {
    fn from(err: ListJobsError) -> Self {
        match err {
            ListJobsError::InvalidFilter(e) => AppError::Validation(e.to_string()),
            ListJobsError::Database(e) => AppError::Database(e),
        }
    }
}

impl From<ListVersionsError> for AppError {
    fn from(err: ListVersionsError) -> Self {
        match err {
            ListVersionsError::InvalidFilter(e) => AppError::Validation(e.to_string()),
            ListVersionsError::Database(e) => AppError::Database(e),
        }
    }
}

impl From<GetActiveVersionError> for AppError {
    fn from(err: GetActiveVersionError) -> Self {
        match err {
            GetActiveVersionError::InvalidCountry(e) => AppError::Validation(e.to_string()),
            GetActiveVersionError::NoActiveVersion(country) => {
                AppError::NotFound(format!("No active version for {}", country))
            },
            GetActiveVersionError::Database(e) => AppError::Database(e),
        }
    }
}
