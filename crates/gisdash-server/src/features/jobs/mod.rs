//! Jobs feature module
//!
//! Submission of conversion requests (inline or queued) and read access to
//! the ingestion queue.

pub mod commands;
pub mod queries;
pub mod routes;

pub use routes::jobs_routes;
