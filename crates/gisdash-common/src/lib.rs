//! GIS Dashboard Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the gisdash workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`GisError`] and the crate [`Result`] alias
//! - **Checksums**: SHA-256 helpers for uploaded artifacts
//! - **Logging**: one `tracing` setup shared by the server and the worker
//! - **Types**: the ingestion job state machine and country codes, shared by
//!   every producer and consumer of job rows
//!
//! # Example
//!
//! ```no_run
//! use gisdash_common::types::{CountryCode, JobStatus};
//!
//! let country: CountryCode = "phl".parse().unwrap();
//! assert_eq!(country.as_str(), "PHL");
//! assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{GisError, Result};
