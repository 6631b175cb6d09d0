//! Archive-to-layer ingestion
//!
//! Turns a raw upload in the blob store into a published dataset version:
//!
//! - **fetcher**: download and unpack the archive into a per-run scratch directory
//! - **convert**: the [`GeometryConverter`] seam (mapshaper CLI or remote service)
//! - **loader**: decode features and write them in bounded batches
//! - **publisher**: upload the GeoJSON, attach the layer, activate the version
//! - **pipeline**: [`IngestPipeline`], the orchestration core shared by both entry paths
//! - **queue** / **poller**: claim-and-lease job queue and the worker loop
//! - **cleanup**: scratch directory guard and terminal job bookkeeping
//! - **memory**: in-process backends for tests (`test-support` feature)
//!
//! # Entry paths
//!
//! - `POST /api/v1/convert` runs the pipeline inline (`Trigger::Http`)
//! - `POST /api/v1/jobs` enqueues a `pending` job that a [`QueuePoller`]
//!   later claims and runs (`Trigger::Queue`)

pub mod cleanup;
pub mod config;
pub mod convert;
pub mod error;
pub mod fetcher;
pub mod loader;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod poller;
pub mod publisher;
pub mod queue;

pub use config::{ConverterKind, PipelineConfig};
pub use convert::GeometryConverter;
pub use error::{PipelineError, PipelineResult, Stage, StoreError};
pub use models::{IngestRequest, Job, LayerTarget, PipelineReport, SourceRef, Trigger};
pub use pipeline::{IngestPipeline, PublishGate, RunControl};
pub use poller::{PollOutcome, QueuePoller};
pub use queue::JobQueue;
