//! Shared fixtures for gisdash integration tests
//!
//! Builds an [`IngestPipeline`] over the in-memory blob store, job queue and
//! catalog, so scenarios run without PostgreSQL or S3.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{Harness, request};
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let h = Harness::with_features(10, 0);
//!     h.upload("uploads/phl.geojson", b"{}");
//!     let report = h.run(&request("PHL", "phl-v1", "uploads/phl.geojson", 0)).await.unwrap();
//! }
//! ```

#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::sync::Arc;

use gisdash_server::ingest::config::PipelineConfig;
use gisdash_server::ingest::memory::{
    synthetic_collection, MemoryBlobStore, MemoryCatalog, MemoryJobQueue, StaticConverter,
};
use gisdash_server::ingest::{
    GeometryConverter, IngestPipeline, IngestRequest, LayerTarget, PipelineReport,
    PipelineResult, QueuePoller, SourceRef, Trigger,
};
use uuid::Uuid;

pub const RAW_BUCKET: &str = "gis_raw";

pub struct Harness {
    pub blobs: Arc<MemoryBlobStore>,
    pub catalog: Arc<MemoryCatalog>,
    pub queue: Arc<MemoryJobQueue>,
    pub pipeline: Arc<IngestPipeline>,
    pub scratch: tempfile::TempDir,
}

impl Harness {
    pub fn new(converter: Arc<dyn GeometryConverter>) -> Self {
        Self::configured(converter, |_| {})
    }

    /// Harness whose converter always returns `n` synthetic features
    pub fn with_features(n: usize, admin_level: i16) -> Self {
        Self::new(Arc::new(StaticConverter::new(synthetic_collection(n, admin_level))))
    }

    pub fn configured(
        converter: Arc<dyn GeometryConverter>,
        tweak: impl FnOnce(&mut PipelineConfig),
    ) -> Self {
        let scratch = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig {
            scratch_root: scratch.path().to_path_buf(),
            fetch_backoff_ms: 1,
            ..Default::default()
        };
        tweak(&mut config);

        let blobs = Arc::new(MemoryBlobStore::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let pipeline = IngestPipeline::new(
            config,
            blobs.clone(),
            converter,
            catalog.clone(),
            catalog.clone(),
        );

        Self {
            blobs,
            catalog,
            queue: Arc::new(MemoryJobQueue::new()),
            pipeline: Arc::new(pipeline),
            scratch,
        }
    }

    pub fn upload(&self, path: &str, data: &[u8]) {
        self.blobs.insert(RAW_BUCKET, path, data.to_vec());
    }

    pub async fn run(&self, request: &IngestRequest) -> PipelineResult<PipelineReport> {
        self.pipeline.run(Uuid::new_v4(), request, Trigger::Http).await
    }

    pub fn poller(&self, worker_id: &str) -> QueuePoller {
        QueuePoller::new(self.queue.clone(), self.pipeline.clone()).with_worker_id(worker_id)
    }

    /// Nothing left behind under the scratch root
    pub fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(self.scratch.path())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}

pub fn request(country: &str, version_id: &str, path: &str, admin_level: i16) -> IngestRequest {
    IngestRequest {
        source: SourceRef::new(RAW_BUCKET, path),
        country: country.parse().unwrap(),
        target: LayerTarget::new(version_id, admin_level),
    }
}

pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(contents).unwrap();
        }
        zip.finish().unwrap();
    }
    buffer.into_inner()
}

/// A complete shapefile set (contents are opaque to the scripted converters)
pub fn shapefile_zip(stem: &str) -> Vec<u8> {
    let shp = format!("{}.shp", stem);
    let shx = format!("{}.shx", stem);
    let dbf = format!("{}.dbf", stem);
    let prj = format!("{}.prj", stem);
    zip_bytes(&[
        (shp.as_str(), b"shp"),
        (shx.as_str(), b"shx"),
        (dbf.as_str(), b"dbf"),
        (prj.as_str(), b"GEOGCS[\"WGS 84\"]"),
    ])
}
