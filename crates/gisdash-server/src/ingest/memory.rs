//! In-process backends
//!
//! Mutex-backed implementations of the blob store, job queue, feature store
//! and version catalog, plus canned converters. They honour the same
//! contracts as the Postgres/S3 implementations and add a few knobs for
//! injecting failures, which is what the pipeline and poller tests drive.

use async_trait::async_trait;
use chrono::Utc;
use gisdash_common::checksum::sha256_hex;
use gisdash_common::types::{CountryCode, JobStatus};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use super::convert::{collection_len, Conversion, ConvertOptions, GeometryConverter};
use super::error::{PipelineError, PipelineResult, StoreError};
use super::fetcher::ExtractedArchive;
use super::loader::FeatureStore;
use super::models::{DatasetVersion, FeatureRecord, IngestRequest, Job, Layer};
use super::publisher::{Activation, VersionCatalog};
use super::queue::JobQueue;
use crate::storage::{BlobError, BlobStore, UploadResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn lease_deadline(lease: Duration) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(0))
}

// ============================================================================
// Blob store
// ============================================================================

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    content_type: Option<String>,
}

#[derive(Default)]
pub struct MemoryBlobStore {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    failing_gets: AtomicU32,
    get_calls: AtomicUsize,
    fail_puts: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, bucket: &str, key: &str, data: Vec<u8>) {
        lock(&self.objects).insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                content_type: None,
            },
        );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.object(bucket, key).is_some()
    }

    pub fn content_type(&self, bucket: &str, key: &str) -> Option<String> {
        lock(&self.objects)
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|o| o.content_type.clone())
    }

    /// Keys stored in `bucket`
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.objects)
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next `n` downloads fail with a transient error
    pub fn fail_next_gets(&self, n: u32) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BlobError::Backend("connection reset by peer".to_string()));
        }

        self.object(bucket, key)
            .ok_or_else(|| BlobError::not_found(bucket, key))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<UploadResult, BlobError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BlobError::Backend("bucket is read-only".to_string()));
        }

        let result = UploadResult {
            bucket: bucket.to_string(),
            key: key.to_string(),
            checksum: sha256_hex(&data),
            size: data.len() as u64,
        };
        lock(&self.objects).insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                content_type: Some(content_type.to_string()),
            },
        );
        Ok(result)
    }

    async fn size(&self, bucket: &str, key: &str) -> Result<u64, BlobError> {
        self.object(bucket, key)
            .map(|data| data.len() as u64)
            .ok_or_else(|| BlobError::not_found(bucket, key))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobError> {
        lock(&self.objects).remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}

// ============================================================================
// Job queue
// ============================================================================

#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<Job>>,
    history: Mutex<HashMap<Uuid, Vec<JobStatus>>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<Job> {
        lock(&self.jobs).clone()
    }

    /// Every status a job has been written with, in order
    pub fn status_history(&self, job_id: Uuid) -> Vec<JobStatus> {
        lock(&self.history).get(&job_id).cloned().unwrap_or_default()
    }

    /// Force a job's lease into the past, as if its worker died
    pub fn expire_lease(&self, job_id: Uuid) {
        if let Some(job) = lock(&self.jobs).iter_mut().find(|j| j.id == job_id) {
            job.lease_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    fn record(&self, job_id: Uuid, status: JobStatus) {
        let mut history = lock(&self.history);
        let entry = history.entry(job_id).or_default();
        if entry.last() != Some(&status) {
            entry.push(status);
        }
    }

    fn claimable(job: &Job, max_claims: i32) -> bool {
        match job.status {
            JobStatus::Pending => true,
            JobStatus::Processing => job.lease_expired(Utc::now()) && job.attempts < max_claims,
            _ => false,
        }
    }

    fn finish(
        &self,
        job_id: Uuid,
        worker_id: &str,
        next: JobStatus,
        apply: impl FnOnce(&mut Job),
    ) -> Result<bool, StoreError> {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Processing || job.worker_id.as_deref() != Some(worker_id) {
            return Ok(false);
        }

        job.status = job.status.transition(next)?;
        job.finished_at = Some(Utc::now());
        job.lease_expires_at = None;
        apply(job);
        drop(jobs);

        self.record(job_id, next);
        Ok(true)
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, request: &IngestRequest) -> Result<Job, StoreError> {
        let job = Job::pending(request);
        lock(&self.jobs).push(job.clone());
        self.record(job.id, JobStatus::Pending);
        Ok(job)
    }

    async fn next_candidate(&self, max_claims: i32) -> Result<Option<Job>, StoreError> {
        Ok(lock(&self.jobs)
            .iter()
            .find(|job| Self::claimable(job, max_claims))
            .cloned())
    }

    async fn try_claim(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
        max_claims: i32,
    ) -> Result<Option<Job>, StoreError> {
        let mut jobs = lock(&self.jobs);
        let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(None);
        };
        if !Self::claimable(job, max_claims) {
            return Ok(None);
        }

        if job.status == JobStatus::Pending {
            job.status = job.status.transition(JobStatus::Processing)?;
        }
        job.worker_id = Some(worker_id.to_string());
        job.claimed_at = Some(Utc::now());
        job.lease_expires_at = Some(lease_deadline(lease));
        job.attempts += 1;
        let claimed = job.clone();
        drop(jobs);

        self.record(job_id, JobStatus::Processing);
        Ok(Some(claimed))
    }

    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool, StoreError> {
        let mut jobs = lock(&self.jobs);
        match jobs.iter_mut().find(|j| {
            j.id == job_id
                && j.status == JobStatus::Processing
                && j.worker_id.as_deref() == Some(worker_id)
        }) {
            Some(job) => {
                job.lease_expires_at = Some(lease_deadline(lease));
                Ok(true)
            },
            None => Ok(false),
        }
    }

    async fn reap_expired(&self, max_claims: i32) -> Result<Vec<Uuid>, StoreError> {
        let now = Utc::now();
        let mut reaped = Vec::new();
        {
            let mut jobs = lock(&self.jobs);
            for job in jobs
                .iter_mut()
                .filter(|j| j.lease_expired(now) && j.attempts >= max_claims)
            {
                job.status = job.status.transition(JobStatus::Failed)?;
                job.finished_at = Some(now);
                job.error_message = Some(format!(
                    "Lease expired after {} claims (last worker: {})",
                    job.attempts,
                    job.worker_id.as_deref().unwrap_or("unknown")
                ));
                job.lease_expires_at = None;
                reaped.push(job.id);
            }
        }
        for id in &reaped {
            self.record(*id, JobStatus::Failed);
        }
        Ok(reaped)
    }

    async fn mark_done(
        &self,
        job_id: Uuid,
        worker_id: &str,
        layer_id: Uuid,
    ) -> Result<bool, StoreError> {
        self.finish(job_id, worker_id, JobStatus::Done, |job| {
            job.layer_id = Some(layer_id);
            job.error_message = None;
        })
    }

    async fn mark_failed(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        let message = error_message.to_string();
        self.finish(job_id, worker_id, JobStatus::Failed, |job| {
            job.error_message = Some(message);
        })
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(lock(&self.jobs).iter().find(|j| j.id == job_id).cloned())
    }
}

// ============================================================================
// Feature store and version catalog
// ============================================================================

#[derive(Default)]
struct CatalogState {
    versions: Vec<DatasetVersion>,
    layers: Vec<Layer>,
    features: HashMap<Uuid, Vec<FeatureRecord>>,
    batch_calls: usize,
    fail_batch_at: Option<usize>,
    batch_sizes: Vec<usize>,
    activations: usize,
}

#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the `n`th batch insert from now (1-based)
    pub fn fail_batch(&self, n: usize) {
        let mut state = lock(&self.state);
        state.fail_batch_at = Some(state.batch_calls + n);
    }

    /// Sizes of the batches written successfully, in order
    pub fn batch_sizes(&self) -> Vec<usize> {
        lock(&self.state).batch_sizes.clone()
    }

    pub fn active_count(&self, country_iso: &str) -> usize {
        lock(&self.state)
            .versions
            .iter()
            .filter(|v| v.country_iso == country_iso && v.is_active)
            .count()
    }

    pub fn version(&self, version_id: &str) -> Option<DatasetVersion> {
        lock(&self.state)
            .versions
            .iter()
            .find(|v| v.id == version_id)
            .cloned()
    }

    pub fn versions(&self) -> Vec<DatasetVersion> {
        lock(&self.state).versions.clone()
    }

    /// Successful `activate` calls so far
    pub fn activations(&self) -> usize {
        lock(&self.state).activations
    }

    pub fn layers(&self) -> Vec<Layer> {
        lock(&self.state).layers.clone()
    }

    /// Total feature rows across every layer id
    pub fn total_features(&self) -> usize {
        lock(&self.state).features.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl FeatureStore for MemoryCatalog {
    async fn insert_batch(&self, layer_id: Uuid, batch: &[FeatureRecord]) -> Result<u64, StoreError> {
        let mut state = lock(&self.state);
        state.batch_calls += 1;
        if state.fail_batch_at == Some(state.batch_calls) {
            state.fail_batch_at = None;
            return Err(StoreError::Backend("batch insert rejected".to_string()));
        }

        state
            .features
            .entry(layer_id)
            .or_default()
            .extend(batch.iter().cloned());
        state.batch_sizes.push(batch.len());
        Ok(batch.len() as u64)
    }

    async fn count_features(&self, layer_id: Uuid) -> Result<i64, StoreError> {
        Ok(lock(&self.state)
            .features
            .get(&layer_id)
            .map(|f| f.len() as i64)
            .unwrap_or(0))
    }

    async fn delete_features(&self, layer_id: Uuid) -> Result<u64, StoreError> {
        Ok(lock(&self.state)
            .features
            .remove(&layer_id)
            .map(|f| f.len() as u64)
            .unwrap_or(0))
    }
}

#[async_trait]
impl VersionCatalog for MemoryCatalog {
    async fn register_version(
        &self,
        country: &CountryCode,
        version_id: &str,
        title: &str,
    ) -> Result<DatasetVersion, StoreError> {
        let mut state = lock(&self.state);
        if let Some(existing) = state.versions.iter().find(|v| v.id == version_id) {
            if existing.country_iso != country.as_str() {
                return Err(StoreError::Conflict(format!(
                    "version {} belongs to {}",
                    version_id, existing.country_iso
                )));
            }
            return Ok(existing.clone());
        }

        let version = DatasetVersion {
            id: version_id.to_string(),
            country_iso: country.to_string(),
            title: title.to_string(),
            is_active: false,
            activated_at: None,
            created_at: Utc::now(),
        };
        state.versions.push(version.clone());
        Ok(version)
    }

    async fn activate(&self, country: &CountryCode, layer: &Layer) -> Result<Activation, StoreError> {
        // One lock covers the layer swap, demote and promote, so no reader
        // sees a gap.
        let mut state = lock(&self.state);
        let version_id = layer.version_id.as_str();
        let owner = state
            .versions
            .iter()
            .find(|v| v.id == version_id)
            .map(|v| v.country_iso.clone())
            .ok_or_else(|| StoreError::NotFound(format!("version {}", version_id)))?;
        if owner != country.as_str() {
            return Err(StoreError::Conflict(format!(
                "version {} belongs to {}",
                version_id, owner
            )));
        }
        if state.layers.iter().any(|l| l.id == layer.id) {
            return Err(StoreError::Conflict(format!("layer {} exists", layer.id)));
        }

        let (replaced, kept): (Vec<Layer>, Vec<Layer>) = std::mem::take(&mut state.layers)
            .into_iter()
            .partition(|l| l.version_id == version_id && l.admin_level == layer.admin_level);
        state.layers = kept;
        for old in &replaced {
            state.features.remove(&old.id);
        }
        state.layers.push(layer.clone());

        let now = Utc::now();
        let mut activated = None;
        for version in state.versions.iter_mut().filter(|v| v.country_iso == owner) {
            if version.id == version_id {
                version.is_active = true;
                version.activated_at = Some(now);
                activated = Some(version.clone());
            } else {
                version.is_active = false;
            }
        }
        let version =
            activated.ok_or_else(|| StoreError::NotFound(format!("version {}", version_id)))?;
        state.activations += 1;
        Ok(Activation { version, replaced })
    }

    async fn active_version(&self, country: &CountryCode) -> Result<Option<DatasetVersion>, StoreError> {
        Ok(lock(&self.state)
            .versions
            .iter()
            .find(|v| v.country_iso == country.as_str() && v.is_active)
            .cloned())
    }
}

// ============================================================================
// Converters
// ============================================================================

/// A `FeatureCollection` of `n` unit squares tagged with level-specific
/// pcode and name properties
pub fn synthetic_collection(n: usize, admin_level: i16) -> Value {
    let features: Vec<Value> = (0..n)
        .map(|i| {
            let x = (i % 100) as f64;
            let y = (i / 100) as f64;
            let mut properties = serde_json::Map::new();
            properties.insert(
                format!("ADM{}_PCODE", admin_level),
                json!(format!("PH{:06}", i)),
            );
            properties.insert(format!("ADM{}_EN", admin_level), json!(format!("Area {}", i)));
            json!({
                "type": "Feature",
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[x, y], [x + 1.0, y], [x + 1.0, y + 1.0], [x, y + 1.0], [x, y]]]
                },
                "properties": properties
            })
        })
        .collect();

    json!({"type": "FeatureCollection", "features": features})
}

/// Returns a fixed collection regardless of input
pub struct StaticConverter {
    collection: Value,
    reported_count: Option<usize>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticConverter {
    pub fn new(collection: Value) -> Self {
        Self {
            collection,
            reported_count: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Report `count` instead of the real number of features
    pub fn reporting(mut self, count: usize) -> Self {
        self.reported_count = Some(count);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeometryConverter for StaticConverter {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn convert(
        &self,
        _archive: &ExtractedArchive,
        _options: ConvertOptions,
    ) -> PipelineResult<Conversion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let feature_count = match self.reported_count {
            Some(count) => count,
            None => collection_len(&self.collection)?,
        };
        Ok(Conversion {
            collection: self.collection.clone(),
            feature_count,
        })
    }
}

/// Always fails with the given tool message
pub struct FailingConverter {
    message: String,
}

impl FailingConverter {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl GeometryConverter for FailingConverter {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn convert(
        &self,
        _archive: &ExtractedArchive,
        _options: ConvertOptions,
    ) -> PipelineResult<Conversion> {
        Err(PipelineError::Conversion(self.message.clone()))
    }
}
