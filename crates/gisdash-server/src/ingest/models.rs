//! Ingestion domain models
//!
//! Row types for `ingestion_jobs`, `dataset_versions`, `layers` and
//! `features`, plus the request that both entry paths hand to the pipeline.

use chrono::{DateTime, Utc};
use gisdash_common::types::{CountryCode, JobStatus};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::error::PipelineError;

pub const MAX_ADMIN_LEVEL: i16 = 5;
pub const DEFAULT_LAYER_FORMAT: &str = "geojson";
pub const DEFAULT_CRS: &str = "EPSG:4326";

/// Location of a raw archive in the blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub bucket: String,
    pub path: String,
}

impl SourceRef {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into(),
        }
    }

    /// Last path segment, e.g. `phl_adm2.zip`
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// The dataset version and layer a submission produces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerTarget {
    pub version_id: String,
    /// Version title; defaults to the version id when registering
    pub title: Option<String>,
    pub admin_level: i16,
    pub format: String,
}

impl LayerTarget {
    pub fn new(version_id: impl Into<String>, admin_level: i16) -> Self {
        Self {
            version_id: version_id.into(),
            title: None,
            admin_level,
            format: DEFAULT_LAYER_FORMAT.to_string(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// Everything one pipeline run needs, whichever path submitted it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub source: SourceRef,
    pub country: CountryCode,
    pub target: LayerTarget,
}

impl IngestRequest {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.source.bucket.trim().is_empty() {
            return Err(PipelineError::Validation("bucket is required".to_string()));
        }
        if self.source.path.trim().is_empty() {
            return Err(PipelineError::Validation("path is required".to_string()));
        }
        if self.source.path.split('/').any(|segment| segment == "..") {
            return Err(PipelineError::Validation(format!(
                "path must not contain '..': {}",
                self.source.path
            )));
        }
        if self.target.version_id.trim().is_empty() {
            return Err(PipelineError::Validation("version_id is required".to_string()));
        }
        if !(0..=MAX_ADMIN_LEVEL).contains(&self.target.admin_level) {
            return Err(PipelineError::Validation(format!(
                "admin_level must be between 0 and {}, got {}",
                MAX_ADMIN_LEVEL, self.target.admin_level
            )));
        }
        Ok(())
    }

    /// Payload column of the queue row
    pub fn payload(&self) -> Value {
        json!({
            "country_iso": self.country.as_str(),
            "bucket": self.source.bucket,
            "path": self.source.path,
            "format": self.target.format,
            "admin_level": self.target.admin_level,
            "version_id": self.target.version_id,
            "title": self.target.title,
        })
    }
}

/// Which entry path started a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Http,
    Queue,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Http => "http",
            Trigger::Queue => "queue",
        }
    }
}

/// A row of `ingestion_jobs`
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub source_bucket: String,
    pub source_path: String,
    pub country_iso: String,
    pub version_id: String,
    pub title: Option<String>,
    pub admin_level: i16,
    pub format: String,
    pub payload: Value,
    pub worker_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub layer_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh `pending` job for `request`
    pub fn pending(request: &IngestRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: JobStatus::Pending,
            source_bucket: request.source.bucket.clone(),
            source_path: request.source.path.clone(),
            country_iso: request.country.to_string(),
            version_id: request.target.version_id.clone(),
            title: request.target.title.clone(),
            admin_level: request.target.admin_level,
            format: request.target.format.clone(),
            payload: request.payload(),
            worker_id: None,
            claimed_at: None,
            lease_expires_at: None,
            attempts: 0,
            layer_id: None,
            error_message: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Rebuild the pipeline request this job was enqueued with
    pub fn to_request(&self) -> Result<IngestRequest, PipelineError> {
        let country = self
            .country_iso
            .parse()
            .map_err(|e: gisdash_common::GisError| PipelineError::Validation(e.to_string()))?;

        Ok(IngestRequest {
            source: SourceRef::new(&self.source_bucket, &self.source_path),
            country,
            target: LayerTarget {
                version_id: self.version_id.clone(),
                title: self.title.clone(),
                admin_level: self.admin_level,
                format: self.format.clone(),
            },
        })
    }

    /// Whether this job is `processing` under a lease that has run out
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.lease_expires_at.map(|at| at <= now).unwrap_or(true)
    }
}

/// A row of `dataset_versions`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DatasetVersion {
    pub id: String,
    pub country_iso: String,
    pub title: String,
    pub is_active: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A row of `layers`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Layer {
    pub id: Uuid,
    pub version_id: String,
    pub admin_level: i16,
    pub format: String,
    pub crs: String,
    pub source_bucket: String,
    pub source_path: String,
    pub checksum: String,
    pub feature_count: i64,
    pub created_at: DateTime<Utc>,
}

/// A decoded feature ready for insertion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub pcode: Option<String>,
    pub name: Option<String>,
    pub geometry: Value,
    /// Remaining GeoJSON properties
    pub properties: Value,
}

/// Outcome of a successful run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub run_id: Uuid,
    pub trigger: Trigger,
    pub country_iso: String,
    pub version_id: String,
    pub layer_id: Uuid,
    pub feature_count: i64,
    pub output_bucket: String,
    pub output_key: String,
    pub checksum: String,
}
