//! Version publisher
//!
//! Publishing runs in a fixed order:
//!
//! 1. upload the GeoJSON to the output bucket
//! 2. register the dataset version (inactive) if it is new
//! 3. attach the layer and activate the version for its country
//!
//! Step 3 is one serialized step per country: the layer row is inserted, any
//! layer of the same version and admin level is replaced, the old active
//! version is demoted and the new one promoted. Readers see either the old or
//! the new state, never neither and never both. If anything fails before
//! step 3 commits, the previously active version is untouched.

use async_trait::async_trait;
use chrono::Utc;
use gisdash_common::types::CountryCode;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::error::{PipelineError, PipelineResult, StoreError};
use super::models::{DatasetVersion, Layer, LayerTarget, DEFAULT_CRS};
use crate::storage::{BlobStore, UploadResult, GEOJSON_CONTENT_TYPE};

#[async_trait]
pub trait VersionCatalog: Send + Sync {
    /// Insert the version inactive unless it exists. A version id that
    /// belongs to another country is a [`StoreError::Conflict`].
    async fn register_version(
        &self,
        country: &CountryCode,
        version_id: &str,
        title: &str,
    ) -> Result<DatasetVersion, StoreError>;

    /// Insert `layer` and make its version the only active version of
    /// `country`, in one step. Layers of the same version and admin level
    /// are removed along with their features.
    async fn activate(&self, country: &CountryCode, layer: &Layer) -> Result<Activation, StoreError>;

    async fn active_version(&self, country: &CountryCode) -> Result<Option<DatasetVersion>, StoreError>;
}

/// Outcome of [`VersionCatalog::activate`]
#[derive(Debug, Clone)]
pub struct Activation {
    pub version: DatasetVersion,
    /// Layers the new one replaced
    pub replaced: Vec<Layer>,
}

/// What to publish
#[derive(Debug, Clone, Copy)]
pub struct PublishInput<'a> {
    pub country: &'a CountryCode,
    pub target: &'a LayerTarget,
    pub layer_id: Uuid,
    pub feature_count: i64,
    pub collection: &'a Value,
}

#[derive(Debug, Clone)]
pub struct Published {
    pub version: DatasetVersion,
    pub layer: Layer,
    pub upload: UploadResult,
}

/// Object key of a layer's GeoJSON in the output bucket
pub fn output_key(country: &CountryCode, version_id: &str, admin_level: i16, layer_id: Uuid) -> String {
    format!("{}/{}/adm{}_{}.geojson", country, version_id, admin_level, layer_id)
}

pub struct VersionPublisher {
    blobs: Arc<dyn BlobStore>,
    catalog: Arc<dyn VersionCatalog>,
    output_bucket: String,
}

impl VersionPublisher {
    pub fn new(
        blobs: Arc<dyn BlobStore>,
        catalog: Arc<dyn VersionCatalog>,
        output_bucket: impl Into<String>,
    ) -> Self {
        Self {
            blobs,
            catalog,
            output_bucket: output_bucket.into(),
        }
    }

    pub fn output_bucket(&self) -> &str {
        &self.output_bucket
    }

    #[instrument(skip(self, input), fields(country_iso = %input.country, version_id = %input.target.version_id, layer_id = %input.layer_id))]
    pub async fn publish(&self, input: PublishInput<'_>) -> PipelineResult<Published> {
        let body = serde_json::to_vec(input.collection)
            .map_err(|e| PipelineError::Publish(format!("serializing GeoJSON: {}", e)))?;
        let key = output_key(
            input.country,
            &input.target.version_id,
            input.target.admin_level,
            input.layer_id,
        );

        let upload = self
            .blobs
            .put(&self.output_bucket, &key, body, GEOJSON_CONTENT_TYPE)
            .await
            .map_err(|e| PipelineError::Publish(format!("uploading {}: {}", key, e)))?;

        match self.attach(&input, &upload).await {
            Ok((version, layer)) => {
                info!(
                    key = %upload.key,
                    feature_count = layer.feature_count,
                    "Published dataset version"
                );
                Ok(Published {
                    version,
                    layer,
                    upload,
                })
            },
            Err(e) => {
                if let Err(delete_err) = self.blobs.delete(&self.output_bucket, &key).await {
                    warn!(key = %key, error = %delete_err, "Failed to remove orphaned upload");
                }
                Err(e)
            },
        }
    }

    async fn attach(
        &self,
        input: &PublishInput<'_>,
        upload: &UploadResult,
    ) -> PipelineResult<(DatasetVersion, Layer)> {
        let title = input
            .target
            .title
            .clone()
            .unwrap_or_else(|| input.target.version_id.clone());

        self.catalog
            .register_version(input.country, &input.target.version_id, &title)
            .await
            .map_err(|e| PipelineError::Publish(format!("registering version: {}", e)))?;

        let layer = Layer {
            id: input.layer_id,
            version_id: input.target.version_id.clone(),
            admin_level: input.target.admin_level,
            format: input.target.format.clone(),
            crs: DEFAULT_CRS.to_string(),
            source_bucket: upload.bucket.clone(),
            source_path: upload.key.clone(),
            checksum: upload.checksum.clone(),
            feature_count: input.feature_count,
            created_at: Utc::now(),
        };

        let activation = self
            .catalog
            .activate(input.country, &layer)
            .await
            .map_err(|e| PipelineError::Publish(format!("activating version: {}", e)))?;

        for old in &activation.replaced {
            info!(layer_id = %old.id, admin_level = old.admin_level, "Replaced layer");
            if let Err(e) = self.blobs.delete(&old.source_bucket, &old.source_path).await {
                warn!(key = %old.source_path, error = %e, "Failed to remove replaced layer output");
            }
        }

        Ok((activation.version, layer))
    }
}
