//! Feature loader
//!
//! Decodes a converted `FeatureCollection` into [`FeatureRecord`]s and writes
//! them in bounded batches, one batch in flight at a time. Rows written under
//! a layer id stay unreachable until that layer is published, so a failed
//! load never exposes a partial layer.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::error::{PipelineError, PipelineResult, StoreError};
use super::models::FeatureRecord;

#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Write one batch atomically, returning the rows written
    async fn insert_batch(&self, layer_id: Uuid, batch: &[FeatureRecord]) -> Result<u64, StoreError>;

    async fn count_features(&self, layer_id: Uuid) -> Result<i64, StoreError>;

    async fn delete_features(&self, layer_id: Uuid) -> Result<u64, StoreError>;
}

/// Pulls pcode and name out of feature properties
#[derive(Debug, Clone)]
pub struct FeatureDecoder {
    pcode_keys: Vec<String>,
    name_keys: Vec<String>,
}

impl FeatureDecoder {
    pub fn new(pcode_keys: Vec<String>, name_keys: Vec<String>) -> Self {
        Self {
            pcode_keys,
            name_keys,
        }
    }

    pub fn decode(&self, collection: &Value, admin_level: i16) -> PipelineResult<Vec<FeatureRecord>> {
        let features = collection
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                PipelineError::Conversion("FeatureCollection has no features array".to_string())
            })?;

        let pcode_keys = expand_keys(&self.pcode_keys, admin_level);
        let name_keys = expand_keys(&self.name_keys, admin_level);

        features
            .iter()
            .enumerate()
            .map(|(index, feature)| {
                if feature.get("type").and_then(Value::as_str) != Some("Feature") {
                    return Err(PipelineError::Conversion(format!(
                        "feature {} is not a GeoJSON Feature",
                        index
                    )));
                }

                let geometry = feature.get("geometry").cloned().unwrap_or(Value::Null);
                let mut properties = match feature.get("properties") {
                    Some(Value::Object(map)) => map.clone(),
                    _ => Map::new(),
                };

                let pcode = take_first(&mut properties, &pcode_keys);
                let name = take_first(&mut properties, &name_keys);

                Ok(FeatureRecord {
                    pcode,
                    name,
                    geometry,
                    properties: Value::Object(properties),
                })
            })
            .collect()
    }
}

fn expand_keys(keys: &[String], admin_level: i16) -> Vec<String> {
    let level = admin_level.to_string();
    keys.iter().map(|k| k.replace("{level}", &level)).collect()
}

/// Remove and return the first non-empty value among `keys`
fn take_first(properties: &mut Map<String, Value>, keys: &[String]) -> Option<String> {
    for key in keys {
        let text = match properties.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        properties.remove(key);
        return Some(text);
    }
    None
}

pub struct FeatureLoader {
    store: Arc<dyn FeatureStore>,
    batch_size: usize,
}

impl FeatureLoader {
    pub fn new(store: Arc<dyn FeatureStore>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Write all features under `layer_id` and confirm the persisted count
    #[instrument(skip(self, features), fields(features = features.len(), batch_size = self.batch_size))]
    pub async fn load(&self, layer_id: Uuid, features: &[FeatureRecord]) -> PipelineResult<i64> {
        let batches = features.len().div_ceil(self.batch_size);

        for (index, batch) in features.chunks(self.batch_size).enumerate() {
            let written = self
                .store
                .insert_batch(layer_id, batch)
                .await
                .map_err(|e| {
                    PipelineError::Load(format!("batch {} of {} failed: {}", index + 1, batches, e))
                })?;
            debug!(batch = index + 1, batches, written, "Feature batch written");
        }

        let persisted = self
            .store
            .count_features(layer_id)
            .await
            .map_err(|e| PipelineError::Load(format!("counting features: {}", e)))?;

        if persisted != features.len() as i64 {
            return Err(PipelineError::Load(format!(
                "persisted {} features, expected {}",
                persisted,
                features.len()
            )));
        }

        info!(%layer_id, persisted, "Features loaded");
        Ok(persisted)
    }

    /// Best-effort removal of rows written for a layer that will not be published
    pub async fn discard(&self, layer_id: Uuid) {
        match self.store.delete_features(layer_id).await {
            Ok(removed) => debug!(%layer_id, removed, "Discarded unpublished features"),
            Err(e) => warn!(%layer_id, error = %e, "Failed to discard unpublished features"),
        }
    }
}
