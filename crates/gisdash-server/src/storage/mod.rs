//! Blob storage
//!
//! The pipeline only needs four operations on object storage, captured by
//! [`BlobStore`]. [`Storage`] implements them on top of S3 (or MinIO);
//! `MemoryBlobStore` (behind the `test-support` feature) implements them in
//! memory for tests.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    primitives::ByteStream,
    Client,
};
use gisdash_common::checksum::sha256_hex;
use thiserror::Error;
use tracing::{debug, info, instrument};

pub mod config;

pub const GEOJSON_CONTENT_TYPE: &str = "application/geo+json";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("incomplete transfer of {bucket}/{key}: expected {expected} bytes, received {received}")]
    Incomplete {
        bucket: String,
        key: String,
        expected: u64,
        received: u64,
    },

    #[error("blob store error: {0}")]
    Backend(String),
}

impl BlobError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        Self::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    /// Whether retrying the same request could succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, BlobError::NotFound { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub bucket: String,
    pub key: String,
    pub checksum: String,
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Download a whole object. A short read is reported as
    /// [`BlobError::Incomplete`], never as success.
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<UploadResult, BlobError>;

    /// Object size in bytes, without downloading it
    async fn size(&self, bucket: &str, key: &str) -> Result<u64, BlobError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobError>;
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    default_bucket: String,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> anyhow::Result<Self> {
        debug!(endpoint = ?config.endpoint, region = %config.region, "Initializing storage");

        let region = Region::new(config.region.clone());
        let builder = match config.static_credentials() {
            Some((access_key, secret_key)) => aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "gisdash-storage",
                )),
            None => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region.clone())
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };

        let mut builder = builder.region(region).force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        info!(default_bucket = %config.bucket, "Storage client initialized");

        Ok(Self {
            client,
            default_bucket: config.bucket,
        })
    }

    pub fn default_bucket(&self) -> &str {
        &self.default_bucket
    }
}

#[async_trait]
impl BlobStore for Storage {
    #[instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BlobError> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    BlobError::not_found(bucket, key)
                } else {
                    BlobError::Backend(format!("GET {}/{}: {}", bucket, key, service))
                }
            })?;

        let expected = response.content_length().and_then(|len| u64::try_from(len).ok());

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| BlobError::Backend(format!("reading {}/{}: {}", bucket, key, e)))?
            .into_bytes()
            .to_vec();

        let received = data.len() as u64;
        if let Some(expected) = expected {
            if expected != received {
                return Err(BlobError::Incomplete {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    expected,
                    received,
                });
            }
        }

        debug!(bytes = received, "Downloaded {}/{}", bucket, key);
        Ok(data)
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<UploadResult, BlobError> {
        let checksum = sha256_hex(&data);
        let size = data.len() as u64;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                BlobError::Backend(format!("PUT {}/{}: {}", bucket, key, e.into_service_error()))
            })?;

        info!(size, "Uploaded {}/{}", bucket, key);

        Ok(UploadResult {
            bucket: bucket.to_string(),
            key: key.to_string(),
            checksum,
            size,
        })
    }

    #[instrument(skip(self))]
    async fn size(&self, bucket: &str, key: &str) -> Result<u64, BlobError> {
        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_not_found() {
                    BlobError::not_found(bucket, key)
                } else {
                    BlobError::Backend(format!("HEAD {}/{}: {}", bucket, key, service))
                }
            })?;

        Ok(response
            .content_length()
            .and_then(|len| u64::try_from(len).ok())
            .unwrap_or(0))
    }

    #[instrument(skip(self))]
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BlobError> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                BlobError::Backend(format!(
                    "DELETE {}/{}: {}",
                    bucket,
                    key,
                    e.into_service_error()
                ))
            })?;

        debug!("Deleted {}/{}", bucket, key);
        Ok(())
    }
}
