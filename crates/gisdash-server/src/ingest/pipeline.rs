//! Ingestion pipeline
//!
//! [`IngestPipeline::run`] is the one orchestration core behind both entry
//! paths. The HTTP submitter calls it inline with [`Trigger::Http`]; the
//! queue poller calls it for each claimed job with [`Trigger::Queue`].
//!
//! Stages run strictly in sequence, each under the configured wall-clock
//! ceiling:
//!
//! ```text
//! fetch -> extract -> convert -> load -> publish
//! ```
//!
//! Any error aborts the run. Feature rows written before the failure are
//! discarded and the scratch directory is always released.
//!
//! Queued runs pass a [`RunControl`]: its token interrupts every stage up to
//! load, and its [`PublishGate`] must confirm the worker still owns the job
//! before anything becomes visible.

use async_trait::async_trait;
use sqlx::PgPool;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::config::PipelineConfig;
use super::convert::{collection_len, converter_from_config, ConvertOptions, GeometryConverter};
use super::error::{PipelineError, PipelineResult, Stage, StoreError};
use super::fetcher::{ArchiveFetcher, ExtractedArchive, FetchPolicy};
use super::loader::{FeatureDecoder, FeatureLoader, FeatureStore};
use super::models::{IngestRequest, PipelineReport, Trigger};
use super::publisher::{PublishInput, Published, VersionCatalog, VersionPublisher};
use crate::db::catalog::PgCatalog;
use crate::storage::BlobStore;

/// Checked once, right before publishing
#[async_trait]
pub trait PublishGate: Send + Sync {
    /// `Ok(false)` means the run must not publish
    async fn confirm(&self) -> Result<bool, StoreError>;
}

/// Per-run controls supplied by the queue path
#[derive(Clone, Default)]
pub struct RunControl {
    /// Scratch directory name; the run id when unset
    pub scratch_key: Option<String>,
    pub cancel: CancellationToken,
    pub gate: Option<Arc<dyn PublishGate>>,
}

pub struct IngestPipeline {
    config: PipelineConfig,
    blobs: Arc<dyn BlobStore>,
    fetcher: ArchiveFetcher,
    converter: Arc<dyn GeometryConverter>,
    decoder: FeatureDecoder,
    loader: FeatureLoader,
    publisher: VersionPublisher,
}

impl IngestPipeline {
    pub fn new(
        config: PipelineConfig,
        blobs: Arc<dyn BlobStore>,
        converter: Arc<dyn GeometryConverter>,
        features: Arc<dyn FeatureStore>,
        catalog: Arc<dyn VersionCatalog>,
    ) -> Self {
        let fetcher = ArchiveFetcher::new(
            blobs.clone(),
            config.scratch_root.clone(),
            FetchPolicy {
                retries: config.fetch_retries,
                backoff: config.fetch_backoff(),
            },
        );
        let decoder = FeatureDecoder::new(config.pcode_keys.clone(), config.name_keys.clone());
        let loader = FeatureLoader::new(features, config.batch_size);
        let publisher = VersionPublisher::new(blobs.clone(), catalog, config.output_bucket.clone());

        Self {
            config,
            blobs,
            fetcher,
            converter,
            decoder,
            loader,
            publisher,
        }
    }

    /// Pipeline backed by Postgres, with the converter chosen by config
    pub fn postgres(
        config: PipelineConfig,
        pool: PgPool,
        blobs: Arc<dyn BlobStore>,
    ) -> anyhow::Result<Self> {
        let converter = converter_from_config(&config)?;
        let catalog = Arc::new(PgCatalog::new(pool));
        Ok(Self::new(config, blobs, converter, catalog.clone(), catalog))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Run every stage for `request` with no external controls
    pub async fn run(
        &self,
        run_id: Uuid,
        request: &IngestRequest,
        trigger: Trigger,
    ) -> PipelineResult<PipelineReport> {
        self.run_with(run_id, request, trigger, RunControl::default())
            .await
    }

    /// Run every stage for `request` under `control`
    #[instrument(
        skip(self, request, trigger, control),
        fields(
            trigger = trigger.as_str(),
            country_iso = %request.country,
            version_id = %request.target.version_id,
        )
    )]
    pub async fn run_with(
        &self,
        run_id: Uuid,
        request: &IngestRequest,
        trigger: Trigger,
        control: RunControl,
    ) -> PipelineResult<PipelineReport> {
        request.validate()?;
        let started = Instant::now();
        info!(bucket = %request.source.bucket, path = %request.source.path, "Pipeline run started");

        let scratch_key = control
            .scratch_key
            .clone()
            .unwrap_or_else(|| run_id.to_string());
        let data = self
            .interruptible(Stage::Fetch, &control, self.fetcher.fetch(&request.source))
            .await?;
        let archive = self
            .interruptible(
                Stage::Extract,
                &control,
                self.fetcher
                    .extract(data, request.source.file_name(), &scratch_key),
            )
            .await?;

        let layer_id = Uuid::new_v4();
        let outcome = self.process(&archive, request, layer_id, &control).await;

        if let Err(e) = archive.release().await {
            warn!(error = %e, "Failed to release scratch directory");
        }

        match outcome {
            Ok(published) => {
                info!(
                    %layer_id,
                    feature_count = published.layer.feature_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Pipeline run finished"
                );
                Ok(PipelineReport {
                    run_id,
                    trigger,
                    country_iso: request.country.to_string(),
                    version_id: published.version.id,
                    layer_id,
                    feature_count: published.layer.feature_count,
                    output_bucket: published.upload.bucket,
                    output_key: published.upload.key,
                    checksum: published.upload.checksum,
                })
            },
            Err(e) => {
                self.loader.discard(layer_id).await;
                warn!(kind = e.kind(), error = %e, "Pipeline run failed");
                Err(e)
            },
        }
    }

    async fn process(
        &self,
        archive: &ExtractedArchive,
        request: &IngestRequest,
        layer_id: Uuid,
        control: &RunControl,
    ) -> PipelineResult<Published> {
        let options = ConvertOptions::from_config(&self.config);
        let conversion = self
            .interruptible(
                Stage::Convert,
                control,
                self.converter.convert(archive, options),
            )
            .await?;

        let produced = collection_len(&conversion.collection)?;
        if produced == 0 {
            return Err(PipelineError::Conversion(
                "converter produced no features".to_string(),
            ));
        }
        if produced != conversion.feature_count {
            return Err(PipelineError::Conversion(format!(
                "{} reported {} features but produced {}",
                self.converter.name(),
                conversion.feature_count,
                produced
            )));
        }
        info!(stage = %Stage::Convert, feature_count = produced, "Conversion finished");

        let records = self
            .decoder
            .decode(&conversion.collection, request.target.admin_level)?;
        let persisted = self
            .interruptible(Stage::Load, control, self.loader.load(layer_id, &records))
            .await?;

        if control.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(
                "lease lost before publish".to_string(),
            ));
        }
        if let Some(gate) = &control.gate {
            if !gate.confirm().await? {
                return Err(PipelineError::Cancelled(
                    "lease lost before publish".to_string(),
                ));
            }
        }

        // publish is not interruptible; it either activates or rolls back
        self.within(
            Stage::Publish,
            self.publisher.publish(PublishInput {
                country: &request.country,
                target: &request.target,
                layer_id,
                feature_count: persisted,
                collection: &conversion.collection,
            }),
        )
        .await
    }

    async fn interruptible<T>(
        &self,
        stage: Stage,
        control: &RunControl,
        future: impl Future<Output = PipelineResult<T>>,
    ) -> PipelineResult<T> {
        tokio::select! {
            biased;
            _ = control.cancel.cancelled() => Err(PipelineError::Cancelled(format!(
                "{} stage interrupted",
                stage
            ))),
            result = self.within(stage, future) => result,
        }
    }

    async fn within<T>(
        &self,
        stage: Stage,
        future: impl Future<Output = PipelineResult<T>>,
    ) -> PipelineResult<T> {
        match tokio::time::timeout(self.config.stage_timeout(), future).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::Timeout {
                stage,
                secs: self.config.stage_timeout_secs,
            }),
        }
    }
}
