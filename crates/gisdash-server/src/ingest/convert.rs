//! Geometry conversion
//!
//! The converter is a black box: it reads the extracted vector data and
//! returns a simplified GeoJSON `FeatureCollection` plus the number of
//! features it produced. The orchestration core never looks past this
//! contract.

use async_trait::async_trait;
use serde_json::Value;
use std::io::{Cursor, Write};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::config::{ConverterKind, PipelineConfig};
use super::error::{PipelineError, PipelineResult};
use super::fetcher::ExtractedArchive;

/// Output file written by the CLI converter inside the scratch directory
const CLI_OUTPUT_FILE: &str = "converted.geojson";

/// Maximum stderr carried into a `ConversionError`
const MAX_STDERR_CHARS: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConvertOptions {
    pub tolerance_pct: f64,
    /// Decimal places kept in output coordinates
    pub precision: u32,
}

impl ConvertOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            tolerance_pct: config.tolerance_pct,
            precision: config.precision,
        }
    }

    /// Coordinate rounding step, e.g. `0.000001` for 6 decimal places
    pub fn precision_step(&self) -> String {
        if self.precision == 0 {
            return "1".to_string();
        }
        format!("0.{}1", "0".repeat(self.precision as usize - 1))
    }
}

#[derive(Debug, Clone)]
pub struct Conversion {
    pub collection: Value,
    /// Feature count as reported by the converter
    pub feature_count: usize,
}

#[async_trait]
pub trait GeometryConverter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn convert(
        &self,
        archive: &ExtractedArchive,
        options: ConvertOptions,
    ) -> PipelineResult<Conversion>;
}

/// Build the converter selected by `PIPELINE_CONVERTER`
pub fn converter_from_config(config: &PipelineConfig) -> anyhow::Result<Arc<dyn GeometryConverter>> {
    match config.converter {
        ConverterKind::Mapshaper => Ok(Arc::new(MapshaperConverter::new(&config.mapshaper_bin))),
        ConverterKind::Remote => {
            let url = config
                .converter_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("PIPELINE_CONVERTER_URL is not set"))?;
            Ok(Arc::new(RemoteConverter::new(url)))
        },
    }
}

/// Number of features in a GeoJSON `FeatureCollection`
pub fn collection_len(collection: &Value) -> PipelineResult<usize> {
    if collection.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        return Err(PipelineError::Conversion(
            "converter output is not a GeoJSON FeatureCollection".to_string(),
        ));
    }
    collection
        .get("features")
        .and_then(Value::as_array)
        .map(Vec::len)
        .ok_or_else(|| {
            PipelineError::Conversion("FeatureCollection has no features array".to_string())
        })
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Runs the `mapshaper` CLI as a subprocess
pub struct MapshaperConverter {
    bin: String,
}

impl MapshaperConverter {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl GeometryConverter for MapshaperConverter {
    fn name(&self) -> &'static str {
        "mapshaper"
    }

    #[instrument(skip(self, archive), fields(input = %archive.primary.display()))]
    async fn convert(
        &self,
        archive: &ExtractedArchive,
        options: ConvertOptions,
    ) -> PipelineResult<Conversion> {
        let output_path = archive.dir().join(CLI_OUTPUT_FILE);

        let output = Command::new(&self.bin)
            .arg(&archive.primary)
            .arg("-simplify")
            .arg(format!("{}%", options.tolerance_pct))
            .arg("keep-shapes")
            .arg("-o")
            .arg(&output_path)
            .arg("format=geojson")
            .arg(format!("precision={}", options.precision_step()))
            .arg("force")
            .current_dir(archive.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PipelineError::Conversion(format!("failed to run {}: {}", self.bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Conversion(format!(
                "{} exited with {}: {}",
                self.bin,
                output.status,
                truncate_chars(stderr.trim(), MAX_STDERR_CHARS)
            )));
        }

        let bytes = tokio::fs::read(&output_path).await.map_err(|e| {
            PipelineError::Conversion(format!("reading {}: {}", output_path.display(), e))
        })?;
        let collection: Value = serde_json::from_slice(&bytes)
            .map_err(|e| PipelineError::Conversion(format!("invalid GeoJSON output: {}", e)))?;
        let feature_count = collection_len(&collection)?;

        debug!(feature_count, "mapshaper conversion finished");

        Ok(Conversion {
            collection,
            feature_count,
        })
    }
}

/// POSTs the extracted data to an HTTP conversion service
pub struct RemoteConverter {
    client: reqwest::Client,
    url: String,
}

impl RemoteConverter {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    /// Body and file name to upload: a lone file as-is, several files
    /// re-bundled as a zip so sidecars travel with the primary file
    async fn request_body(archive: &ExtractedArchive) -> PipelineResult<(Vec<u8>, String)> {
        let primary_name = file_name(&archive.primary)?;

        if archive.files.len() == 1 {
            let bytes = tokio::fs::read(&archive.primary).await.map_err(|e| {
                PipelineError::Conversion(format!("reading {}: {}", primary_name, e))
            })?;
            return Ok((bytes, primary_name));
        }

        let files = archive.files.clone();
        let bundle = tokio::task::spawn_blocking(move || bundle_zip(&files))
            .await
            .map_err(|e| PipelineError::Conversion(format!("bundling task failed: {}", e)))??;
        Ok((bundle, format!("{}.zip", primary_name)))
    }
}

fn file_name(path: &Path) -> PipelineResult<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| PipelineError::Conversion(format!("bad file name: {}", path.display())))
}

fn bundle_zip(files: &[std::path::PathBuf]) -> PipelineResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default();
        for path in files {
            let name = file_name(path)?;
            let contents = std::fs::read(path)
                .map_err(|e| PipelineError::Conversion(format!("reading {}: {}", name, e)))?;
            zip.start_file(name.as_str(), options)
                .and_then(|_| zip.write_all(&contents).map_err(Into::into))
                .map_err(|e| PipelineError::Conversion(format!("bundling {}: {}", name, e)))?;
        }
        zip.finish()
            .map_err(|e| PipelineError::Conversion(format!("bundling archive: {}", e)))?;
    }
    Ok(buffer.into_inner())
}

#[async_trait]
impl GeometryConverter for RemoteConverter {
    fn name(&self) -> &'static str {
        "remote"
    }

    #[instrument(skip(self, archive), fields(url = %self.url))]
    async fn convert(
        &self,
        archive: &ExtractedArchive,
        options: ConvertOptions,
    ) -> PipelineResult<Conversion> {
        let (body, filename) = Self::request_body(archive).await?;

        let response = self
            .client
            .post(&self.url)
            .query(&[
                ("tolerance_pct", options.tolerance_pct.to_string()),
                ("precision", options.precision.to_string()),
                ("filename", filename),
            ])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| PipelineError::Conversion(format!("conversion service unreachable: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Conversion(format!(
                "conversion service returned {}: {}",
                status,
                truncate_chars(text.trim(), MAX_STDERR_CHARS)
            )));
        }

        let collection: Value = response
            .json()
            .await
            .map_err(|e| PipelineError::Conversion(format!("invalid GeoJSON response: {}", e)))?;
        let feature_count = collection_len(&collection)?;

        Ok(Conversion {
            collection,
            feature_count,
        })
    }
}
