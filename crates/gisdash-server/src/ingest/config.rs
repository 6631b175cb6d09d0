//! Pipeline configuration
//!
//! Knobs for the ingestion pipeline and the queue poller, read from
//! `PIPELINE_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_TOLERANCE_PCT: f64 = 10.0;
pub const DEFAULT_PRECISION: u32 = 6;
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const MAX_BATCH_SIZE: usize = 5000;
pub const DEFAULT_LEASE_SECS: u64 = 300;
pub const DEFAULT_MAX_CLAIMS: i32 = 3;
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_FETCH_RETRIES: u32 = 3;
pub const DEFAULT_FETCH_BACKOFF_MS: u64 = 500;
/// 10 MiB
pub const DEFAULT_SYNC_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_OUTPUT_BUCKET: &str = "gis_processed";
pub const DEFAULT_MAPSHAPER_BIN: &str = "mapshaper";

/// Property keys probed for a feature's pcode, in order. `{level}` is
/// replaced with the layer's admin level.
pub const DEFAULT_PCODE_KEYS: &[&str] = &["pcode", "PCODE", "ADM{level}_PCODE", "shapeID"];

/// Property keys probed for a feature's display name
pub const DEFAULT_NAME_KEYS: &[&str] = &["name", "NAME", "ADM{level}_EN", "shapeName"];

/// Which geometry converter backs the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConverterKind {
    #[default]
    Mapshaper,
    Remote,
}

impl FromStr for ConverterKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "mapshaper" => Ok(ConverterKind::Mapshaper),
            "remote" | "http" => Ok(ConverterKind::Remote),
            other => anyhow::bail!(
                "Invalid PIPELINE_CONVERTER: {}. Must be 'mapshaper' or 'remote'",
                other
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub poll_interval_secs: u64,
    /// Root under which each run gets its own scratch directory
    pub scratch_root: PathBuf,
    /// Simplification percentage handed to the converter, in (0, 100]
    pub tolerance_pct: f64,
    /// Decimal places kept in output coordinates
    pub precision: u32,
    pub batch_size: usize,
    pub lease_secs: u64,
    /// Claims allowed before a job with a lapsed lease is failed
    pub max_claims: i32,
    pub stage_timeout_secs: u64,
    pub fetch_retries: u32,
    pub fetch_backoff_ms: u64,
    /// `auto` submissions at or below this size run inline
    pub sync_max_bytes: u64,
    pub output_bucket: String,
    pub converter: ConverterKind,
    pub mapshaper_bin: String,
    pub converter_url: Option<String>,
    pub pcode_keys: Vec<String>,
    pub name_keys: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            scratch_root: default_scratch_root(),
            tolerance_pct: DEFAULT_TOLERANCE_PCT,
            precision: DEFAULT_PRECISION,
            batch_size: DEFAULT_BATCH_SIZE,
            lease_secs: DEFAULT_LEASE_SECS,
            max_claims: DEFAULT_MAX_CLAIMS,
            stage_timeout_secs: DEFAULT_STAGE_TIMEOUT_SECS,
            fetch_retries: DEFAULT_FETCH_RETRIES,
            fetch_backoff_ms: DEFAULT_FETCH_BACKOFF_MS,
            sync_max_bytes: DEFAULT_SYNC_MAX_BYTES,
            output_bucket: DEFAULT_OUTPUT_BUCKET.to_string(),
            converter: ConverterKind::Mapshaper,
            mapshaper_bin: DEFAULT_MAPSHAPER_BIN.to_string(),
            converter_url: None,
            pcode_keys: DEFAULT_PCODE_KEYS.iter().map(|k| k.to_string()).collect(),
            name_keys: DEFAULT_NAME_KEYS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

fn default_scratch_root() -> PathBuf {
    std::env::temp_dir().join("gisdash-scratch")
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: Vec<String>) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => {
            let keys: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if keys.is_empty() {
                default
            } else {
                keys
            }
        },
        Err(_) => default,
    }
}

impl PipelineConfig {
    /// Load pipeline configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let converter = match std::env::var("PIPELINE_CONVERTER") {
            Ok(raw) => raw.parse()?,
            Err(_) => defaults.converter,
        };

        let config = Self {
            poll_interval_secs: env_or("PIPELINE_POLL_INTERVAL_SECS", defaults.poll_interval_secs),
            scratch_root: std::env::var("PIPELINE_SCRATCH_ROOT")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.scratch_root),
            tolerance_pct: env_or("PIPELINE_TOLERANCE_PCT", defaults.tolerance_pct),
            precision: env_or("PIPELINE_PRECISION", defaults.precision),
            batch_size: env_or("PIPELINE_BATCH_SIZE", defaults.batch_size),
            lease_secs: env_or("PIPELINE_LEASE_SECS", defaults.lease_secs),
            max_claims: env_or("PIPELINE_MAX_CLAIMS", defaults.max_claims),
            stage_timeout_secs: env_or("PIPELINE_STAGE_TIMEOUT_SECS", defaults.stage_timeout_secs),
            fetch_retries: env_or("PIPELINE_FETCH_RETRIES", defaults.fetch_retries),
            fetch_backoff_ms: env_or("PIPELINE_FETCH_BACKOFF_MS", defaults.fetch_backoff_ms),
            sync_max_bytes: env_or("PIPELINE_SYNC_MAX_BYTES", defaults.sync_max_bytes),
            output_bucket: std::env::var("PIPELINE_OUTPUT_BUCKET")
                .unwrap_or(defaults.output_bucket),
            converter,
            mapshaper_bin: std::env::var("PIPELINE_MAPSHAPER_BIN")
                .unwrap_or(defaults.mapshaper_bin),
            converter_url: std::env::var("PIPELINE_CONVERTER_URL")
                .ok()
                .filter(|s| !s.is_empty()),
            pcode_keys: env_list("PIPELINE_PCODE_KEYS", defaults.pcode_keys),
            name_keys: env_list("PIPELINE_NAME_KEYS", defaults.name_keys),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_secs == 0 {
            anyhow::bail!("PIPELINE_POLL_INTERVAL_SECS must be greater than 0");
        }
        if !(self.tolerance_pct > 0.0 && self.tolerance_pct <= 100.0) {
            anyhow::bail!(
                "PIPELINE_TOLERANCE_PCT must be in (0, 100], got {}",
                self.tolerance_pct
            );
        }
        if self.precision > 15 {
            anyhow::bail!("PIPELINE_PRECISION must be at most 15, got {}", self.precision);
        }
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            anyhow::bail!(
                "PIPELINE_BATCH_SIZE must be between 1 and {}, got {}",
                MAX_BATCH_SIZE,
                self.batch_size
            );
        }
        if self.lease_secs < 3 {
            anyhow::bail!("PIPELINE_LEASE_SECS must be at least 3");
        }
        if self.max_claims < 1 {
            anyhow::bail!("PIPELINE_MAX_CLAIMS must be at least 1");
        }
        if self.stage_timeout_secs == 0 {
            anyhow::bail!("PIPELINE_STAGE_TIMEOUT_SECS must be greater than 0");
        }
        if self.output_bucket.trim().is_empty() {
            anyhow::bail!("PIPELINE_OUTPUT_BUCKET cannot be empty");
        }
        if self.converter == ConverterKind::Remote && self.converter_url.is_none() {
            anyhow::bail!("PIPELINE_CONVERTER_URL is required when PIPELINE_CONVERTER=remote");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    /// Heartbeat period: a third of the lease
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs((self.lease_secs / 3).max(1))
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn fetch_backoff(&self) -> Duration {
        Duration::from_millis(self.fetch_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "PIPELINE_POLL_INTERVAL_SECS",
        "PIPELINE_SCRATCH_ROOT",
        "PIPELINE_TOLERANCE_PCT",
        "PIPELINE_PRECISION",
        "PIPELINE_BATCH_SIZE",
        "PIPELINE_LEASE_SECS",
        "PIPELINE_MAX_CLAIMS",
        "PIPELINE_CONVERTER",
        "PIPELINE_CONVERTER_URL",
        "PIPELINE_PCODE_KEYS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_from_empty_env() {
        clear_env();
        let config = PipelineConfig::from_env().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.precision, 6);
        assert_eq!(config.output_bucket, "gis_processed");
        assert_eq!(config.converter, ConverterKind::Mapshaper);
        assert!(config.scratch_root.ends_with("gisdash-scratch"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        clear_env();
        std::env::set_var("PIPELINE_BATCH_SIZE", "1000");
        std::env::set_var("PIPELINE_TOLERANCE_PCT", "2.5");
        std::env::set_var("PIPELINE_PCODE_KEYS", "code, ADM{level}_PCODE");
        std::env::set_var("PIPELINE_SCRATCH_ROOT", "/var/tmp/gis");

        let config = PipelineConfig::from_env().unwrap();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.tolerance_pct, 2.5);
        assert_eq!(config.pcode_keys, vec!["code", "ADM{level}_PCODE"]);
        assert_eq!(config.scratch_root, PathBuf::from("/var/tmp/gis"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_remote_converter_requires_url() {
        clear_env();
        std::env::set_var("PIPELINE_CONVERTER", "remote");
        assert!(PipelineConfig::from_env().is_err());

        std::env::set_var("PIPELINE_CONVERTER_URL", "http://converter:8080/convert");
        let config = PipelineConfig::from_env().unwrap();
        assert_eq!(config.converter, ConverterKind::Remote);

        clear_env();
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = PipelineConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.batch_size = MAX_BATCH_SIZE + 1;
        assert!(config.validate().is_err());

        config.batch_size = 750;
        config.tolerance_pct = 0.0;
        assert!(config.validate().is_err());

        config.tolerance_pct = 100.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_heartbeat_is_third_of_lease() {
        let config = PipelineConfig {
            lease_secs: 300,
            ..Default::default()
        };
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(100));
    }

    #[test]
    fn test_converter_kind_parse() {
        assert_eq!("Mapshaper".parse::<ConverterKind>().unwrap(), ConverterKind::Mapshaper);
        assert_eq!("http".parse::<ConverterKind>().unwrap(), ConverterKind::Remote);
        assert!("gdal".parse::<ConverterKind>().is_err());
    }
}
