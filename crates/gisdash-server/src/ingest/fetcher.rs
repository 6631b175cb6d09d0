//! Archive fetcher
//!
//! Downloads a raw upload from the blob store and unpacks it into the run's
//! scratch directory.
//!
//! # Supported inputs
//!
//! - **Zip** (`.zip`)
//! - **Tar.gz** (`.tar.gz`, `.tgz`)
//! - **Gzip** (`.gz`), a single compressed vector file
//! - A plain vector file (`.geojson`, `.json`, `.kml`, `.gpkg`, `.shp`)
//!
//! Formats are detected from magic bytes, falling back to the object name.
//! Entries are flattened to their file names, so a shapefile's components
//! always end up side by side.

use flate2::read::GzDecoder;
use std::collections::HashSet;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::cleanup::ScratchDir;
use super::error::{PipelineError, PipelineResult};
use super::models::SourceRef;
use crate::storage::BlobStore;

/// Vector file extensions in order of preference for the primary file
pub const PRIMARY_EXTENSIONS: &[&str] = &["shp", "geojson", "json", "gpkg", "kml"];

/// Sidecar files a shapefile cannot be read without
const SHAPEFILE_SIDECARS: &[&str] = &["dbf", "shx"];

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Gzip,
    Plain,
}

/// Bounded retry policy for transient download failures
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    /// Retries after the first attempt
    pub retries: u32,
    pub backoff: Duration,
}

impl FetchPolicy {
    /// Exponential delay before retry `attempt` (1-based), plus up to half
    /// of it again as jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self
            .backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        base + jitter(base / 2)
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let random = (Uuid::new_v4().as_u128() & u128::from(u64::MAX)) as u64;
    Duration::from_millis(random % (max_ms + 1))
}

/// Result of a successful extraction. Owns the scratch directory.
#[derive(Debug)]
pub struct ExtractedArchive {
    scratch: ScratchDir,
    pub primary: PathBuf,
    pub files: Vec<PathBuf>,
}

impl ExtractedArchive {
    pub fn dir(&self) -> &Path {
        self.scratch.path()
    }

    pub async fn release(self) -> std::io::Result<()> {
        self.scratch.release().await
    }
}

pub struct ArchiveFetcher {
    store: Arc<dyn BlobStore>,
    scratch_root: PathBuf,
    policy: FetchPolicy,
}

impl ArchiveFetcher {
    pub fn new(store: Arc<dyn BlobStore>, scratch_root: PathBuf, policy: FetchPolicy) -> Self {
        Self {
            store,
            scratch_root,
            policy,
        }
    }

    /// Download the raw archive. A missing object fails immediately;
    /// transient errors are retried per the policy.
    #[instrument(skip(self), fields(bucket = %source.bucket, path = %source.path))]
    pub async fn fetch(&self, source: &SourceRef) -> PipelineResult<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.store.get(&source.bucket, &source.path).await {
                Ok(data) => {
                    info!(bytes = data.len(), attempt = attempt + 1, "Fetched archive");
                    return Ok(data);
                },
                Err(e) if e.is_transient() && attempt < self.policy.retries => {
                    attempt += 1;
                    let delay = self.policy.delay(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying archive download"
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) => return Err(PipelineError::Retrieval(e)),
            }
        }
    }

    /// Unpack `data` into the scratch directory named `scratch_key`
    ///
    /// The directory is created and filled on the blocking pool. If this
    /// future is dropped (a stage timeout), the unpack stops at its next
    /// entry and removes the directory itself, after its last write.
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    pub async fn extract(
        &self,
        data: Vec<u8>,
        file_name: &str,
        scratch_key: &str,
    ) -> PipelineResult<ExtractedArchive> {
        let root = self.scratch_root.clone();
        let key = scratch_key.to_string();
        let name = file_name.to_string();
        let abandon = CancellationToken::new();
        let _abandon_on_drop = abandon.clone().drop_guard();

        let extracted = tokio::task::spawn_blocking(move || -> PipelineResult<ExtractedArchive> {
            let scratch = ScratchDir::create(&root, &key).map_err(|e| {
                PipelineError::Extraction(format!("creating scratch directory: {}", e))
            })?;
            // an error drops `scratch` here, removing the directory
            let files = unpack(&data, &name, scratch.path(), &abandon)?;
            let primary = select_primary(&files)?;
            Ok(ExtractedArchive {
                scratch,
                primary,
                files,
            })
        })
        .await
        .map_err(|e| PipelineError::Extraction(format!("extraction task failed: {}", e)))
        .and_then(|result| result)?;
        debug!(
            files = extracted.files.len(),
            primary = %extracted.primary.display(),
            "Extracted archive"
        );
        Ok(extracted)
    }
}

/// Detect the archive format from magic bytes, then the file name
pub fn detect_kind(data: &[u8], file_name: &str) -> ArchiveKind {
    let lower = file_name.to_ascii_lowercase();

    if data.starts_with(ZIP_MAGIC) || data.starts_with(ZIP_EMPTY_MAGIC) {
        return ArchiveKind::Zip;
    }
    if data.starts_with(GZIP_MAGIC) {
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") || gzip_wraps_tar(data) {
            return ArchiveKind::TarGz;
        }
        return ArchiveKind::Gzip;
    }

    if lower.ends_with(".zip") {
        ArchiveKind::Zip
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        ArchiveKind::TarGz
    } else if lower.ends_with(".gz") {
        ArchiveKind::Gzip
    } else {
        ArchiveKind::Plain
    }
}

/// Peek at the first tar header inside a gzip stream
fn gzip_wraps_tar(data: &[u8]) -> bool {
    let mut header = [0u8; 512];
    let mut decoder = GzDecoder::new(data);
    let mut read = 0;
    while read < header.len() {
        match decoder.read(&mut header[read..]) {
            Ok(0) | Err(_) => break,
            Ok(n) => read += n,
        }
    }
    read == header.len() && &header[257..262] == b"ustar"
}

/// Flattened file name for an archive entry. `Ok(None)` means skip it.
pub fn entry_file_name(raw: &str) -> PipelineResult<Option<String>> {
    let normalized = raw.replace('\\', "/");

    if normalized.split('/').any(|segment| segment == "..") {
        return Err(PipelineError::Extraction(format!(
            "archive entry escapes the scratch directory: {}",
            raw
        )));
    }
    if normalized.ends_with('/') {
        return Ok(None);
    }
    if normalized.split('/').any(|segment| segment == "__MACOSX") {
        return Ok(None);
    }

    let name = normalized.rsplit('/').next().unwrap_or("").trim();
    if name.is_empty() || name.starts_with('.') {
        return Ok(None);
    }
    Ok(Some(name.to_string()))
}

/// Unpack into `dir`, returning the written paths. Blocking. Stops before
/// the next write once `abandon` is cancelled.
fn unpack(
    data: &[u8],
    file_name: &str,
    dir: &Path,
    abandon: &CancellationToken,
) -> PipelineResult<Vec<PathBuf>> {
    if data.is_empty() {
        return Err(PipelineError::Extraction("archive is empty".to_string()));
    }

    let kind = detect_kind(data, file_name);
    debug!(?kind, file_name, "Detected archive kind");

    let mut writer = EntryWriter::new(dir, abandon);
    match kind {
        ArchiveKind::Zip => unpack_zip(data, &mut writer)?,
        ArchiveKind::TarGz => unpack_tar_gz(data, &mut writer)?,
        ArchiveKind::Gzip => {
            let mut decompressed = Vec::new();
            GzDecoder::new(data)
                .read_to_end(&mut decompressed)
                .map_err(|e| PipelineError::Extraction(format!("invalid gzip data: {}", e)))?;
            let inner = strip_suffix_ignore_case(file_name, ".gz");
            writer.write(inner, &decompressed)?;
        },
        ArchiveKind::Plain => writer.write(file_name, data)?,
    }

    if writer.files.is_empty() {
        return Err(PipelineError::Extraction(
            "archive contains no files".to_string(),
        ));
    }
    Ok(writer.files)
}

fn strip_suffix_ignore_case<'a>(name: &'a str, suffix: &str) -> &'a str {
    if name.len() > suffix.len() && name.to_ascii_lowercase().ends_with(suffix) {
        &name[..name.len() - suffix.len()]
    } else {
        name
    }
}

struct EntryWriter<'a> {
    dir: &'a Path,
    abandon: &'a CancellationToken,
    seen: HashSet<String>,
    files: Vec<PathBuf>,
}

impl<'a> EntryWriter<'a> {
    fn new(dir: &'a Path, abandon: &'a CancellationToken) -> Self {
        Self {
            dir,
            abandon,
            seen: HashSet::new(),
            files: Vec::new(),
        }
    }

    fn write(&mut self, raw_name: &str, contents: &[u8]) -> PipelineResult<()> {
        if self.abandon.is_cancelled() {
            return Err(PipelineError::Extraction("extraction abandoned".to_string()));
        }
        let Some(name) = entry_file_name(raw_name)? else {
            return Ok(());
        };
        if !self.seen.insert(name.to_ascii_lowercase()) {
            return Err(PipelineError::Extraction(format!(
                "archive contains more than one file named {}",
                name
            )));
        }

        let path = self.dir.join(&name);
        std::fs::write(&path, contents)
            .map_err(|e| PipelineError::Extraction(format!("writing {}: {}", name, e)))?;
        self.files.push(path);
        Ok(())
    }
}

fn unpack_zip(data: &[u8], writer: &mut EntryWriter<'_>) -> PipelineResult<()> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))
        .map_err(|e| PipelineError::Extraction(format!("invalid zip archive: {}", e)))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| PipelineError::Extraction(format!("reading zip entry {}: {}", index, e)))?;
        if entry.is_dir() {
            continue;
        }

        let name = entry.name().to_string();
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| PipelineError::Extraction(format!("reading {}: {}", name, e)))?;
        writer.write(&name, &contents)?;
    }
    Ok(())
}

fn unpack_tar_gz(data: &[u8], writer: &mut EntryWriter<'_>) -> PipelineResult<()> {
    let mut archive = tar::Archive::new(GzDecoder::new(data));
    let entries = archive
        .entries()
        .map_err(|e| PipelineError::Extraction(format!("invalid tar archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| PipelineError::Extraction(format!("reading tar entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let name = entry
            .path()
            .map_err(|e| PipelineError::Extraction(format!("tar entry path: {}", e)))?
            .to_string_lossy()
            .to_string();
        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .map_err(|e| PipelineError::Extraction(format!("reading {}: {}", name, e)))?;
        writer.write(&name, &contents)?;
    }
    Ok(())
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

/// Pick the vector file the converter should read
pub fn select_primary(files: &[PathBuf]) -> PipelineResult<PathBuf> {
    let mut sorted: Vec<&PathBuf> = files.iter().collect();
    sorted.sort();

    for wanted in PRIMARY_EXTENSIONS {
        let Some(primary) = sorted
            .iter()
            .find(|path| extension(path).as_deref() == Some(*wanted))
        else {
            continue;
        };

        if *wanted == "shp" {
            for sidecar in SHAPEFILE_SIDECARS {
                let present = sorted.iter().any(|other| {
                    other.file_stem() == primary.file_stem()
                        && extension(other).as_deref() == Some(*sidecar)
                });
                if !present {
                    return Err(PipelineError::Extraction(format!(
                        "shapefile {} is missing its .{} file",
                        primary.display(),
                        sidecar
                    )));
                }
            }
        }
        return Ok(PathBuf::clone(primary));
    }

    Err(PipelineError::Extraction(format!(
        "no supported vector file found (expected one of: {})",
        PRIMARY_EXTENSIONS.join(", ")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::memory::MemoryBlobStore;
    use std::io::Write;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
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

    fn tar_gz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn fetcher(store: Arc<MemoryBlobStore>, root: &Path) -> ArchiveFetcher {
        ArchiveFetcher::new(
            store,
            root.to_path_buf(),
            FetchPolicy {
                retries: 2,
                backoff: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn test_detect_kind() {
        let zip = zip_bytes(&[("a.geojson", b"{}")]);
        assert_eq!(detect_kind(&zip, "upload.bin"), ArchiveKind::Zip);

        let tgz = tar_gz_bytes(&[("a.geojson", b"{}")]);
        assert_eq!(detect_kind(&tgz, "upload.bin"), ArchiveKind::TarGz);

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(b"{\"type\":\"FeatureCollection\"}").unwrap();
        let gz = gz.finish().unwrap();
        assert_eq!(detect_kind(&gz, "phl.geojson.gz"), ArchiveKind::Gzip);

        assert_eq!(detect_kind(b"{}", "phl.geojson"), ArchiveKind::Plain);
        assert_eq!(detect_kind(b"garbage", "phl.zip"), ArchiveKind::Zip);
    }

    #[test]
    fn test_entry_file_name_rules() {
        assert_eq!(
            entry_file_name("PHL/adm2/phl_adm2.shp").unwrap(),
            Some("phl_adm2.shp".to_string())
        );
        assert_eq!(entry_file_name("PHL\\phl.dbf").unwrap(), Some("phl.dbf".to_string()));
        assert_eq!(entry_file_name("PHL/").unwrap(), None);
        assert_eq!(entry_file_name("__MACOSX/PHL/._phl.shp").unwrap(), None);
        assert_eq!(entry_file_name("PHL/.DS_Store").unwrap(), None);
        assert!(entry_file_name("../../etc/passwd").is_err());
    }

    #[test]
    fn test_select_primary_priority() {
        let files = vec![
            PathBuf::from("/s/readme.json"),
            PathBuf::from("/s/phl.geojson"),
            PathBuf::from("/s/phl.kml"),
        ];
        assert_eq!(select_primary(&files).unwrap(), PathBuf::from("/s/phl.geojson"));

        let files = vec![
            PathBuf::from("/s/phl.geojson"),
            PathBuf::from("/s/phl.SHP"),
            PathBuf::from("/s/phl.dbf"),
            PathBuf::from("/s/phl.shx"),
        ];
        assert_eq!(select_primary(&files).unwrap(), PathBuf::from("/s/phl.SHP"));
    }

    #[test]
    fn test_select_primary_requires_shapefile_sidecars() {
        let files = vec![PathBuf::from("/s/phl.shp"), PathBuf::from("/s/phl.dbf")];
        let err = select_primary(&files).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(ref m) if m.contains(".shx")));

        let files = vec![PathBuf::from("/s/notes.txt")];
        assert!(matches!(select_primary(&files), Err(PipelineError::Extraction(_))));
    }

    #[test]
    fn test_fetch_policy_delay_grows() {
        let policy = FetchPolicy {
            retries: 3,
            backoff: Duration::from_millis(100),
        };
        let first = policy.delay(1);
        let third = policy.delay(3);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_extract_zip_flattens_and_picks_shapefile() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let data = zip_bytes(&[
            ("PHL/phl_adm1.shp", b"shp"),
            ("PHL/phl_adm1.shx", b"shx"),
            ("PHL/phl_adm1.dbf", b"dbf"),
            ("PHL/phl_adm1.prj", b"prj"),
            ("__MACOSX/PHL/._phl_adm1.shp", b"junk"),
        ]);

        let key = Uuid::new_v4().to_string();
        let archive = fetcher(store, root.path())
            .extract(data, "phl_adm1.zip", &key)
            .await
            .unwrap();

        assert_eq!(archive.files.len(), 4);
        assert_eq!(archive.primary, archive.dir().join("phl_adm1.shp"));
        assert!(archive.dir().ends_with(&key));

        let dir = archive.dir().to_path_buf();
        archive.release().await.unwrap();
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_extract_tar_gz_and_plain() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let fetcher = fetcher(store, root.path());

        let data = tar_gz_bytes(&[("ken/ken_adm0.geojson", b"{}")]);
        let archive = fetcher.extract(data, "ken.tgz", "ken-tgz").await.unwrap();
        assert!(archive.primary.ends_with("ken_adm0.geojson"));
        archive.release().await.unwrap();

        let archive = fetcher
            .extract(b"{}".to_vec(), "ken_adm0.geojson", "ken-plain")
            .await
            .unwrap();
        assert!(archive.primary.ends_with("ken_adm0.geojson"));
        archive.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_extract_failure_releases_scratch() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let key = Uuid::new_v4().to_string();

        let err = fetcher(store, root.path())
            .extract(b"PK\x03\x04 truncated".to_vec(), "broken.zip", &key)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Extraction(_)));
        assert!(!root.path().join(&key).exists());
    }

    #[test]
    fn test_abandoned_unpack_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let data = zip_bytes(&[("a.geojson", b"{}"), ("b.geojson", b"{}")]);
        let abandon = CancellationToken::new();
        abandon.cancel();

        let err = unpack(&data, "phl.zip", dir.path(), &abandon).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction(ref m) if m.contains("abandoned")));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_timed_out_extract_leaves_no_scratch() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let payload = vec![b'x'; 16 * 1024];
        let names: Vec<String> = (0..2000).map(|i| format!("part_{}.geojson", i)).collect();
        let entries: Vec<(&str, &[u8])> = names
            .iter()
            .map(|name| (name.as_str(), payload.as_slice()))
            .collect();
        let data = zip_bytes(&entries);

        let fetcher = fetcher(store, root.path());
        let outcome =
            tokio::time::timeout(Duration::from_millis(1), fetcher.extract(data, "big.zip", "slow"))
                .await;
        if let Ok(Ok(archive)) = outcome {
            archive.release().await.unwrap();
        }

        // the blocking task removes the directory once it notices
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            if std::fs::read_dir(root.path()).unwrap().count() == 0 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "scratch directory left behind");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_fetch_retries_transient_errors_only() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("gis_raw", "phl.zip", b"payload".to_vec());
        store.fail_next_gets(2);

        let fetcher = fetcher(store.clone(), root.path());
        let data = fetcher
            .fetch(&SourceRef::new("gis_raw", "phl.zip"))
            .await
            .unwrap();
        assert_eq!(data, b"payload");
        assert_eq!(store.get_calls(), 3);

        let err = fetcher
            .fetch(&SourceRef::new("gis_raw", "missing.zip"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Retrieval(crate::storage::BlobError::NotFound { .. })
        ));
        assert_eq!(store.get_calls(), 4);
    }

    #[tokio::test]
    async fn test_fetch_gives_up_after_retries() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        store.insert("gis_raw", "phl.zip", b"payload".to_vec());
        store.fail_next_gets(5);

        let err = fetcher(store.clone(), root.path())
            .fetch(&SourceRef::new("gis_raw", "phl.zip"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Retrieval(_)));
        assert_eq!(store.get_calls(), 3);
    }
}
