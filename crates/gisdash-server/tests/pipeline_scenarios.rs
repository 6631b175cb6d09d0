//! End-to-end pipeline scenarios over the in-memory backends
//!
//! Covers the published behaviour of one ingestion run:
//! - happy path with batched loading
//! - corrupt archives and failing conversions leave nothing behind
//! - concurrent publishes for one country keep exactly one active version
//! - a failed batch leaves no partial layer
//! - resubmission replaces the active version only on success
//! - stage timeouts
//!
//! **Running tests**:
//! ```bash
//! cargo test --test pipeline_scenarios
//! ```

mod common;

use common::{request, shapefile_zip, zip_bytes, Harness};
use gisdash_common::checksum::sha256_hex;
use gisdash_common::types::JobStatus;
use gisdash_server::ingest::config::DEFAULT_OUTPUT_BUCKET;
use gisdash_server::ingest::memory::{synthetic_collection, FailingConverter, StaticConverter};
use gisdash_server::ingest::{PipelineError, PollOutcome, Stage, Trigger};
use gisdash_server::storage::{BlobStore, GEOJSON_CONTENT_TYPE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Scenario A: happy path
// ============================================================================

#[tokio::test]
async fn test_happy_path_publishes_all_features() {
    let h = Harness::with_features(1610, 2);
    h.upload("uploads/phl_adm2.zip", &shapefile_zip("phl_adm2"));

    let report = h
        .run(&request("PHL", "v1", "uploads/phl_adm2.zip", 2))
        .await
        .unwrap();

    assert_eq!(report.trigger, Trigger::Http);
    assert_eq!(report.country_iso, "PHL");
    assert_eq!(report.version_id, "v1");
    assert_eq!(report.feature_count, 1610);

    // 500-row batches
    assert_eq!(h.catalog.batch_sizes(), vec![500, 500, 500, 110]);
    assert_eq!(h.catalog.total_features(), 1610);

    let layers = h.catalog.layers();
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].id, report.layer_id);
    assert_eq!(layers[0].feature_count, 1610);
    assert_eq!(layers[0].admin_level, 2);

    let version = h.catalog.version("v1").unwrap();
    assert!(version.is_active);
    assert!(version.activated_at.is_some());
    assert_eq!(h.catalog.active_count("PHL"), 1);

    assert_eq!(report.output_bucket, DEFAULT_OUTPUT_BUCKET);
    let published = h.blobs.object(&report.output_bucket, &report.output_key).unwrap();
    assert_eq!(sha256_hex(&published), report.checksum);
    assert_eq!(
        h.blobs
            .content_type(&report.output_bucket, &report.output_key)
            .as_deref(),
        Some(GEOJSON_CONTENT_TYPE)
    );
    let geojson: serde_json::Value = serde_json::from_slice(&published).unwrap();
    assert_eq!(geojson["features"].as_array().unwrap().len(), 1610);

    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn test_happy_path_through_queue() {
    let h = Harness::with_features(12, 1);
    h.upload("uploads/phl_adm1.zip", &shapefile_zip("phl_adm1"));

    let job = {
        use gisdash_server::ingest::JobQueue;
        h.queue
            .enqueue(&request("PHL", "v1", "uploads/phl_adm1.zip", 1))
            .await
            .unwrap()
    };

    let outcome = h.poller("worker-1").poll_once().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Processed {
            job_id: job.id,
            status: Some(JobStatus::Done),
        }
    );

    assert_eq!(
        h.queue.status_history(job.id),
        vec![JobStatus::Pending, JobStatus::Processing, JobStatus::Done]
    );
    let layers = h.catalog.layers();
    assert_eq!(layers.len(), 1);
    assert_eq!(layers[0].feature_count, h.catalog.total_features() as i64);
}

// ============================================================================
// Scenario B: corrupt input
// ============================================================================

#[tokio::test]
async fn test_corrupt_shapefile_fails_without_touching_active_version() {
    let h = Harness::with_features(20, 0);
    h.upload("uploads/phl_v1.zip", &shapefile_zip("phl"));
    h.run(&request("PHL", "v1", "uploads/phl_v1.zip", 0))
        .await
        .unwrap();

    // .shp without its .shx index
    h.upload(
        "uploads/phl_v2.zip",
        &zip_bytes(&[("phl.shp", b"shp"), ("phl.dbf", b"dbf")]),
    );

    let job = {
        use gisdash_server::ingest::JobQueue;
        h.queue
            .enqueue(&request("PHL", "v2", "uploads/phl_v2.zip", 0))
            .await
            .unwrap()
    };
    let outcome = h.poller("worker-1").poll_once().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Processed {
            job_id: job.id,
            status: Some(JobStatus::Failed),
        }
    );

    let failed = h.queue.jobs().into_iter().find(|j| j.id == job.id).unwrap();
    let message = failed.error_message.unwrap();
    assert!(message.starts_with("Extraction error"), "{}", message);
    assert!(message.contains(".shx"));
    assert!(failed.layer_id.is_none());

    assert_eq!(h.catalog.layers().len(), 1);
    assert!(h.catalog.version("v2").is_none());
    assert!(h.catalog.version("v1").unwrap().is_active);
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn test_unreadable_archive_is_extraction_error() {
    let h = Harness::with_features(3, 0);
    h.upload("uploads/broken.zip", b"PK\x03\x04 definitely not a zip");

    let err = h
        .run(&request("PHL", "v1", "uploads/broken.zip", 0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "extraction_error");
    assert!(h.catalog.versions().is_empty());
}

#[tokio::test]
async fn test_conversion_failure_discards_everything() {
    let h = Harness::new(Arc::new(FailingConverter::new("ring self-intersection")));
    h.upload("uploads/phl.zip", &shapefile_zip("phl"));

    let err = h
        .run(&request("PHL", "v1", "uploads/phl.zip", 0))
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Conversion(ref m) if m.contains("self-intersection")));
    assert!(h.catalog.layers().is_empty());
    assert_eq!(h.catalog.total_features(), 0);
    assert!(h.blobs.keys(DEFAULT_OUTPUT_BUCKET).is_empty());
    assert!(h.scratch_is_empty());
}

// ============================================================================
// Scenario C: concurrent publishes for one country
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishes_keep_one_active_version() {
    let h = Harness::with_features(400, 0);
    h.upload("uploads/phl_a.zip", &shapefile_zip("phl_a"));
    h.upload("uploads/phl_b.zip", &shapefile_zip("phl_b"));

    let stop = Arc::new(AtomicBool::new(false));
    let observer = {
        let catalog = h.catalog.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut seen_active = false;
            let mut violations = Vec::new();
            while !stop.load(Ordering::SeqCst) {
                let active = catalog.active_count("PHL");
                if active > 1 || (seen_active && active == 0) {
                    violations.push(active);
                }
                seen_active |= active == 1;
                tokio::task::yield_now().await;
            }
            violations
        })
    };

    let run_a = h.pipeline.run(
        uuid::Uuid::new_v4(),
        &request("PHL", "phl-a", "uploads/phl_a.zip", 0),
        Trigger::Queue,
    );
    let run_b = h.pipeline.run(
        uuid::Uuid::new_v4(),
        &request("PHL", "phl-b", "uploads/phl_b.zip", 0),
        Trigger::Queue,
    );
    let (a, b) = tokio::join!(run_a, run_b);

    stop.store(true, Ordering::SeqCst);
    let violations = observer.await.unwrap();

    assert!(a.is_ok() && b.is_ok());
    assert!(violations.is_empty(), "active counts seen: {:?}", violations);
    assert_eq!(h.catalog.active_count("PHL"), 1);
    assert_eq!(h.catalog.versions().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_pollers_never_run_the_same_job() {
    let h = Harness::with_features(50, 0);
    h.upload("uploads/phl.zip", &shapefile_zip("phl"));
    {
        use gisdash_server::ingest::JobQueue;
        h.queue
            .enqueue(&request("PHL", "v1", "uploads/phl.zip", 0))
            .await
            .unwrap();
    }

    let first = h.poller("worker-a");
    let second = h.poller("worker-b");
    let (a, b) = tokio::join!(first.poll_once(), second.poll_once());

    let processed = [a.unwrap(), b.unwrap()]
        .iter()
        .filter(|o| matches!(o, PollOutcome::Processed { .. }))
        .count();
    assert_eq!(processed, 1);
    assert_eq!(h.catalog.layers().len(), 1);
}

// ============================================================================
// Scenario D: a failed batch
// ============================================================================

#[tokio::test]
async fn test_failed_batch_leaves_nothing_partial() {
    let h = Harness::configured(
        Arc::new(StaticConverter::new(synthetic_collection(500, 0))),
        |config| config.batch_size = 100,
    );
    h.upload("uploads/phl.zip", &shapefile_zip("phl"));
    h.catalog.fail_batch(4);

    let job = {
        use gisdash_server::ingest::JobQueue;
        h.queue
            .enqueue(&request("PHL", "v1", "uploads/phl.zip", 0))
            .await
            .unwrap()
    };
    let outcome = h.poller("worker-1").poll_once().await.unwrap();
    assert_eq!(
        outcome,
        PollOutcome::Processed {
            job_id: job.id,
            status: Some(JobStatus::Failed),
        }
    );

    let failed = h.queue.jobs().into_iter().find(|j| j.id == job.id).unwrap();
    assert!(failed
        .error_message
        .unwrap()
        .contains("batch 4 of 5 failed"));

    // three batches landed before the failure, then were discarded
    assert_eq!(h.catalog.batch_sizes(), vec![100, 100, 100]);
    assert_eq!(h.catalog.total_features(), 0);
    assert!(h.catalog.layers().is_empty());
    assert_eq!(h.catalog.active_count("PHL"), 0);
}

// ============================================================================
// Resubmission
// ============================================================================

#[tokio::test]
async fn test_resubmission_replaces_active_only_on_success() {
    let h = Harness::with_features(10, 0);
    h.upload("uploads/phl.zip", &shapefile_zip("phl"));

    let first = h.run(&request("PHL", "v1", "uploads/phl.zip", 0)).await.unwrap();
    let v1_before = h.catalog.version("v1").unwrap();

    h.catalog.fail_batch(1);
    let err = h
        .run(&request("PHL", "v2", "uploads/phl.zip", 0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "load_error");
    assert_eq!(h.catalog.version("v1").unwrap(), v1_before);
    assert!(h.catalog.version("v2").is_none());

    let second = h.run(&request("PHL", "v2", "uploads/phl.zip", 0)).await.unwrap();
    assert_ne!(first.layer_id, second.layer_id);

    assert!(!h.catalog.version("v1").unwrap().is_active);
    assert!(h.catalog.version("v2").unwrap().is_active);
    assert_eq!(h.catalog.active_count("PHL"), 1);

    // the old layer and its upload stay as they were
    assert_eq!(h.catalog.layers().len(), 2);
    assert!(h.blobs.contains(&first.output_bucket, &first.output_key));
    assert_eq!(
        h.blobs.size(&first.output_bucket, &first.output_key).await.unwrap(),
        h.blobs.object(&first.output_bucket, &first.output_key).unwrap().len() as u64
    );
}

#[tokio::test]
async fn test_resubmitting_same_version_swaps_its_layer() {
    let h = Harness::with_features(8, 2);
    h.upload("uploads/phl_adm2.zip", &shapefile_zip("phl_adm2"));
    h.upload("uploads/phl_adm1.zip", &shapefile_zip("phl_adm1"));

    h.run(&request("PHL", "v1", "uploads/phl_adm1.zip", 1)).await.unwrap();
    let first = h.run(&request("PHL", "v1", "uploads/phl_adm2.zip", 2)).await.unwrap();

    // a failed republish leaves the active adm2 layer alone
    h.catalog.fail_batch(1);
    h.run(&request("PHL", "v1", "uploads/phl_adm2.zip", 2))
        .await
        .unwrap_err();
    let ids: Vec<_> = h.catalog.layers().iter().map(|l| l.id).collect();
    assert!(ids.contains(&first.layer_id));

    let second = h.run(&request("PHL", "v1", "uploads/phl_adm2.zip", 2)).await.unwrap();

    let layers = h.catalog.layers();
    let mut levels: Vec<i16> = layers.iter().map(|l| l.admin_level).collect();
    levels.sort();
    assert_eq!(levels, vec![1, 2]);
    assert!(layers.iter().any(|l| l.id == second.layer_id));
    assert!(!layers.iter().any(|l| l.id == first.layer_id));

    // the replaced layer's rows and output are gone
    assert_eq!(h.catalog.total_features(), 16);
    assert!(!h.blobs.contains(&first.output_bucket, &first.output_key));
    assert_eq!(h.catalog.active_count("PHL"), 1);
}

#[tokio::test]
async fn test_countries_are_independent() {
    let h = Harness::with_features(5, 0);
    h.upload("uploads/a.zip", &shapefile_zip("a"));

    h.run(&request("PHL", "phl-v1", "uploads/a.zip", 0)).await.unwrap();
    h.run(&request("KEN", "ken-v1", "uploads/a.zip", 0)).await.unwrap();

    assert_eq!(h.catalog.active_count("PHL"), 1);
    assert_eq!(h.catalog.active_count("KEN"), 1);
}

// ============================================================================
// Timeouts and retrieval
// ============================================================================

#[tokio::test]
async fn test_slow_conversion_times_out() {
    let converter = StaticConverter::new(synthetic_collection(3, 0)).with_delay(Duration::from_secs(3));
    let h = Harness::configured(Arc::new(converter), |config| config.stage_timeout_secs = 1);
    h.upload("uploads/phl.zip", &shapefile_zip("phl"));

    let err = h
        .run(&request("PHL", "v1", "uploads/phl.zip", 0))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Timeout {
            stage: Stage::Convert,
            secs: 1
        }
    ));
    assert_eq!(err.kind(), "timeout_error");
    assert!(h.catalog.versions().is_empty());
    assert!(h.scratch_is_empty());
}

#[tokio::test]
async fn test_transient_fetch_errors_are_retried() {
    let h = Harness::with_features(4, 0);
    h.upload("uploads/phl.zip", &shapefile_zip("phl"));
    h.blobs.fail_next_gets(2);

    h.run(&request("PHL", "v1", "uploads/phl.zip", 0)).await.unwrap();
    assert_eq!(h.blobs.get_calls(), 3);
}

#[tokio::test]
async fn test_missing_archive_is_not_retried() {
    let h = Harness::with_features(4, 0);

    let err = h
        .run(&request("PHL", "v1", "uploads/nope.zip", 0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "retrieval_error");
    assert_eq!(h.blobs.get_calls(), 1);
}
