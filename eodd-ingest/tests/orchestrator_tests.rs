//! End-to-end tests for the orchestration driver

mod helpers;

use eodd_ingest::db::StorePolicy;
use eodd_ingest::models::SceneState;
use eodd_ingest::services::{ExternalProcessor, Orchestrator, ProcessingJob, Stage, SyncFrom};
use helpers::{candidate, create_test_store, settings, FakeDownload, FakeSensor};
use std::sync::Mutex;

/// Processor that fails for remote ids listed in `failing`
#[derive(Default)]
struct RecordingProcessor {
    failing: Vec<String>,
    seen: Mutex<Vec<String>>,
}

impl ExternalProcessor for RecordingProcessor {
    async fn process(&self, job: ProcessingJob<'_>) -> Result<(), String> {
        self.seen.lock().unwrap().push(job.remote_id.to_string());
        if self.failing.iter().any(|id| id == job.remote_id) {
            Err(format!("exit status 2 for {}", job.local_path.display()))
        } else {
            Ok(())
        }
    }
}

#[tokio::test]
async fn test_full_run_reaches_processed() {
    let (dir, store) = create_test_store(StorePolicy::default()).await;
    let sensor = FakeSensor::new("A", dir.path().join("a")).with_products(vec![
        candidate("p1", 1),
        candidate("p2", 2),
        candidate("p3", 3),
    ]);

    let processor = RecordingProcessor {
        failing: vec!["p3".into()],
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(store.clone(), vec![sensor], settings(4, 8)).with_processor(processor);

    let report = orchestrator.run(&Stage::ALL).await.unwrap();
    assert!(report.is_success());

    let outcome = &report.sensors[0];
    assert_eq!(outcome.sync.as_ref().unwrap().inserted, 3);
    assert_eq!(outcome.download.unwrap().downloaded, 3);
    assert_eq!(outcome.validation.unwrap().archived, 3);
    let processing = outcome.processing.unwrap();
    assert_eq!((processing.processed, processing.failed), (2, 1));

    let p1 = store.find_scene("A", "p1").await.unwrap().unwrap();
    assert_eq!(p1.state, SceneState::Processed);
    let p3 = store.find_scene("A", "p3").await.unwrap().unwrap();
    assert_eq!(p3.state, SceneState::ProcessingFailed);
    assert!(p3.last_error.unwrap().contains("exit status 2"));

    // Nothing left to do on a second run
    let again = orchestrator.run(&Stage::ALL).await.unwrap();
    let outcome = &again.sensors[0];
    assert_eq!(outcome.sync.as_ref().unwrap().inserted, 0);
    assert_eq!(outcome.download.unwrap().claimed, 0);
    assert_eq!(outcome.processing.unwrap().attempted, 0);

    let usage = store.recent_usage(100).await.unwrap();
    assert!(usage.iter().any(|u| u.stage == "run" && u.sensor_id == "NA"));
}

#[tokio::test]
async fn test_catalog_failure_isolated_to_one_sensor() {
    let (dir, store) = create_test_store(StorePolicy::default()).await;
    let healthy = FakeSensor::new("healthy", dir.path().join("h")).with_products(vec![candidate("h1", 1)]);
    let broken = FakeSensor::new("broken", dir.path().join("b")).with_products(vec![candidate("b1", 1)]);
    broken.add_catalog_failure("HTTP 502");

    let orchestrator = Orchestrator::new(store.clone(), vec![healthy, broken], settings(2, 4));
    let report = orchestrator.run(&Stage::ALL).await.unwrap();

    assert!(!report.is_success());
    let healthy = report.sensors.iter().find(|s| s.sensor_id == "healthy").unwrap();
    assert!(healthy.error.is_none());
    assert_eq!(healthy.validation.unwrap().archived, 1);

    let broken = report.sensors.iter().find(|s| s.sensor_id == "broken").unwrap();
    assert!(broken.error.as_ref().unwrap().starts_with("sync"));
    // Remaining stages skipped for the failed sensor
    assert!(broken.download.is_none());
    let b1 = store.find_scene("broken", "b1").await.unwrap().unwrap();
    assert_eq!(b1.state, SceneState::Discovered);
}

#[tokio::test]
async fn test_failed_downloads_do_not_fail_run() {
    let (dir, store) = create_test_store(StorePolicy::default()).await;
    let sensor = FakeSensor::new("A", dir.path()).with_products(vec![candidate("x", 1)]);
    sensor.script("x", vec![FakeDownload::Permanent("HTTP 410".into())]);

    let orchestrator = Orchestrator::new(store.clone(), vec![sensor], settings(2, 4));
    let report = orchestrator.run(&[Stage::Sync, Stage::Download]).await.unwrap();

    assert!(report.is_success());
    assert_eq!(report.sensors[0].download.unwrap().failed_permanent, 1);
    assert!(report.sensors[0].validation.is_none());
}

#[tokio::test]
async fn test_rejected_credentials_fail_only_that_sensor() {
    let (dir, store) = create_test_store(StorePolicy::default()).await;
    let healthy = FakeSensor::new("healthy", dir.path().join("h")).with_products(vec![candidate("h1", 1)]);
    let locked = FakeSensor::new("locked", dir.path().join("l")).with_products(vec![candidate("l1", 1)]);
    locked.script("l1", vec![FakeDownload::Unauthorized("HTTP 401".into())]);

    let orchestrator = Orchestrator::new(store.clone(), vec![healthy, locked], settings(2, 4));
    let report = orchestrator.run(&Stage::ALL).await.unwrap();

    assert!(!report.is_success());
    let healthy = report.sensors.iter().find(|s| s.sensor_id == "healthy").unwrap();
    assert!(healthy.error.is_none());
    assert_eq!(healthy.validation.unwrap().archived, 1);

    let locked = report.sensors.iter().find(|s| s.sensor_id == "locked").unwrap();
    assert!(locked.error.as_ref().unwrap().starts_with("download"));
    assert!(locked.validation.is_none());
    let l1 = store.find_scene("locked", "l1").await.unwrap().unwrap();
    assert_eq!(l1.state, SceneState::Discovered);
    assert_eq!(l1.retry_count, 0);
}

#[tokio::test]
async fn test_run_from_start_relists_catalog() {
    let (dir, store) = create_test_store(StorePolicy::default()).await;
    let sensor = FakeSensor::new("A", dir.path()).with_products(vec![candidate("x", 3)]);
    let orchestrator = Orchestrator::new(store.clone(), vec![sensor], settings(2, 4));

    orchestrator.run(&[Stage::Sync]).await.unwrap();
    orchestrator.sensors()[0].add_product(candidate("early", 1));

    let report = orchestrator.run_from(&[Stage::Sync], SyncFrom::Start).await.unwrap();
    assert!(report.is_success());
    let sync = report.sensors[0].sync.as_ref().unwrap();
    assert_eq!((sync.seen, sync.inserted), (2, 1));
    assert_eq!(orchestrator.sensors()[0].queries().last(), Some(&None));
    assert!(store.find_scene("A", "early").await.unwrap().is_some());
}

#[tokio::test]
async fn test_store_failure_is_fatal() {
    let (dir, store) = create_test_store(StorePolicy::default()).await;
    let sensor = FakeSensor::new("A", dir.path()).with_products(vec![candidate("x", 1)]);
    let orchestrator = Orchestrator::new(store.clone(), vec![sensor], settings(2, 4));
    let cancel = orchestrator.cancellation_token();

    store.close().await;

    let err = orchestrator.run(&Stage::ALL).await.unwrap_err();
    assert!(err.is_fatal());
    assert!(cancel.is_cancelled());
}

#[tokio::test]
async fn test_cancelled_run_skips_stages() {
    let (dir, store) = create_test_store(StorePolicy::default()).await;
    let sensor = FakeSensor::new("A", dir.path()).with_products(vec![candidate("x", 1)]);
    let orchestrator = Orchestrator::new(store.clone(), vec![sensor], settings(2, 4));

    orchestrator.cancellation_token().cancel();
    let report = orchestrator.run(&Stage::ALL).await.unwrap();

    assert!(report.sensors[0].cancelled);
    assert!(!report.is_success());
    assert!(report.sensors[0].sync.is_none());
    assert!(store.find_scene("A", "x").await.unwrap().is_none());
}

#[tokio::test]
async fn test_reconcile_recovers_orphaned_downloads() {
    let (dir, store) = create_test_store(StorePolicy::default()).await;
    let sensor = FakeSensor::new("A", dir.path()).with_products(vec![candidate("x", 1)]);
    store.upsert_discovered("A", &candidate("x", 1)).await.unwrap();
    store.claim_for_download("A", 1).await.unwrap();

    let mut config = settings(2, 4);
    config.stale_timeout = std::time::Duration::ZERO;
    let orchestrator = Orchestrator::new(store.clone(), vec![sensor], config);

    // Claimed an instant ago, but anything claimed before now counts as stale
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    assert_eq!(orchestrator.reconcile().await.unwrap(), 1);

    let report = orchestrator.run(&[Stage::Download]).await.unwrap();
    assert_eq!(report.sensors[0].download.unwrap().downloaded, 1);
}
