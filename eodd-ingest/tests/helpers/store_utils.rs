//! Record store test utilities

use chrono::{DateTime, TimeZone, Utc};
use eodd_ingest::db::{RecordStore, StorePolicy};
use eodd_ingest::models::CandidateProduct;
use eodd_ingest::services::OrchestratorSettings;
use std::time::Duration;
use tempfile::TempDir;

/// Create a temporary store with the given policy
///
/// Returns (TempDir, RecordStore) - TempDir must be kept alive for duration of test
pub async fn create_test_store(policy: StorePolicy) -> (TempDir, RecordStore) {
    let temp_dir = TempDir::new().unwrap();
    let store = RecordStore::open(&temp_dir.path().join("eodd_test.db"), policy)
        .await
        .unwrap();
    (temp_dir, store)
}

/// Midnight UTC on the given day of January 2024, plus `hour`
pub fn ts(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
}

pub fn candidate(remote_id: &str, day: u32) -> CandidateProduct {
    CandidateProduct::new(remote_id, ts(day, 0))
}

pub fn settings(max_concurrent_downloads: usize, claim_batch_size: usize) -> OrchestratorSettings {
    OrchestratorSettings {
        max_concurrent_downloads,
        claim_batch_size,
        stale_timeout: Duration::from_secs(3600),
    }
}
