//! Record store for eodd-ingest
//!
//! [`RecordStore`] wraps an explicit SQLite pool handle plus the retry policy
//! the scheduler needs. All state transitions are guarded `UPDATE ... WHERE
//! state = <expected>` statements; losing the guard is reported as
//! `Error::Conflict`.

pub mod cursors;
pub mod export;
pub mod scenes;
pub mod usage;

pub use cursors::SyncCursor;
pub use export::ImportSummary;
pub use scenes::{summarize, PipelineSummary, ResetRecord, ResetScope, StateCount};
pub use usage::UsageEntry;

use crate::models::{BoundingBox, SceneRecord, SceneState};
use eodd_common::time::{from_db, from_db_opt};
use eodd_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};

/// Retry and backoff policy applied by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorePolicy {
    /// Failed download attempts before a scene becomes permanently failed
    pub max_retries: i64,
    /// Download passes a failed scene sits out before it is claimable again
    pub backoff_passes: i64,
    /// Budget for retrying a statement on "database is locked"
    pub lock_wait_ms: u64,
}

impl Default for StorePolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_passes: 1,
            lock_wait_ms: 5000,
        }
    }
}

/// Durable scene/product record store
#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
    policy: StorePolicy,
}

impl RecordStore {
    /// Wrap an already-initialized pool
    ///
    /// `backoff_passes` below 1 would let a failed scene be re-claimed in the
    /// pass that failed it, so it is raised to 1. `max_retries` likewise.
    pub fn new(pool: SqlitePool, policy: StorePolicy) -> Self {
        let policy = StorePolicy {
            max_retries: policy.max_retries.max(1),
            backoff_passes: policy.backoff_passes.max(1),
            ..policy
        };
        Self { pool, policy }
    }

    /// Open (creating if needed) the database file and wrap it
    pub async fn open(db_path: &Path, policy: StorePolicy) -> Result<Self> {
        let pool = eodd_common::db::init_database(db_path).await?;
        Ok(Self::new(pool, policy))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn policy(&self) -> StorePolicy {
        self.policy
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Column list shared by every scene SELECT/RETURNING
pub(crate) const SCENE_COLUMNS: &str = "id, sensor_id, remote_id, discovery_time, acquisition_time, \
     north_lat, south_lat, east_lon, west_lon, cloud_cover, remote_url, expected_checksum, \
     expected_size, metadata, state, local_path, retry_count, last_error, failed_pass, \
     checksum, size, claimed_at, updated_at";

pub(crate) fn scene_from_row(row: &SqliteRow) -> Result<SceneRecord> {
    let bbox = match (
        row.try_get::<Option<f64>, _>("north_lat")?,
        row.try_get::<Option<f64>, _>("south_lat")?,
        row.try_get::<Option<f64>, _>("east_lon")?,
        row.try_get::<Option<f64>, _>("west_lon")?,
    ) {
        (Some(north_lat), Some(south_lat), Some(east_lon), Some(west_lon)) => Some(BoundingBox {
            north_lat,
            south_lat,
            east_lon,
            west_lon,
        }),
        _ => None,
    };

    let state: String = row.try_get("state")?;
    let state: SceneState = state.parse().map_err(Error::Internal)?;

    let metadata: String = row.try_get("metadata")?;
    let metadata = serde_json::from_str(&metadata)
        .map_err(|e| Error::Internal(format!("Failed to deserialize scene metadata: {}", e)))?;

    let discovery_time: String = row.try_get("discovery_time")?;
    let acquisition_time: String = row.try_get("acquisition_time")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(SceneRecord {
        id: row.try_get("id")?,
        sensor_id: row.try_get("sensor_id")?,
        remote_id: row.try_get("remote_id")?,
        discovery_time: from_db(&discovery_time)?,
        acquisition_time: from_db(&acquisition_time)?,
        bbox,
        cloud_cover: row.try_get("cloud_cover")?,
        remote_url: row.try_get("remote_url")?,
        expected_checksum: row.try_get("expected_checksum")?,
        expected_size: row.try_get("expected_size")?,
        metadata,
        state,
        local_path: row
            .try_get::<Option<String>, _>("local_path")?
            .map(PathBuf::from),
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        failed_pass: row.try_get("failed_pass")?,
        checksum: row.try_get("checksum")?,
        size: row.try_get("size")?,
        claimed_at: from_db_opt(row.try_get("claimed_at")?)?,
        updated_at: from_db(&updated_at)?,
    })
}

pub(crate) fn scenes_from_rows(rows: &[SqliteRow]) -> Result<Vec<SceneRecord>> {
    rows.iter().map(scene_from_row).collect()
}

/// Path column value; non-UTF-8 paths cannot round-trip through TEXT
pub(crate) fn path_to_db(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput(format!("Path is not valid UTF-8: {}", path.display())))
}
