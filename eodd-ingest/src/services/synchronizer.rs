//! Catalog synchronizer
//!
//! One pass per sensor: read the cursor, page through the catalog since it,
//! insert unseen products as DISCOVERED and move the cursor forward only if
//! the whole listing was consumed.

use crate::db::{RecordStore, UsageEntry};
use crate::error::{IngestError, IngestResult};
use crate::sensors::SensorPlugin;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of one synchronizer pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    /// Candidates returned by the catalog
    pub seen: u64,
    /// Candidates that were new to the store
    pub inserted: u64,
    /// Cursor after the pass
    pub cursor: Option<DateTime<Utc>>,
}

/// Where a sync pass starts listing the catalog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncFrom {
    /// From the sensor's high-water mark
    #[default]
    Cursor,
    /// From the sensor's configured start date, re-listing everything
    Start,
}

/// Run one synchronizer pass for `sensor` from its cursor
///
/// A catalog error partway through leaves the cursor where it was; every
/// record inserted before the error stays, and the next pass re-lists them
/// as already known.
pub async fn sync_sensor<S: SensorPlugin>(
    store: &RecordStore,
    sensor: &S,
    run_id: Uuid,
) -> IngestResult<SyncReport> {
    sync_sensor_from(store, sensor, run_id, SyncFrom::Cursor).await
}

/// Run one synchronizer pass starting at `from`
///
/// A re-list from the start inserts only products missing from the store
/// and never moves the cursor backward.
pub async fn sync_sensor_from<S: SensorPlugin>(
    store: &RecordStore,
    sensor: &S,
    run_id: Uuid,
    from: SyncFrom,
) -> IngestResult<SyncReport> {
    let sensor_id = sensor.sensor_id();
    let cursor = store.load_cursor(sensor_id).await?;
    let mut report = SyncReport {
        cursor: cursor.last_acquisition_time,
        ..SyncReport::default()
    };
    let mut newest: Option<DateTime<Utc>> = None;

    let since = match from {
        SyncFrom::Cursor => cursor.last_acquisition_time,
        SyncFrom::Start => None,
    };
    debug!(sensor_id, cursor = ?cursor.last_acquisition_time, ?from, "Querying catalog");

    let mut candidates = sensor.query_since(since);
    while let Some(item) = candidates.next().await {
        let candidate = match item {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(
                    sensor_id,
                    seen = report.seen,
                    inserted = report.inserted,
                    error = %err,
                    "Catalog query failed; cursor not advanced"
                );
                let mut entry = UsageEntry::new(run_id, sensor_id, "sync", format!("aborted: {}", err));
                entry.new_scenes = report.inserted as i64;
                store.record_usage(&entry).await?;
                return Err(IngestError::Catalog(err));
            }
        };

        let (record, inserted) = store.upsert_discovered(sensor_id, &candidate).await?;
        report.seen += 1;
        if inserted {
            report.inserted += 1;
            debug!(sensor_id, scene_id = record.id, remote_id = %record.remote_id, "Discovered scene");
        }
        newest = newest.max(Some(candidate.acquisition_time));
    }

    store.advance_cursor(sensor_id, newest).await?;
    report.cursor = report.cursor.max(newest);

    info!(
        sensor_id,
        seen = report.seen,
        inserted = report.inserted,
        cursor = ?report.cursor,
        "Catalog sync complete"
    );

    let mut entry = UsageEntry::new(
        run_id,
        sensor_id,
        "sync",
        format!("{} seen, {} new", report.seen, report.inserted),
    );
    entry.new_scenes = report.inserted as i64;
    store.record_usage(&entry).await?;

    Ok(report)
}
