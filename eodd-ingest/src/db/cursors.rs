//! Per-sensor synchronization cursors and download pass counters

use super::RecordStore;
use crate::utils::retry_on_lock;
use chrono::{DateTime, Utc};
use eodd_common::time::{self, from_db_opt, to_db};
use eodd_common::{Error, Result};
use sqlx::Row;
use tracing::{debug, info};

/// Synchronizer high-water mark for one sensor
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCursor {
    pub sensor_id: String,
    /// Greatest acquisition time seen by a completed sync pass
    pub last_acquisition_time: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Number of download passes started for this sensor
    pub download_pass: i64,
}

impl RecordStore {
    /// Read a sensor's cursor; a sensor never synced gets an empty one
    ///
    /// Read-only: no row is written until a sync or download pass records one.
    pub async fn load_cursor(&self, sensor_id: &str) -> Result<SyncCursor> {
        let row = sqlx::query(
            r#"
            SELECT sensor_id, last_acquisition_time, last_synced_at, download_pass
            FROM sync_cursors WHERE sensor_id = ?
            "#,
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(SyncCursor {
                sensor_id: row.try_get("sensor_id")?,
                last_acquisition_time: from_db_opt(row.try_get("last_acquisition_time")?)?,
                last_synced_at: from_db_opt(row.try_get("last_synced_at")?)?,
                download_pass: row.try_get("download_pass")?,
            }),
            None => Ok(SyncCursor {
                sensor_id: sensor_id.to_string(),
                last_acquisition_time: None,
                last_synced_at: None,
                download_pass: 0,
            }),
        }
    }

    /// Record a completed sync pass
    ///
    /// The high-water mark only ever moves forward; `None` (nothing seen)
    /// leaves it as it was but still stamps `last_synced_at`.
    pub async fn advance_cursor(&self, sensor_id: &str, seen_up_to: Option<DateTime<Utc>>) -> Result<()> {
        let now = to_db(&time::now());
        let seen_up_to = seen_up_to.as_ref().map(to_db);

        retry_on_lock("advance_cursor", self.policy.lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT INTO sync_cursors (sensor_id, last_acquisition_time, last_synced_at)
                VALUES (?, ?, ?)
                ON CONFLICT(sensor_id) DO UPDATE SET
                    last_acquisition_time = CASE
                        WHEN excluded.last_acquisition_time IS NOT NULL
                         AND (sync_cursors.last_acquisition_time IS NULL
                              OR excluded.last_acquisition_time > sync_cursors.last_acquisition_time)
                        THEN excluded.last_acquisition_time
                        ELSE sync_cursors.last_acquisition_time
                    END,
                    last_synced_at = excluded.last_synced_at
                "#,
            )
            .bind(sensor_id)
            .bind(&seen_up_to)
            .bind(&now)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(())
        })
        .await?;

        debug!(sensor_id, cursor = ?seen_up_to, "Advanced sync cursor");
        Ok(())
    }

    /// Start a numbered download pass for a sensor
    ///
    /// Also settles DOWNLOAD_FAILED rows that already used up their retries
    /// (for example after `max_retries` was lowered) as permanent failures.
    pub async fn begin_download_pass(&self, sensor_id: &str) -> Result<i64> {
        let now = to_db(&time::now());

        let (pass, promoted) = retry_on_lock("begin_download_pass", self.policy.lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;

            let pass: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO sync_cursors (sensor_id, download_pass) VALUES (?, 1)
                ON CONFLICT(sensor_id) DO UPDATE SET download_pass = download_pass + 1
                RETURNING download_pass
                "#,
            )
            .bind(sensor_id)
            .fetch_one(&mut *tx)
            .await?;

            let promoted = sqlx::query(
                r#"
                UPDATE scenes
                SET state = 'DOWNLOAD_FAILED_PERMANENT', updated_at = ?
                WHERE sensor_id = ? AND state = 'DOWNLOAD_FAILED' AND retry_count >= ?
                "#,
            )
            .bind(&now)
            .bind(sensor_id)
            .bind(self.policy.max_retries)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            tx.commit().await?;
            Ok::<_, Error>((pass, promoted))
        })
        .await?;

        if promoted > 0 {
            info!(sensor_id, promoted, "Retry budget exhausted; marked scenes permanently failed");
        }
        debug!(sensor_id, pass, "Started download pass");
        Ok(pass)
    }
}
