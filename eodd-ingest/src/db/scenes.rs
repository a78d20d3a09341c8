//! Scene record operations
//!
//! Discovery inserts, the two atomic claim operations, guarded state
//! transitions, reporting queries and administrative resets.

use super::{path_to_db, scene_from_row, scenes_from_rows, RecordStore, SCENE_COLUMNS};
use crate::models::{BoundingBox, CandidateProduct, LocalArtifact, SceneQuery, SceneRecord, SceneState};
use crate::utils::retry_on_lock;
use chrono::{DateTime, Utc};
use eodd_common::time::{self, to_db};
use eodd_common::{Error, Result};
use serde::Serialize;
use sqlx::Row;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Administrative reset target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// PROCESSED / PROCESSING_FAILED back to ARCHIVED
    Processing,
    /// Any state except DOWNLOADING back to DISCOVERED with a clean slate
    Download,
}

impl ResetScope {
    /// States this reset may move a scene out of
    pub fn applies_to(&self, state: SceneState) -> bool {
        match self {
            ResetScope::Processing => {
                matches!(state, SceneState::Processed | SceneState::ProcessingFailed)
            }
            ResetScope::Download => state != SceneState::Downloading,
        }
    }

    fn assignments(&self) -> &'static str {
        match self {
            ResetScope::Processing => "state = 'ARCHIVED', last_error = NULL",
            ResetScope::Download => {
                "state = 'DISCOVERED', local_path = NULL, checksum = NULL, size = NULL, \
                 last_error = NULL, retry_count = 0, failed_pass = 0, claimed_at = NULL"
            }
        }
    }
}

/// A scene moved back by a bulk reset
#[derive(Debug, Clone, PartialEq)]
pub struct ResetRecord {
    pub scene: SceneRecord,
    /// Artifact the scene pointed at before a download reset cleared it
    pub released_path: Option<PathBuf>,
}

/// Row of the per-sensor state histogram
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateCount {
    pub sensor_id: String,
    pub state: SceneState,
    pub count: i64,
}

/// Per-sensor totals: scenes at rest vs. scenes the pipeline will still move
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    pub sensor_id: String,
    pub settled: i64,
    pub in_progress: i64,
}

/// Fold a state histogram into one summary per sensor
pub fn summarize(counts: &[StateCount]) -> Vec<PipelineSummary> {
    let mut by_sensor: BTreeMap<&str, PipelineSummary> = BTreeMap::new();
    for count in counts {
        let summary = by_sensor
            .entry(count.sensor_id.as_str())
            .or_insert_with(|| PipelineSummary {
                sensor_id: count.sensor_id.clone(),
                ..PipelineSummary::default()
            });
        if count.state.is_terminal() {
            summary.settled += count.count;
        } else {
            summary.in_progress += count.count;
        }
    }
    by_sensor.into_values().collect()
}

/// SQL list of the quoted state names matching `keep`
fn state_list(keep: impl Fn(&SceneState) -> bool) -> String {
    SceneState::ALL
        .iter()
        .filter(|state| keep(state))
        .map(|state| format!("'{}'", state.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl RecordStore {
    /// Insert a newly discovered scene, or return the existing row untouched
    ///
    /// Returns the record and whether it was inserted by this call.
    pub async fn upsert_discovered(
        &self,
        sensor_id: &str,
        candidate: &CandidateProduct,
    ) -> Result<(SceneRecord, bool)> {
        let now = to_db(&time::now());
        let acquisition_time = to_db(&candidate.acquisition_time);
        let metadata = serde_json::to_string(&candidate.metadata)
            .map_err(|e| Error::Internal(format!("Failed to serialize scene metadata: {}", e)))?;
        let bbox = candidate.bbox;
        let insert_sql = format!(
            r#"
            INSERT INTO scenes (
                sensor_id, remote_id, discovery_time, acquisition_time,
                north_lat, south_lat, east_lon, west_lon, cloud_cover,
                remote_url, expected_checksum, expected_size, metadata,
                state, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'DISCOVERED', ?)
            ON CONFLICT(sensor_id, remote_id) DO NOTHING
            RETURNING {}
            "#,
            SCENE_COLUMNS
        );

        let inserted = retry_on_lock("upsert_discovered", self.policy.lock_wait_ms, || async {
            let row = sqlx::query(&insert_sql)
                .bind(sensor_id)
                .bind(&candidate.remote_id)
                .bind(&now)
                .bind(&acquisition_time)
                .bind(bbox.map(|b| b.north_lat))
                .bind(bbox.map(|b| b.south_lat))
                .bind(bbox.map(|b| b.east_lon))
                .bind(bbox.map(|b| b.west_lon))
                .bind(candidate.cloud_cover)
                .bind(&candidate.remote_url)
                .bind(&candidate.expected_checksum)
                .bind(candidate.expected_size)
                .bind(&metadata)
                .bind(&now)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(scene_from_row).transpose()
        })
        .await?;

        if let Some(record) = inserted {
            debug!(
                sensor_id,
                remote_id = %record.remote_id,
                scene_id = record.id,
                "Discovered new scene"
            );
            return Ok((record, true));
        }

        let existing = self
            .find_scene(sensor_id, &candidate.remote_id)
            .await?
            .ok_or_else(|| {
                Error::Internal(format!(
                    "Scene {}/{} vanished after conflicting insert",
                    sensor_id, candidate.remote_id
                ))
            })?;
        Ok((existing, false))
    }

    /// Atomically move up to `limit` claimable scenes to DOWNLOADING
    ///
    /// Claimable: DISCOVERED, or DOWNLOAD_FAILED with retries left whose
    /// backoff has elapsed. Concurrent claimers never receive the same row;
    /// a lost race just yields fewer rows.
    pub async fn claim_for_download(&self, sensor_id: &str, limit: i64) -> Result<Vec<SceneRecord>> {
        let now = to_db(&time::now());
        let sql = format!(
            r#"
            UPDATE scenes
            SET state = 'DOWNLOADING', claimed_at = ?, updated_at = ?
            WHERE id IN (
                SELECT id FROM scenes
                WHERE sensor_id = ?
                  AND (
                    state = 'DISCOVERED'
                    OR (
                        state = 'DOWNLOAD_FAILED'
                        AND retry_count < ?
                        AND failed_pass + ? <= COALESCE(
                            (SELECT download_pass FROM sync_cursors WHERE sensor_id = ?), 0)
                    )
                  )
                ORDER BY acquisition_time, id
                LIMIT ?
            )
            RETURNING {}
            "#,
            SCENE_COLUMNS
        );

        let mut claimed = retry_on_lock("claim_for_download", self.policy.lock_wait_ms, || async {
            let rows = sqlx::query(&sql)
                .bind(&now)
                .bind(&now)
                .bind(sensor_id)
                .bind(self.policy.max_retries)
                .bind(self.policy.backoff_passes)
                .bind(sensor_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
            scenes_from_rows(&rows)
        })
        .await?;

        // RETURNING order is unspecified
        claimed.sort_by(|a, b| (a.acquisition_time, a.id).cmp(&(b.acquisition_time, b.id)));

        if !claimed.is_empty() {
            debug!(sensor_id, count = claimed.len(), "Claimed scenes for download");
        }
        Ok(claimed)
    }

    /// DOWNLOADING → DOWNLOADED
    pub async fn mark_downloaded(&self, id: i64, artifact: &LocalArtifact) -> Result<()> {
        let now = to_db(&time::now());
        let local_path = path_to_db(&artifact.path)?;

        let affected = retry_on_lock("mark_downloaded", self.policy.lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE scenes
                SET state = 'DOWNLOADED',
                    local_path = ?,
                    size = ?,
                    expected_checksum = COALESCE(expected_checksum, ?),
                    last_error = NULL,
                    claimed_at = NULL,
                    updated_at = ?
                WHERE id = ? AND state = 'DOWNLOADING'
                "#,
            )
            .bind(&local_path)
            .bind(artifact.size)
            .bind(&artifact.reported_checksum)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        guard_affected(affected, id, SceneState::Downloading)
    }

    /// Record a failed download attempt and return the resulting state
    ///
    /// The scene stays retryable only if the error is transient and the
    /// incremented retry count is still below `max_retries`.
    pub async fn mark_failed(&self, id: i64, error: &str, retryable: bool) -> Result<SceneState> {
        let now = to_db(&time::now());

        let state = retry_on_lock("mark_failed", self.policy.lock_wait_ms, || async {
            let row = sqlx::query(
                r#"
                UPDATE scenes
                SET retry_count = retry_count + 1,
                    last_error = ?,
                    failed_pass = COALESCE(
                        (SELECT c.download_pass FROM sync_cursors c WHERE c.sensor_id = scenes.sensor_id), 0),
                    state = CASE
                        WHEN ? AND retry_count + 1 < ? THEN 'DOWNLOAD_FAILED'
                        ELSE 'DOWNLOAD_FAILED_PERMANENT'
                    END,
                    claimed_at = NULL,
                    updated_at = ?
                WHERE id = ? AND state = 'DOWNLOADING'
                RETURNING state
                "#,
            )
            .bind(error)
            .bind(retryable)
            .bind(self.policy.max_retries)
            .bind(&now)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(|r| r.try_get::<String, _>("state"))
                .transpose()
                .map_err(Error::from)
        })
        .await?;

        match state {
            Some(state) => state.parse().map_err(Error::Internal),
            None => Err(conflict(id, SceneState::Downloading)),
        }
    }

    /// Hand a DOWNLOADING claim back without charging an attempt
    ///
    /// Used when the sensor itself failed (rejected credentials) so the scene
    /// is not to blame. The scene returns to DISCOVERED, or to DOWNLOAD_FAILED
    /// if earlier attempts already failed, and stays immediately claimable.
    pub async fn release_claim(&self, id: i64, reason: &str) -> Result<SceneState> {
        let now = to_db(&time::now());

        let state = retry_on_lock("release_claim", self.policy.lock_wait_ms, || async {
            let row = sqlx::query(
                r#"
                UPDATE scenes
                SET state = CASE WHEN retry_count = 0 THEN 'DISCOVERED' ELSE 'DOWNLOAD_FAILED' END,
                    last_error = ?,
                    claimed_at = NULL,
                    updated_at = ?
                WHERE id = ? AND state = 'DOWNLOADING'
                RETURNING state
                "#,
            )
            .bind(reason)
            .bind(&now)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            row.map(|r| r.try_get::<String, _>("state"))
                .transpose()
                .map_err(Error::from)
        })
        .await?;

        match state {
            Some(state) => state.parse().map_err(Error::Internal),
            None => Err(conflict(id, SceneState::Downloading)),
        }
    }

    /// Atomically move up to `limit` scenes awaiting validation to VALIDATING
    ///
    /// VALIDATING rows claimed before `stale_before` belong to a validator
    /// that died and are taken over.
    pub async fn claim_for_validation(
        &self,
        sensor_id: &str,
        limit: i64,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<SceneRecord>> {
        let now = to_db(&time::now());
        let stale_before = to_db(&stale_before);
        let sql = format!(
            r#"
            UPDATE scenes
            SET state = 'VALIDATING', claimed_at = ?, updated_at = ?
            WHERE id IN (
                SELECT id FROM scenes
                WHERE sensor_id = ?
                  AND (state = 'DOWNLOADED' OR (state = 'VALIDATING' AND claimed_at < ?))
                ORDER BY acquisition_time, id
                LIMIT ?
            )
            RETURNING {}
            "#,
            SCENE_COLUMNS
        );

        let mut claimed = retry_on_lock("claim_for_validation", self.policy.lock_wait_ms, || async {
            let rows = sqlx::query(&sql)
                .bind(&now)
                .bind(&now)
                .bind(sensor_id)
                .bind(&stale_before)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
            scenes_from_rows(&rows)
        })
        .await?;

        claimed.sort_by(|a, b| (a.acquisition_time, a.id).cmp(&(b.acquisition_time, b.id)));
        Ok(claimed)
    }

    /// VALIDATING → ARCHIVED
    pub async fn mark_validated(&self, id: i64, checksum: &str, size: i64) -> Result<()> {
        let now = to_db(&time::now());
        let affected = retry_on_lock("mark_validated", self.policy.lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE scenes
                SET state = 'ARCHIVED', checksum = ?, size = ?, last_error = NULL,
                    claimed_at = NULL, updated_at = ?
                WHERE id = ? AND state = 'VALIDATING'
                "#,
            )
            .bind(checksum)
            .bind(size)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        guard_affected(affected, id, SceneState::Validating)
    }

    /// VALIDATING → CORRUPT
    pub async fn mark_corrupt(&self, id: i64, error: &str) -> Result<()> {
        self.finish_guarded(
            "mark_corrupt",
            id,
            SceneState::Validating,
            SceneState::Corrupt,
            Some(error),
        )
        .await
    }

    /// ARCHIVED → PROCESSED
    pub async fn mark_processed(&self, id: i64) -> Result<()> {
        self.finish_guarded("mark_processed", id, SceneState::Archived, SceneState::Processed, None)
            .await
    }

    /// ARCHIVED → PROCESSING_FAILED
    pub async fn mark_processing_failed(&self, id: i64, error: &str) -> Result<()> {
        self.finish_guarded(
            "mark_processing_failed",
            id,
            SceneState::Archived,
            SceneState::ProcessingFailed,
            Some(error),
        )
        .await
    }

    async fn finish_guarded(
        &self,
        operation: &str,
        id: i64,
        from: SceneState,
        to: SceneState,
        error: Option<&str>,
    ) -> Result<()> {
        debug_assert!(from.can_transition_to(to), "{} -> {} is not a pipeline transition", from, to);
        let now = to_db(&time::now());
        let affected = retry_on_lock(operation, self.policy.lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE scenes
                SET state = ?, last_error = ?, claimed_at = NULL, updated_at = ?
                WHERE id = ? AND state = ?
                "#,
            )
            .bind(to.as_str())
            .bind(error)
            .bind(&now)
            .bind(id)
            .bind(from.as_str())
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        guard_affected(affected, id, from)
    }

    /// Crash recovery: DOWNLOADING rows claimed before `older_than` become
    /// DOWNLOAD_FAILED and immediately claimable
    ///
    /// The interrupted attempt does not count against `max_retries`.
    pub async fn reconcile_stale_downloads(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let now = to_db(&time::now());
        let cutoff = to_db(&older_than);

        let recovered = retry_on_lock("reconcile_stale_downloads", self.policy.lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE scenes
                SET state = 'DOWNLOAD_FAILED',
                    failed_pass = 0,
                    last_error = 'download interrupted; recovered at startup',
                    claimed_at = NULL,
                    updated_at = ?
                WHERE state = 'DOWNLOADING' AND claimed_at < ?
                "#,
            )
            .bind(&now)
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        if recovered > 0 {
            warn!(recovered, "Recovered stale DOWNLOADING scenes");
        }
        Ok(recovered)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn get_scene(&self, id: i64) -> Result<Option<SceneRecord>> {
        let sql = format!("SELECT {} FROM scenes WHERE id = ?", SCENE_COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(scene_from_row).transpose()
    }

    pub async fn find_scene(&self, sensor_id: &str, remote_id: &str) -> Result<Option<SceneRecord>> {
        let sql = format!(
            "SELECT {} FROM scenes WHERE sensor_id = ? AND remote_id = ?",
            SCENE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(sensor_id)
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(scene_from_row).transpose()
    }

    /// Scenes in `state`, optionally for one sensor, by acquisition time
    pub async fn list_by_state(
        &self,
        sensor_id: Option<&str>,
        state: SceneState,
    ) -> Result<Vec<SceneRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM scenes
            WHERE state = ? AND (? IS NULL OR sensor_id = ?)
            ORDER BY acquisition_time, id
            "#,
            SCENE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(sensor_id)
            .bind(sensor_id)
            .fetch_all(&self.pool)
            .await?;
        scenes_from_rows(&rows)
    }

    pub async fn list_archived(&self, sensor_id: &str) -> Result<Vec<SceneRecord>> {
        self.list_by_state(Some(sensor_id), SceneState::Archived).await
    }

    /// Scenes in a terminal failure state, newest failure first
    pub async fn list_failures(&self, sensor_id: Option<&str>) -> Result<Vec<SceneRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM scenes
            WHERE state IN ({})
              AND (? IS NULL OR sensor_id = ?)
            ORDER BY updated_at DESC, id
            "#,
            SCENE_COLUMNS,
            state_list(SceneState::is_failure)
        );
        let rows = sqlx::query(&sql)
            .bind(sensor_id)
            .bind(sensor_id)
            .fetch_all(&self.pool)
            .await?;
        scenes_from_rows(&rows)
    }

    /// Scenes acquired in `[start, end)`
    pub async fn query_by_acquisition(
        &self,
        sensor_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<SceneRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM scenes
            WHERE sensor_id = ? AND acquisition_time >= ? AND acquisition_time < ?
            ORDER BY acquisition_time, id
            "#,
            SCENE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(sensor_id)
            .bind(to_db(&start))
            .bind(to_db(&end))
            .fetch_all(&self.pool)
            .await?;
        scenes_from_rows(&rows)
    }

    /// Scenes whose footprint intersects `bbox`; scenes without a footprint never match
    pub async fn query_by_bbox(&self, sensor_id: &str, bbox: &BoundingBox) -> Result<Vec<SceneRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM scenes
            WHERE sensor_id = ?
              AND south_lat <= ? AND north_lat >= ?
              AND west_lon <= ? AND east_lon >= ?
            ORDER BY acquisition_time, id
            "#,
            SCENE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(sensor_id)
            .bind(bbox.north_lat)
            .bind(bbox.south_lat)
            .bind(bbox.east_lon)
            .bind(bbox.west_lon)
            .fetch_all(&self.pool)
            .await?;
        scenes_from_rows(&rows)
    }

    /// Scenes matching `query`, by acquisition time
    ///
    /// The narrowest indexed lookup the query allows runs in SQL; the rest
    /// of the filter is applied to its rows.
    pub async fn list_scenes(&self, query: &SceneQuery) -> Result<Vec<SceneRecord>> {
        let sensor_id = query.sensor_id.as_deref();
        let mut scenes = match (sensor_id, &query.bbox, query.acquired_from, query.acquired_until) {
            (Some(sensor_id), Some(bbox), _, _) => self.query_by_bbox(sensor_id, bbox).await?,
            (Some(sensor_id), None, Some(from), Some(until)) => {
                self.query_by_acquisition(sensor_id, from, until).await?
            }
            _ => match query.state {
                Some(state) => self.list_by_state(sensor_id, state).await?,
                None => self.export_scenes(sensor_id).await?,
            },
        };
        scenes.retain(|scene| query.matches(scene));
        scenes.sort_by(|a, b| (a.acquisition_time, a.id).cmp(&(b.acquisition_time, b.id)));
        Ok(scenes)
    }

    pub async fn state_counts(&self, sensor_id: Option<&str>) -> Result<Vec<StateCount>> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_id, state, COUNT(*) AS count FROM scenes
            WHERE (? IS NULL OR sensor_id = ?)
            GROUP BY sensor_id, state
            ORDER BY sensor_id, state
            "#,
        )
        .bind(sensor_id)
        .bind(sensor_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let state: String = row.try_get("state")?;
                Ok(StateCount {
                    sensor_id: row.try_get("sensor_id")?,
                    state: state.parse().map_err(Error::Internal)?,
                    count: row.try_get("count")?,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Move a scene back for another attempt
    pub async fn reset_scene(&self, id: i64, scope: ResetScope) -> Result<SceneRecord> {
        let now = to_db(&time::now());
        let sql = format!(
            r#"
            UPDATE scenes
            SET {}, updated_at = ?
            WHERE id = ? AND state IN ({})
            RETURNING {}
            "#,
            scope.assignments(),
            state_list(|state| scope.applies_to(*state)),
            SCENE_COLUMNS
        );

        let row = retry_on_lock("reset_scene", self.policy.lock_wait_ms, || async {
            Ok::<_, Error>(sqlx::query(&sql)
                .bind(&now)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await?;

        match row {
            Some(row) => {
                let record = scene_from_row(&row)?;
                info!(
                    scene_id = id,
                    remote_id = %record.remote_id,
                    state = %record.state,
                    "Scene reset"
                );
                Ok(record)
            }
            None => match self.get_scene(id).await? {
                None => Err(Error::NotFound(format!("scene {}", id))),
                Some(existing) => Err(Error::Conflict(format!(
                    "scene {} is {}; {:?} reset not applicable",
                    id, existing.state, scope
                ))),
            },
        }
    }

    /// Reset every scene of a sensor currently in `state`
    ///
    /// For a download reset each record also carries the artifact path it
    /// released, so the caller can remove the files.
    pub async fn reset_state(
        &self,
        sensor_id: &str,
        state: SceneState,
        scope: ResetScope,
    ) -> Result<Vec<ResetRecord>> {
        if !scope.applies_to(state) {
            return Err(Error::InvalidInput(format!(
                "{:?} reset does not apply to {} scenes",
                scope, state
            )));
        }
        let now = to_db(&time::now());
        let sql = format!(
            r#"
            UPDATE scenes
            SET {}, updated_at = ?
            WHERE sensor_id = ? AND state = ?
            RETURNING {}
            "#,
            scope.assignments(),
            SCENE_COLUMNS
        );

        let (previous, rows) = retry_on_lock("reset_state", self.policy.lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            let previous: Vec<(i64, Option<String>)> = sqlx::query_as(
                "SELECT id, local_path FROM scenes WHERE sensor_id = ? AND state = ?",
            )
            .bind(sensor_id)
            .bind(state.as_str())
            .fetch_all(&mut *tx)
            .await?;
            let rows = sqlx::query(&sql)
                .bind(&now)
                .bind(sensor_id)
                .bind(state.as_str())
                .fetch_all(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok::<_, Error>((previous, rows))
        })
        .await?;

        let mut previous: BTreeMap<i64, Option<String>> = previous.into_iter().collect();
        let mut reset = scenes_from_rows(&rows)?
            .into_iter()
            .map(|scene| {
                let released_path = match scope {
                    ResetScope::Download => previous.remove(&scene.id).flatten().map(PathBuf::from),
                    ResetScope::Processing => None,
                };
                ResetRecord { scene, released_path }
            })
            .collect::<Vec<_>>();
        reset.sort_by(|a, b| {
            (a.scene.acquisition_time, a.scene.id).cmp(&(b.scene.acquisition_time, b.scene.id))
        });

        info!(sensor_id, %state, ?scope, reset = reset.len(), "Bulk scene reset");
        Ok(reset)
    }

    /// Rewrite the `local_path` prefix of a sensor's downloaded scenes
    ///
    /// Used after moving a download directory. Returns the number of rows changed.
    pub async fn relocate_downloads(
        &self,
        sensor_id: &str,
        old_prefix: &str,
        new_prefix: &str,
    ) -> Result<u64> {
        if old_prefix.is_empty() {
            return Err(Error::InvalidInput("old prefix must not be empty".to_string()));
        }
        let now = to_db(&time::now());

        let moved = retry_on_lock("relocate_downloads", self.policy.lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE scenes
                SET local_path = ? || substr(local_path, length(?) + 1), updated_at = ?
                WHERE sensor_id = ?
                  AND local_path IS NOT NULL
                  AND substr(local_path, 1, length(?)) = ?
                "#,
            )
            .bind(new_prefix)
            .bind(old_prefix)
            .bind(&now)
            .bind(sensor_id)
            .bind(old_prefix)
            .bind(old_prefix)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(result.rows_affected())
        })
        .await?;

        info!(sensor_id, old_prefix, new_prefix, moved, "Relocated download paths");
        Ok(moved)
    }
}

fn conflict(id: i64, expected: SceneState) -> Error {
    Error::Conflict(format!("scene {} is no longer {}", id, expected))
}

fn guard_affected(affected: u64, id: i64, expected: SceneState) -> Result<()> {
    if affected == 0 {
        Err(conflict(id, expected))
    } else {
        Ok(())
    }
}
