//! JSON export and import of scene records
//!
//! Used to move a catalog between installations. Imports only add scenes
//! that are not yet known; existing rows are never overwritten.

use super::{path_to_db, RecordStore, SCENE_COLUMNS};
use crate::models::{SceneRecord, SceneState};
use eodd_common::time::to_db;
use eodd_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

const EXPORT_FORMAT: &str = "eodd-scenes";
const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ExportDocument {
    format: String,
    version: u32,
    scenes: Vec<SceneRecord>,
}

/// Outcome of an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: u64,
    pub skipped: u64,
}

impl RecordStore {
    /// All scenes, optionally for one sensor, ordered by sensor and acquisition time
    pub async fn export_scenes(&self, sensor_id: Option<&str>) -> Result<Vec<SceneRecord>> {
        let sql = format!(
            "SELECT {} FROM scenes WHERE (? IS NULL OR sensor_id = ?) ORDER BY sensor_id, acquisition_time, id",
            SCENE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(sensor_id)
            .bind(sensor_id)
            .fetch_all(&self.pool)
            .await?;
        super::scenes_from_rows(&rows)
    }

    /// Write scenes to a JSON file; returns the number written
    pub async fn export_to_path(&self, sensor_id: Option<&str>, path: &Path) -> Result<usize> {
        let scenes = self.export_scenes(sensor_id).await?;
        let count = scenes.len();
        let document = ExportDocument {
            format: EXPORT_FORMAT.to_string(),
            version: EXPORT_VERSION,
            scenes,
        };
        let json = serde_json::to_vec_pretty(&document)
            .map_err(|e| Error::Internal(format!("Failed to serialize export: {}", e)))?;
        tokio::fs::write(path, json).await?;

        info!(count, path = %path.display(), "Exported scenes");
        Ok(count)
    }

    /// Import scenes from a JSON export
    ///
    /// `remap` rewrites a `local_path` prefix (old, new). Scenes caught
    /// mid-download or mid-validation in the source are imported as
    /// DOWNLOAD_FAILED / DOWNLOADED so the local pipeline picks them up.
    pub async fn import_from_path(
        &self,
        path: &Path,
        remap: Option<(&str, &str)>,
    ) -> Result<ImportSummary> {
        let bytes = tokio::fs::read(path).await?;
        let document: ExportDocument = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidInput(format!("Invalid export file {}: {}", path.display(), e)))?;
        if document.format != EXPORT_FORMAT || document.version != EXPORT_VERSION {
            return Err(Error::InvalidInput(format!(
                "Unsupported export format {} v{}",
                document.format, document.version
            )));
        }

        let mut summary = ImportSummary::default();
        let mut tx = self.pool.begin().await?;

        for scene in document.scenes {
            let scene = normalize_imported(scene, remap);
            if scene.state.has_local_path() != scene.local_path.is_some() {
                return Err(Error::InvalidInput(format!(
                    "Scene {}/{} in state {} has inconsistent local_path",
                    scene.sensor_id, scene.remote_id, scene.state
                )));
            }
            let metadata = serde_json::to_string(&scene.metadata)
                .map_err(|e| Error::Internal(format!("Failed to serialize scene metadata: {}", e)))?;
            let local_path = scene.local_path.as_deref().map(path_to_db).transpose()?;

            let result = sqlx::query(
                r#"
                INSERT INTO scenes (
                    sensor_id, remote_id, discovery_time, acquisition_time,
                    north_lat, south_lat, east_lon, west_lon, cloud_cover,
                    remote_url, expected_checksum, expected_size, metadata,
                    state, local_path, retry_count, last_error, failed_pass,
                    checksum, size, claimed_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, NULL, ?)
                ON CONFLICT(sensor_id, remote_id) DO NOTHING
                "#,
            )
            .bind(&scene.sensor_id)
            .bind(&scene.remote_id)
            .bind(to_db(&scene.discovery_time))
            .bind(to_db(&scene.acquisition_time))
            .bind(scene.bbox.map(|b| b.north_lat))
            .bind(scene.bbox.map(|b| b.south_lat))
            .bind(scene.bbox.map(|b| b.east_lon))
            .bind(scene.bbox.map(|b| b.west_lon))
            .bind(scene.cloud_cover)
            .bind(&scene.remote_url)
            .bind(&scene.expected_checksum)
            .bind(scene.expected_size)
            .bind(&metadata)
            .bind(scene.state.as_str())
            .bind(&local_path)
            .bind(scene.retry_count)
            .bind(&scene.last_error)
            .bind(&scene.checksum)
            .bind(scene.size)
            .bind(to_db(&scene.updated_at))
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                summary.inserted += 1;
            } else {
                summary.skipped += 1;
            }
        }

        tx.commit().await?;
        info!(
            inserted = summary.inserted,
            skipped = summary.skipped,
            path = %path.display(),
            "Imported scenes"
        );
        Ok(summary)
    }
}

fn normalize_imported(mut scene: SceneRecord, remap: Option<(&str, &str)>) -> SceneRecord {
    match scene.state {
        SceneState::Downloading => {
            scene.state = SceneState::DownloadFailed;
            scene.local_path = None;
        }
        SceneState::Validating => scene.state = SceneState::Downloaded,
        _ => {}
    }
    scene.claimed_at = None;

    if let (Some((old, new)), Some(path)) = (remap, scene.local_path.as_ref()) {
        if let Ok(rest) = path.strip_prefix(old) {
            scene.local_path = Some(PathBuf::from(new).join(rest));
        }
    }
    scene
}
