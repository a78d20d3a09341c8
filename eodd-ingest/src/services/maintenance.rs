//! Administrative repairs
//!
//! Bulk resets of scenes stuck in a failure state, optionally removing the
//! artifacts the reset scenes no longer point at.

use crate::db::{RecordStore, ResetScope, UsageEntry};
use crate::error::IngestResult;
use crate::models::{SceneRecord, SceneState};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkResetReport {
    pub reset: Vec<SceneRecord>,
    /// Artifacts removed from disk
    pub files_removed: u64,
}

/// Reset every scene of `sensor_id` in `state`
///
/// With `remove_files`, a download reset also deletes each released
/// artifact. Removal is best-effort: a file that cannot be removed is logged
/// and left behind, and the scene stays reset.
pub async fn reset_in_state(
    store: &RecordStore,
    sensor_id: &str,
    state: SceneState,
    scope: ResetScope,
    remove_files: bool,
) -> IngestResult<BulkResetReport> {
    let records = store.reset_state(sensor_id, state, scope).await?;

    let mut report = BulkResetReport::default();
    let mut released = Vec::new();
    for record in records {
        released.extend(record.released_path);
        report.reset.push(record.scene);
    }
    if remove_files {
        report.files_removed = remove_artifacts(&released).await;
    }

    let entry = UsageEntry::new(
        Uuid::new_v4(),
        sensor_id,
        "reset",
        format!(
            "{} {} scenes reset ({:?}), {} files removed",
            report.reset.len(),
            state,
            scope,
            report.files_removed
        ),
    );
    store.record_usage(&entry).await?;

    info!(
        sensor_id,
        %state,
        reset = report.reset.len(),
        files_removed = report.files_removed,
        "Bulk reset complete"
    );
    Ok(report)
}

/// Delete artifact files or product folders; returns how many were removed
pub async fn remove_artifacts(paths: &[PathBuf]) -> u64 {
    let mut removed = 0;
    for path in paths {
        match remove_artifact(path).await {
            Ok(true) => removed += 1,
            Ok(false) => debug!(path = %path.display(), "Artifact already gone"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove artifact"),
        }
    }
    removed
}

async fn remove_artifact(path: &Path) -> std::io::Result<bool> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(true)
}
