//! Processing collaborator adapter
//!
//! Hands ARCHIVED scenes to the external processing pipeline and records
//! PROCESSED or PROCESSING_FAILED from its outcome.

use crate::config::ProcessingConfig;
use crate::db::{RecordStore, UsageEntry};
use crate::error::{IngestError, IngestResult};
use crate::models::SceneRecord;
use eodd_common::Error;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Environment variable carrying the scene metadata JSON
pub const METADATA_ENV: &str = "EODD_SCENE_METADATA";

/// Trailing stderr characters kept in `last_error`
const STDERR_TAIL_CHARS: usize = 2000;

/// One unit of work for the processor
#[derive(Debug, Clone, Copy)]
pub struct ProcessingJob<'a> {
    pub sensor_id: &'a str,
    pub remote_id: &'a str,
    pub local_path: &'a Path,
    pub metadata: &'a Value,
}

/// External processing pipeline
pub trait ExternalProcessor: Send + Sync {
    /// `Err` carries a human-readable reason; it is stored on the scene
    fn process(&self, job: ProcessingJob<'_>) -> impl Future<Output = Result<(), String>> + Send;
}

/// Runs a configured program once per scene
///
/// Arguments may contain `{sensor_id}`, `{remote_id}` and `{local_path}`.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandProcessor {
    pub fn new(config: &ProcessingConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    pub fn render_args(&self, job: &ProcessingJob<'_>) -> Vec<String> {
        let local_path = job.local_path.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{sensor_id}", job.sensor_id)
                    .replace("{remote_id}", job.remote_id)
                    .replace("{local_path}", &local_path)
            })
            .collect()
    }
}

impl ExternalProcessor for CommandProcessor {
    async fn process(&self, job: ProcessingJob<'_>) -> Result<(), String> {
        let args = self.render_args(&job);
        debug!(program = %self.program.display(), ?args, "Starting processor");

        let child = Command::new(&self.program)
            .args(&args)
            .env(METADATA_ENV, job.metadata.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to start {}: {}", self.program.display(), e))?;

        // Dropping the child on timeout kills it
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|e| format!("processor I/O error: {}", e))?,
            Err(_) => return Err(format!("processor timed out after {}s", self.timeout.as_secs())),
        };

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{}: {}", output.status, stderr_tail(stderr.trim_end())))
        }
    }
}

fn stderr_tail(stderr: &str) -> &str {
    let count = stderr.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return stderr;
    }
    match stderr.char_indices().nth(count - STDERR_TAIL_CHARS) {
        Some((idx, _)) => &stderr[idx..],
        None => stderr,
    }
}

/// Result of one processing pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    pub attempted: u64,
    pub processed: u64,
    pub failed: u64,
}

/// Process every ARCHIVED scene of one sensor, oldest acquisition first
pub async fn process_archived<P: ExternalProcessor>(
    store: &RecordStore,
    sensor_id: &str,
    processor: &P,
    cancel: &CancellationToken,
    run_id: Uuid,
) -> IngestResult<ProcessReport> {
    let mut report = ProcessReport::default();

    for scene in store.list_archived(sensor_id).await? {
        if cancel.is_cancelled() {
            info!(sensor_id, "Processing cancelled");
            break;
        }
        report.attempted += 1;

        match process_one(store, processor, &scene).await {
            Ok(true) => report.processed += 1,
            Ok(false) => report.failed += 1,
            Err(Error::Conflict(msg)) => warn!(sensor_id, scene_id = scene.id, "Processing outcome not recorded: {}", msg),
            Err(err) => return Err(IngestError::Store(err)),
        }
    }

    if report.attempted > 0 {
        info!(
            sensor_id,
            processed = report.processed,
            failed = report.failed,
            "Processing pass complete"
        );
    }

    let mut entry = UsageEntry::new(run_id, sensor_id, "process", format!("{} attempted", report.attempted));
    entry.processed = report.processed as i64;
    entry.failed = report.failed as i64;
    store.record_usage(&entry).await?;

    Ok(report)
}

async fn process_one<P: ExternalProcessor>(
    store: &RecordStore,
    processor: &P,
    scene: &SceneRecord,
) -> eodd_common::Result<bool> {
    let Some(local_path) = scene.local_path.as_deref() else {
        store
            .mark_processing_failed(scene.id, "archived scene has no local path")
            .await?;
        return Ok(false);
    };

    let job = ProcessingJob {
        sensor_id: &scene.sensor_id,
        remote_id: &scene.remote_id,
        local_path,
        metadata: &scene.metadata,
    };

    match processor.process(job).await {
        Ok(()) => {
            store.mark_processed(scene.id).await?;
            info!(sensor_id = %scene.sensor_id, scene_id = scene.id, remote_id = %scene.remote_id, "Processed");
            Ok(true)
        }
        Err(reason) => {
            store.mark_processing_failed(scene.id, &reason).await?;
            warn!(
                sensor_id = %scene.sensor_id,
                scene_id = scene.id,
                remote_id = %scene.remote_id,
                error = %reason,
                "Processing failed"
            );
            Ok(false)
        }
    }
}
