//! Download scheduler
//!
//! Claims batches of downloadable scenes for one sensor and runs their
//! transfers through a bounded pool. Every transfer also holds a permit of
//! the process-wide download semaphore, so the sum of all sensor pools never
//! exceeds the global budget.
//!
//! A sensor-level failure (rejected credentials) halts the pass: the scene
//! that hit it and every claimed scene not yet started are handed back
//! uncharged, and the pass ends with [`IngestError::Sensor`].

use crate::db::{RecordStore, UsageEntry};
use crate::error::{IngestError, IngestResult};
use crate::models::{SceneRecord, SceneState};
use crate::sensors::SensorPlugin;
use eodd_common::Error;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of one download pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DownloadReport {
    pub claimed: u64,
    pub downloaded: u64,
    pub failed_retryable: u64,
    pub failed_permanent: u64,
    /// Claims handed back uncharged after a sensor-level failure
    pub released: u64,
}

impl DownloadReport {
    pub fn failed(&self) -> u64 {
        self.failed_retryable + self.failed_permanent
    }
}

/// How one claimed record ended up
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Downloaded,
    Failed(SceneState),
    /// The sensor failed on this scene; the claim was handed back
    SensorFailed(String),
    /// Not attempted because the pass was halted; the claim was handed back
    Released,
    /// Guarded transition lost to someone else
    Skipped,
}

pub struct DownloadScheduler {
    global: Arc<Semaphore>,
    pool_size: usize,
    claim_batch_size: usize,
    cancel: CancellationToken,
}

impl DownloadScheduler {
    /// `pool_size` is the default per-sensor pool; a sensor's own cap can
    /// only lower it
    pub fn new(
        global: Arc<Semaphore>,
        pool_size: usize,
        claim_batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            global,
            pool_size: pool_size.max(1),
            claim_batch_size: claim_batch_size.max(1),
            cancel,
        }
    }

    pub fn pool_size_for<S: SensorPlugin>(&self, sensor: &S) -> usize {
        sensor
            .max_concurrent_downloads()
            .map_or(self.pool_size, |cap| cap.min(self.pool_size))
            .max(1)
    }

    /// Run one download pass for `sensor`
    ///
    /// Stops when nothing is claimable or cancellation is requested; the
    /// check happens between batches, so in-flight transfers always finish
    /// and get their outcome recorded. Store errors and sensor-level failures
    /// end the pass early.
    pub async fn run_pass<S: SensorPlugin>(
        &self,
        store: &RecordStore,
        sensor: &S,
        run_id: Uuid,
    ) -> IngestResult<DownloadReport> {
        let sensor_id = sensor.sensor_id();
        let pass = store.begin_download_pass(sensor_id).await?;
        let pool_size = self.pool_size_for(sensor);
        let mut report = DownloadReport::default();
        let halt = CancellationToken::new();
        let mut sensor_failure: Option<String> = None;

        info!(sensor_id, pass, pool_size, "Starting download pass");

        loop {
            if self.cancel.is_cancelled() {
                info!(sensor_id, pass, "Download pass cancelled between batches");
                break;
            }

            let batch = store
                .claim_for_download(sensor_id, self.claim_batch_size as i64)
                .await?;
            if batch.is_empty() {
                break;
            }
            report.claimed += batch.len() as u64;
            debug!(sensor_id, pass, claimed = batch.len(), "Claimed download batch");

            let mut outcomes = stream::iter(batch)
                .map(|record| self.download_one(store, sensor, record, &halt))
                .buffer_unordered(pool_size);

            // Drain the whole batch even after a store failure so every
            // completed transfer gets a chance to record its outcome
            let mut store_error: Option<Error> = None;
            while let Some(outcome) = outcomes.next().await {
                match outcome {
                    Ok(Outcome::Downloaded) => report.downloaded += 1,
                    Ok(Outcome::Failed(SceneState::DownloadFailed)) => report.failed_retryable += 1,
                    Ok(Outcome::Failed(_)) => report.failed_permanent += 1,
                    Ok(Outcome::SensorFailed(message)) => {
                        report.released += 1;
                        sensor_failure.get_or_insert(message);
                    }
                    Ok(Outcome::Released) => report.released += 1,
                    Ok(Outcome::Skipped) => {}
                    Err(err) => {
                        error!(sensor_id, error = %err, "Record store failure during download pass");
                        store_error.get_or_insert(err);
                    }
                }
            }
            if let Some(err) = store_error {
                return Err(err.into());
            }
            if sensor_failure.is_some() {
                break;
            }
        }

        info!(
            sensor_id,
            pass,
            claimed = report.claimed,
            downloaded = report.downloaded,
            failed_retryable = report.failed_retryable,
            failed_permanent = report.failed_permanent,
            released = report.released,
            "Download pass complete"
        );

        let description = match &sensor_failure {
            Some(message) => format!("pass {}: halted: {}", pass, message),
            None => format!("pass {}: {} claimed", pass, report.claimed),
        };
        let mut entry = UsageEntry::new(run_id, sensor_id, "download", description);
        entry.downloaded = report.downloaded as i64;
        entry.failed = report.failed() as i64;
        store.record_usage(&entry).await?;

        match sensor_failure {
            Some(message) => Err(IngestError::Sensor {
                sensor_id: sensor_id.to_string(),
                message,
            }),
            None => Ok(report),
        }
    }

    async fn download_one<S: SensorPlugin>(
        &self,
        store: &RecordStore,
        sensor: &S,
        record: SceneRecord,
        halt: &CancellationToken,
    ) -> Result<Outcome, Error> {
        let sensor_id = sensor.sensor_id();
        let result = {
            let _permit = self
                .global
                .acquire()
                .await
                .map_err(|_| Error::Internal("download semaphore closed".to_string()))?;
            if halt.is_cancelled() {
                None
            } else {
                debug!(sensor_id, scene_id = record.id, remote_id = %record.remote_id, "Downloading");
                Some(sensor.download(&record).await)
            }
        };

        let outcome = match result {
            None => store
                .release_claim(record.id, "download pass halted by a sensor failure")
                .await
                .map(|_| Outcome::Released),
            Some(Ok(artifact)) => store
                .mark_downloaded(record.id, &artifact)
                .await
                .map(|()| {
                    info!(
                        sensor_id,
                        scene_id = record.id,
                        remote_id = %record.remote_id,
                        path = %artifact.path.display(),
                        "Downloaded"
                    );
                    Outcome::Downloaded
                }),
            Some(Err(err)) if err.is_sensor_failure() => {
                halt.cancel();
                error!(sensor_id, remote_id = %record.remote_id, error = %err, "Sensor failure; halting download pass");
                store
                    .release_claim(record.id, err.message())
                    .await
                    .map(|_| Outcome::SensorFailed(err.message().to_string()))
            }
            Some(Err(err)) => store
                .mark_failed(record.id, err.message(), err.is_retryable())
                .await
                .map(|state| {
                    warn!(
                        sensor_id,
                        scene_id = record.id,
                        remote_id = %record.remote_id,
                        retry_count = record.retry_count + 1,
                        state = %state,
                        error = %err,
                        "Download failed"
                    );
                    Outcome::Failed(state)
                }),
        };

        match outcome {
            Err(Error::Conflict(msg)) => {
                warn!(sensor_id, scene_id = record.id, "Download outcome not recorded: {}", msg);
                Ok(Outcome::Skipped)
            }
            other => other,
        }
    }
}
