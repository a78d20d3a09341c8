//! Orchestration driver
//!
//! Runs the per-sensor pipeline (sync → download → validate → process) for
//! every configured sensor concurrently. Sensors share one download
//! semaphore and one cancellation token; everything else is per sensor.
//!
//! Failure scoping:
//! - a failed record is recorded on that record and the batch continues
//! - a catalog or sensor failure ends that sensor's remaining stages
//! - a store connectivity failure cancels the whole run and is returned

use super::processor::{process_archived, CommandProcessor, ExternalProcessor, ProcessReport};
use super::scheduler::{DownloadReport, DownloadScheduler};
use super::synchronizer::{sync_sensor_from, SyncFrom, SyncReport};
use super::validator::{ValidationReport, Validator};
use crate::config::IngestConfig;
use crate::db::{RecordStore, UsageEntry};
use crate::error::IngestResult;
use crate::sensors::SensorPlugin;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Sync,
    Download,
    Validate,
    Process,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Sync, Stage::Download, Stage::Validate, Stage::Process];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Sync => "sync",
            Stage::Download => "download",
            Stage::Validate => "validate",
            Stage::Process => "process",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown stage '{}'", s))
    }
}

/// Knobs the driver passes down to its services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Global download budget shared by all sensors
    pub max_concurrent_downloads: usize,
    pub claim_batch_size: usize,
    pub stale_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            max_concurrent_downloads: config.effective_concurrency(),
            claim_batch_size: config.effective_claim_batch_size(),
            stale_timeout: config.stale_timeout(),
        }
    }
}

/// What happened to one sensor during a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SensorOutcome {
    pub sensor_id: String,
    pub sync: Option<SyncReport>,
    pub download: Option<DownloadReport>,
    pub validation: Option<ValidationReport>,
    pub processing: Option<ProcessReport>,
    /// Stage failure that ended this sensor's run early
    pub error: Option<String>,
    /// Stages were skipped because the run was cancelled
    pub cancelled: bool,
}

impl SensorOutcome {
    fn new(sensor_id: &str) -> Self {
        Self {
            sensor_id: sensor_id.to_string(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub sensors: Vec<SensorOutcome>,
}

impl RunReport {
    /// True iff every sensor completed its stages
    ///
    /// Individual failed records do not count against a run; a sensor cut
    /// short by cancellation does.
    pub fn is_success(&self) -> bool {
        self.sensors.iter().all(|s| s.error.is_none() && !s.cancelled)
    }
}

pub struct Orchestrator<S: SensorPlugin, P: ExternalProcessor = CommandProcessor> {
    store: RecordStore,
    sensors: Vec<S>,
    settings: OrchestratorSettings,
    downloads: Arc<Semaphore>,
    processor: Option<P>,
    cancel: CancellationToken,
}

impl<S: SensorPlugin> Orchestrator<S> {
    pub fn new(store: RecordStore, sensors: Vec<S>, settings: OrchestratorSettings) -> Self {
        Self {
            store,
            sensors,
            downloads: Arc::new(Semaphore::new(settings.max_concurrent_downloads.max(1))),
            settings,
            processor: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl<S: SensorPlugin, P: ExternalProcessor> Orchestrator<S, P> {
    /// Attach the external processor used by the process stage
    pub fn with_processor<Q: ExternalProcessor>(self, processor: Q) -> Orchestrator<S, Q> {
        Orchestrator {
            store: self.store,
            sensors: self.sensors,
            settings: self.settings,
            downloads: self.downloads,
            processor: Some(processor),
            cancel: self.cancel,
        }
    }

    /// Token that stops the run between batches when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn sensors(&self) -> &[S] {
        &self.sensors
    }

    /// Startup crash recovery
    ///
    /// Scenes left DOWNLOADING longer than the stale timeout were orphaned by
    /// a dead process and become claimable again.
    pub async fn reconcile(&self) -> IngestResult<u64> {
        let stale = chrono::Duration::from_std(self.settings.stale_timeout).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(stale)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        let recovered = self.store.reconcile_stale_downloads(cutoff).await?;
        if recovered > 0 {
            warn!(recovered, "Recovered downloads orphaned by a previous run");
        }
        Ok(recovered)
    }

    /// Run the selected stages for every sensor
    ///
    /// Returns `Err` only for a fatal store failure; every other failure is
    /// reported in the sensor's [`SensorOutcome`].
    pub async fn run(&self, stages: &[Stage]) -> IngestResult<RunReport> {
        self.run_from(stages, SyncFrom::Cursor).await
    }

    /// As [`run`](Self::run), with the sync stage starting at `from`
    pub async fn run_from(&self, stages: &[Stage], from: SyncFrom) -> IngestResult<RunReport> {
        let run_id = Uuid::new_v4();
        info!(%run_id, sensors = self.sensors.len(), ?stages, ?from, "Starting run");

        let results = join_all(
            self.sensors
                .iter()
                .map(|sensor| self.run_sensor(sensor, stages, from, run_id)),
        )
        .await;

        let mut outcomes = Vec::with_capacity(results.len());
        for result in results {
            outcomes.push(result?);
        }
        let report = RunReport {
            run_id,
            sensors: outcomes,
        };

        let failed = report.sensors.iter().filter(|s| s.error.is_some()).count();
        let cancelled = report.sensors.iter().filter(|s| s.cancelled).count();
        let mut entry = UsageEntry::new(
            run_id,
            "NA",
            "run",
            format!(
                "{} sensors, {} failed, {} cancelled",
                report.sensors.len(),
                failed,
                cancelled
            ),
        );
        entry.failed = failed as i64;
        self.store.record_usage(&entry).await?;

        info!(%run_id, success = report.is_success(), failed_sensors = failed, "Run complete");
        Ok(report)
    }

    async fn run_sensor(
        &self,
        sensor: &S,
        stages: &[Stage],
        from: SyncFrom,
        run_id: Uuid,
    ) -> IngestResult<SensorOutcome> {
        let sensor_id = sensor.sensor_id();
        let mut outcome = SensorOutcome::new(sensor_id);

        for stage in Stage::ALL.into_iter().filter(|s| stages.contains(s)) {
            if self.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }

            let result = match stage {
                Stage::Sync => sync_sensor_from(&self.store, sensor, run_id, from)
                    .await
                    .map(|r| outcome.sync = Some(r)),
                Stage::Download => {
                    let scheduler = DownloadScheduler::new(
                        self.downloads.clone(),
                        self.settings.max_concurrent_downloads,
                        self.settings.claim_batch_size,
                        self.cancel.clone(),
                    );
                    scheduler
                        .run_pass(&self.store, sensor, run_id)
                        .await
                        .map(|r| outcome.download = Some(r))
                }
                Stage::Validate => {
                    let validator = Validator::new(
                        self.settings.claim_batch_size,
                        self.settings.stale_timeout,
                        self.cancel.clone(),
                    );
                    validator
                        .validate_pending(&self.store, sensor_id, run_id)
                        .await
                        .map(|r| outcome.validation = Some(r))
                }
                Stage::Process => match &self.processor {
                    Some(processor) => process_archived(&self.store, sensor_id, processor, &self.cancel, run_id)
                        .await
                        .map(|r| outcome.processing = Some(r)),
                    None => {
                        info!(sensor_id, "No processor configured; skipping process stage");
                        Ok(())
                    }
                },
            };

            if let Err(err) = result {
                if err.is_fatal() {
                    error!(sensor_id, %stage, error = %err, "Record store failure; cancelling run");
                    self.cancel.cancel();
                    return Err(err);
                }
                warn!(sensor_id, %stage, error = %err, "Stage failed; skipping remaining stages for sensor");
                outcome.error = Some(format!("{}: {}", stage, err));
                break;
            }
        }

        // A stage may have stopped early on the token
        if self.cancel.is_cancelled() {
            outcome.cancelled = true;
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_parse_and_order() {
        assert_eq!("Download".parse::<Stage>().unwrap(), Stage::Download);
        assert!("archive".parse::<Stage>().is_err());
        assert_eq!(Stage::ALL.first(), Some(&Stage::Sync));
        assert_eq!(Stage::ALL.last(), Some(&Stage::Process));
    }

    #[test]
    fn test_run_report_success() {
        let ok = SensorOutcome::new("a");
        let mut failed = SensorOutcome::new("b");
        failed.error = Some("sync: catalog returned HTTP 500".into());

        let report = RunReport {
            run_id: Uuid::new_v4(),
            sensors: vec![ok.clone()],
        };
        assert!(report.is_success());

        let report = RunReport {
            run_id: Uuid::new_v4(),
            sensors: vec![ok.clone(), failed],
        };
        assert!(!report.is_success());

        let mut cancelled = SensorOutcome::new("c");
        cancelled.cancelled = true;
        let report = RunReport {
            run_id: Uuid::new_v4(),
            sensors: vec![ok, cancelled],
        };
        assert!(!report.is_success());
    }
}
