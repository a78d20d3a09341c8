//! Pipeline services
//!
//! Each stage works on one sensor at a time and talks to the rest of the
//! system only through the record store:
//! - `synchronizer`: catalog → DISCOVERED
//! - `scheduler`: DISCOVERED / DOWNLOAD_FAILED → DOWNLOADED or failure
//! - `validator`: DOWNLOADED → ARCHIVED or CORRUPT
//! - `processor`: ARCHIVED → PROCESSED or PROCESSING_FAILED
//! - `orchestrator`: runs the stages for all sensors
//! - `maintenance`: bulk resets and artifact cleanup for operators

pub mod maintenance;
pub mod orchestrator;
pub mod processor;
pub mod scheduler;
pub mod synchronizer;
pub mod validator;

pub use maintenance::{remove_artifacts, reset_in_state, BulkResetReport};
pub use orchestrator::{Orchestrator, OrchestratorSettings, RunReport, SensorOutcome, Stage};
pub use processor::{process_archived, CommandProcessor, ExternalProcessor, ProcessReport, ProcessingJob};
pub use scheduler::{DownloadReport, DownloadScheduler};
pub use synchronizer::{sync_sensor, sync_sensor_from, SyncFrom, SyncReport};
pub use validator::{ValidationReport, Validator};
