//! eodd-ingest library interface
//!
//! Earth Observation ingestion: sensor plugins, the scene record store and
//! the sync → download → validate → process pipeline. The `eodd` binary is a
//! thin CLI over these modules; integration tests use them directly.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod sensors;
pub mod services;
pub mod utils;

pub use crate::config::IngestConfig;
pub use crate::db::{RecordStore, StorePolicy};
pub use crate::error::{CatalogQueryError, DownloadError, IngestError, IngestResult, ValidationError};
pub use crate::sensors::{build_sensor, Sensor, SensorPlugin};
pub use crate::services::{Orchestrator, OrchestratorSettings, RunReport, Stage};

/// Build metadata baked in by build.rs
pub mod build_info {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
    pub const GIT_HASH: &str = env!("EODD_GIT_HASH");
    pub const BUILD_TIMESTAMP: &str = env!("EODD_BUILD_TIMESTAMP");
    pub const BUILD_PROFILE: &str = env!("EODD_BUILD_PROFILE");
}
