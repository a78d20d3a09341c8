//! Sensor plugins
//!
//! A plugin knows how to list one remote catalog and how to fetch one
//! product. Everything stateful (cursors, claims, retries) lives in the
//! record store; plugins are stateless apart from HTTP clients and limiters.

pub mod gcs_bucket;
pub mod http;
pub mod planet;

#[cfg(test)]
mod test_server;

pub use gcs_bucket::GcsBucketSensor;
pub use planet::PlanetSensor;

use crate::config::{SensorConfig, SensorKind};
use crate::error::{CatalogQueryError, DownloadError};
use crate::models::{CandidateProduct, LocalArtifact, SceneRecord};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::future::Future;

/// Lazily paged catalog results, oldest acquisition first
pub type CandidateStream<'a> = BoxStream<'a, Result<CandidateProduct, CatalogQueryError>>;

/// Capability set every sensor provides
pub trait SensorPlugin: Send + Sync {
    /// Stable identifier; keys scenes and cursors in the store
    fn sensor_id(&self) -> &str;

    /// Products acquired at or after `cursor` (or the configured start date
    /// when no cursor exists yet)
    ///
    /// An `Err` item ends the query; the caller must not advance its cursor.
    fn query_since(&self, cursor: Option<DateTime<Utc>>) -> CandidateStream<'_>;

    /// Fetch one product to local storage
    ///
    /// Must not leave a partial file at the returned path.
    fn download(
        &self,
        record: &SceneRecord,
    ) -> impl Future<Output = Result<LocalArtifact, DownloadError>> + Send;

    /// Cap on simultaneous downloads for this sensor, below the global limit
    fn max_concurrent_downloads(&self) -> Option<usize> {
        None
    }
}

/// Configured sensor
pub enum Sensor {
    Planet(PlanetSensor),
    GcsBucket(GcsBucketSensor),
}

impl SensorPlugin for Sensor {
    fn sensor_id(&self) -> &str {
        match self {
            Sensor::Planet(s) => s.sensor_id(),
            Sensor::GcsBucket(s) => s.sensor_id(),
        }
    }

    fn query_since(&self, cursor: Option<DateTime<Utc>>) -> CandidateStream<'_> {
        match self {
            Sensor::Planet(s) => s.query_since(cursor),
            Sensor::GcsBucket(s) => s.query_since(cursor),
        }
    }

    async fn download(&self, record: &SceneRecord) -> Result<LocalArtifact, DownloadError> {
        match self {
            Sensor::Planet(s) => s.download(record).await,
            Sensor::GcsBucket(s) => s.download(record).await,
        }
    }

    fn max_concurrent_downloads(&self) -> Option<usize> {
        match self {
            Sensor::Planet(s) => s.max_concurrent_downloads(),
            Sensor::GcsBucket(s) => s.max_concurrent_downloads(),
        }
    }
}

/// Instantiate the plugin for one `[[sensors]]` entry
pub fn build_sensor(config: &SensorConfig) -> eodd_common::Result<Sensor> {
    config.validate()?;
    let sensor = match &config.kind {
        SensorKind::Planet(planet) => Sensor::Planet(PlanetSensor::new(config, planet)?),
        SensorKind::GcsBucket(gcs) => Sensor::GcsBucket(GcsBucketSensor::new(config, gcs)?),
    };
    tracing::debug!(sensor_id = %config.id, kind = config.kind.type_name(), "Sensor plugin ready");
    Ok(sensor)
}
