//! Configuration for eodd-ingest
//!
//! One TOML document read at startup: global scheduler settings, an optional
//! processing command and a `[[sensors]]` table per configured archive.
//! Credentials resolve ENV → TOML, warning when both are set.

use crate::db::StorePolicy;
use crate::models::BoundingBox;
use chrono::{DateTime, Utc};
use eodd_common::config::{load_toml, LoggingConfig};
use eodd_common::{Error, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const PLANET_API_KEY_ENV: &str = "EODD_PLANET_API_KEY";
pub const GCS_ACCESS_TOKEN_ENV: &str = "EODD_GCS_ACCESS_TOKEN";

/// Top-level configuration document
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Root folder; CLI and `EODD_ROOT_FOLDER` take precedence
    pub root_folder: Option<PathBuf>,

    /// Database file, relative paths resolve against the root folder
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Global download budget shared by all sensors (default: available cores)
    pub max_concurrent_downloads: Option<usize>,

    #[serde(default = "default_max_retries")]
    pub max_retries: i64,

    #[serde(default = "default_backoff_passes")]
    pub download_failure_backoff_passes: i64,

    /// Scenes claimed per batch (default: twice the concurrency)
    pub claim_batch_size: Option<usize>,

    /// DOWNLOADING/VALIDATING rows older than this are presumed abandoned
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_download_timeout_secs: u64,

    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,

    #[serde(default)]
    pub logging: LoggingConfig,

    pub processing: Option<ProcessingConfig>,

    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("eodd.db")
}

fn default_max_retries() -> i64 {
    3
}

fn default_backoff_passes() -> i64 {
    1
}

fn default_stale_timeout_secs() -> u64 {
    6 * 60 * 60
}

fn default_lock_wait_ms() -> u64 {
    5000
}

/// External processing command run for each archived scene
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    pub program: PathBuf,
    /// Arguments; `{sensor_id}`, `{local_path}` and `{remote_id}` are substituted
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_processing_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_processing_timeout_secs() -> u64 {
    2 * 60 * 60
}

/// One configured sensor
#[derive(Debug, Clone, Deserialize)]
pub struct SensorConfig {
    pub id: String,
    pub download_dir: PathBuf,
    /// `YYYY-MM-DD`; first sync starts here when no cursor exists
    pub start_date: Option<String>,
    /// Per-sensor cap below the global budget
    pub max_concurrent_downloads: Option<usize>,
    pub requests_per_second: Option<u32>,
    #[serde(flatten)]
    pub kind: SensorKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SensorKind {
    Planet(PlanetConfig),
    GcsBucket(GcsBucketConfig),
}

impl SensorKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            SensorKind::Planet(_) => "planet",
            SensorKind::GcsBucket(_) => "gcs_bucket",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanetConfig {
    #[serde(default = "default_planet_api_url")]
    pub api_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_planet_item_types")]
    pub item_types: Vec<String>,
    #[serde(default = "default_planet_asset_type")]
    pub asset_type: String,
    /// Percent, 0-100
    pub max_cloud_cover: Option<f64>,
    #[serde(default)]
    pub geo_bounds: Vec<BoundingBox>,
}

fn default_planet_api_url() -> String {
    "https://api.planet.com/data/v1".to_string()
}

fn default_planet_item_types() -> Vec<String> {
    vec!["PSScene".to_string()]
}

fn default_planet_asset_type() -> String {
    "ortho_analytic_4b".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcsBucketConfig {
    pub bucket: String,
    #[serde(default = "default_gcs_prefixes")]
    pub prefixes: Vec<String>,
    /// Single-object products: object names ending in this suffix
    #[serde(default = "default_product_suffix")]
    pub product_suffix: String,
    /// Directory products: path segment ending in this marker (such as
    /// `.SAFE/`) names the product folder; every object below it is a member.
    /// Takes precedence over `product_suffix`.
    pub product_marker: Option<String>,
    #[serde(default = "default_gcs_api_url")]
    pub api_url: String,
    pub access_token: Option<String>,
}

fn default_gcs_prefixes() -> Vec<String> {
    vec![String::new()]
}

fn default_product_suffix() -> String {
    ".zip".to_string()
}

fn default_gcs_api_url() -> String {
    "https://storage.googleapis.com".to_string()
}

impl IngestConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let config: IngestConfig = load_toml(path)?;
        config.validate()?;
        info!(
            path = %path.display(),
            sensors = config.sensors.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse and validate a configuration document held in memory
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: IngestConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_retries < 1 {
            return Err(Error::Config("max_retries must be at least 1".to_string()));
        }
        if self.max_concurrent_downloads == Some(0) {
            return Err(Error::Config("max_concurrent_downloads must be positive".to_string()));
        }
        if self.claim_batch_size == Some(0) {
            return Err(Error::Config("claim_batch_size must be positive".to_string()));
        }
        if self.download_failure_backoff_passes < 1 {
            warn!(
                configured = self.download_failure_backoff_passes,
                "download_failure_backoff_passes below 1; using 1"
            );
        }

        let mut ids = HashSet::new();
        for sensor in &self.sensors {
            if sensor.id.trim().is_empty() {
                return Err(Error::Config("sensor id must not be empty".to_string()));
            }
            if !ids.insert(sensor.id.as_str()) {
                return Err(Error::Config(format!("duplicate sensor id '{}'", sensor.id)));
            }
            sensor.validate()?;
        }

        if let Some(processing) = &self.processing {
            if processing.program.as_os_str().is_empty() {
                return Err(Error::Config("processing.program must not be empty".to_string()));
            }
            if processing.timeout_secs == 0 {
                return Err(Error::Config("processing.timeout_secs must be positive".to_string()));
            }
        }
        Ok(())
    }

    /// Global download budget
    pub fn effective_concurrency(&self) -> usize {
        self.max_concurrent_downloads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
    }

    pub fn effective_claim_batch_size(&self) -> usize {
        self.claim_batch_size
            .unwrap_or_else(|| self.effective_concurrency() * 2)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_download_timeout_secs)
    }

    pub fn store_policy(&self) -> StorePolicy {
        StorePolicy {
            max_retries: self.max_retries,
            backoff_passes: self.download_failure_backoff_passes.max(1),
            lock_wait_ms: self.lock_wait_ms,
        }
    }

    pub fn database_path(&self, root_folder: &Path) -> PathBuf {
        if self.database_path.is_absolute() {
            self.database_path.clone()
        } else {
            root_folder.join(&self.database_path)
        }
    }

    /// Sensors selected by an optional id filter
    pub fn selected_sensors(&self, only: Option<&str>) -> Result<Vec<&SensorConfig>> {
        match only {
            None => Ok(self.sensors.iter().collect()),
            Some(id) => self
                .sensors
                .iter()
                .find(|s| s.id == id)
                .map(|s| vec![s])
                .ok_or_else(|| Error::NotFound(format!("sensor '{}' is not configured", id))),
        }
    }
}

impl SensorConfig {
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::Config(format!("sensor '{}': {}", self.id, msg)));

        if self.max_concurrent_downloads == Some(0) {
            return fail("max_concurrent_downloads must be positive".to_string());
        }
        if self.requests_per_second == Some(0) {
            return fail("requests_per_second must be positive".to_string());
        }
        if let Err(e) = self.start_date() {
            return fail(e.to_string());
        }

        match &self.kind {
            SensorKind::Planet(planet) => {
                if planet.item_types.is_empty() {
                    return fail("item_types must not be empty".to_string());
                }
                if let Some(cc) = planet.max_cloud_cover {
                    if !(0.0..=100.0).contains(&cc) {
                        return fail(format!("max_cloud_cover {} outside 0-100", cc));
                    }
                }
                for bounds in &planet.geo_bounds {
                    if let Err(e) = bounds.validate() {
                        return fail(e);
                    }
                }
            }
            SensorKind::GcsBucket(gcs) => {
                if gcs.bucket.trim().is_empty() {
                    return fail("bucket must not be empty".to_string());
                }
                if gcs.prefixes.is_empty() {
                    return fail("prefixes must not be empty".to_string());
                }
                if let Some(marker) = &gcs.product_marker {
                    if marker.len() < 2 || !marker.ends_with('/') {
                        return fail(format!("product_marker '{}' must be a name ending in '/'", marker));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn start_date(&self) -> Result<Option<DateTime<Utc>>> {
        self.start_date
            .as_deref()
            .map(eodd_common::time::parse_date)
            .transpose()
    }
}

/// Resolve a credential: environment variable first, then the TOML value
pub fn resolve_secret(env_var: &str, toml_value: Option<&str>, label: &str) -> Option<String> {
    let env_value = std::env::var(env_var)
        .ok()
        .filter(|v| !v.trim().is_empty());
    let toml_value = toml_value.filter(|v| !v.trim().is_empty());

    match (env_value, toml_value) {
        (Some(env), Some(_)) => {
            warn!(
                "{} found in both {} and the config file; using the environment variable",
                label, env_var
            );
            Some(env)
        }
        (Some(env), None) => {
            info!("{} loaded from environment", label);
            Some(env)
        }
        (None, Some(toml)) => {
            info!("{} loaded from config file", label);
            Some(toml.to_string())
        }
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        root_folder = "/data/eodd"
        max_concurrent_downloads = 8
        max_retries = 4

        [logging]
        level = "debug"

        [processing]
        program = "/usr/local/bin/ard-process"
        args = ["--input", "{local_path}"]

        [[sensors]]
        id = "planet-ortho"
        type = "planet"
        download_dir = "/data/planet"
        start_date = "2024-01-01"
        item_types = ["PSOrthoTile"]
        asset_type = "analytic"
        max_cloud_cover = 30.0
        requests_per_second = 5
        [[sensors.geo_bounds]]
        north_lat = -35.0
        south_lat = -36.0
        west_lon = 148.0
        east_lon = 149.0

        [[sensors]]
        id = "s2-gcs"
        type = "gcs_bucket"
        download_dir = "/data/s2"
        bucket = "gcp-public-data-sentinel-2"
        prefixes = ["tiles/55/H/FA/"]
        product_marker = ".SAFE/"
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config = IngestConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.effective_concurrency(), 8);
        assert_eq!(config.effective_claim_batch_size(), 16);
        assert_eq!(config.processing.as_ref().unwrap().timeout_secs, 7200);

        match &config.sensors[0].kind {
            SensorKind::Planet(planet) => {
                assert_eq!(planet.geo_bounds.len(), 1);
                assert_eq!(planet.max_cloud_cover, Some(30.0));
                assert_eq!(planet.api_url, "https://api.planet.com/data/v1");
            }
            other => panic!("unexpected kind {:?}", other),
        }
        match &config.sensors[1].kind {
            SensorKind::GcsBucket(gcs) => {
                assert_eq!(gcs.product_suffix, ".zip");
                assert_eq!(gcs.product_marker.as_deref(), Some(".SAFE/"));
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(config.sensors[1].requests_per_second, None);
    }

    #[test]
    fn test_defaults_for_minimal_document() {
        let config = IngestConfig::from_toml_str("").unwrap();
        assert!(config.sensors.is_empty());
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.stale_download_timeout_secs, 21600);
        assert!(config.effective_concurrency() >= 1);
        assert_eq!(
            config.database_path(Path::new("/root")),
            PathBuf::from("/root/eodd.db")
        );
    }

    #[test]
    fn test_backoff_clamped_in_store_policy() {
        let config = IngestConfig::from_toml_str("download_failure_backoff_passes = 0").unwrap();
        assert_eq!(config.store_policy().backoff_passes, 1);
    }

    #[test]
    fn test_rejects_duplicate_sensor_ids() {
        let doc = r#"
            [[sensors]]
            id = "a"
            type = "gcs_bucket"
            download_dir = "/d"
            bucket = "b"
            [[sensors]]
            id = "a"
            type = "gcs_bucket"
            download_dir = "/d"
            bucket = "b"
        "#;
        let err = IngestConfig::from_toml_str(doc).unwrap_err();
        assert!(err.to_string().contains("duplicate sensor id"));
    }

    #[test]
    fn test_rejects_bad_bounds_and_cloud_cover() {
        let doc = r#"
            [[sensors]]
            id = "p"
            type = "planet"
            download_dir = "/d"
            max_cloud_cover = 130.0
        "#;
        assert!(IngestConfig::from_toml_str(doc).is_err());

        let doc = r#"
            [[sensors]]
            id = "p"
            type = "planet"
            download_dir = "/d"
            [[sensors.geo_bounds]]
            north_lat = 10.0
            south_lat = 20.0
            west_lon = 0.0
            east_lon = 1.0
        "#;
        assert!(IngestConfig::from_toml_str(doc).is_err());
    }

    #[test]
    fn test_rejects_zero_retries_and_bad_dates() {
        assert!(IngestConfig::from_toml_str("max_retries = 0").is_err());

        let doc = r#"
            [[sensors]]
            id = "g"
            type = "gcs_bucket"
            download_dir = "/d"
            bucket = "b"
            start_date = "last tuesday"
        "#;
        assert!(IngestConfig::from_toml_str(doc).is_err());
    }

    #[test]
    fn test_rejects_product_marker_without_trailing_slash() {
        let doc = r#"
            [[sensors]]
            id = "g"
            type = "gcs_bucket"
            download_dir = "/d"
            bucket = "b"
            product_marker = ".SAFE"
        "#;
        let err = IngestConfig::from_toml_str(doc).unwrap_err();
        assert!(err.to_string().contains("product_marker"));
    }

    #[test]
    fn test_unknown_sensor_type_rejected() {
        let doc = r#"
            [[sensors]]
            id = "x"
            type = "ftp"
            download_dir = "/d"
        "#;
        assert!(IngestConfig::from_toml_str(doc).is_err());
    }

    #[test]
    fn test_selected_sensors_filter() {
        let config = IngestConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.selected_sensors(None).unwrap().len(), 2);
        assert_eq!(config.selected_sensors(Some("s2-gcs")).unwrap()[0].id, "s2-gcs");
        assert!(config.selected_sensors(Some("nope")).is_err());
    }

    #[test]
    fn test_resolve_secret_toml_fallback() {
        let value = resolve_secret("EODD_TEST_UNSET_SECRET", Some("from-toml"), "Test key");
        assert_eq!(value.as_deref(), Some("from-toml"));
        assert!(resolve_secret("EODD_TEST_UNSET_SECRET", Some("  "), "Test key").is_none());
    }

    #[test]
    #[serial_test::serial]
    fn test_resolve_secret_env_wins() {
        std::env::set_var(PLANET_API_KEY_ENV, "from-env");
        let value = resolve_secret(PLANET_API_KEY_ENV, Some("from-toml"), "Planet API key");
        let env_only = resolve_secret(PLANET_API_KEY_ENV, None, "Planet API key");
        std::env::remove_var(PLANET_API_KEY_ENV);

        assert_eq!(value.as_deref(), Some("from-env"));
        assert_eq!(env_only.as_deref(), Some("from-env"));
        assert!(resolve_secret(PLANET_API_KEY_ENV, None, "Planet API key").is_none());
    }
}
