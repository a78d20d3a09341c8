//! Planet Data API sensor
//!
//! Catalog queries go through quick-search sorted by acquisition time and
//! follow `_links._next` pagination. Downloads resolve the configured asset,
//! requesting activation first when the asset is not yet active.

use super::http::{self, DirectRateLimiter};
use super::{CandidateStream, SensorPlugin};
use crate::config::{resolve_secret, PlanetConfig, SensorConfig, PLANET_API_KEY_ENV};
use crate::error::{CatalogQueryError, DownloadError};
use crate::models::{BoundingBox, CandidateProduct, LocalArtifact, SceneRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{debug, info, warn};

const DEFAULT_REQUESTS_PER_SECOND: u32 = 5;

/// What to do with an asset in its current activation status
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetAction {
    /// POST to this link, then come back later
    Activate(String),
    /// Activation in progress
    Wait,
    /// Ready to transfer
    Fetch {
        location: String,
        md5: Option<String>,
    },
}

pub struct PlanetSensor {
    id: String,
    config: PlanetConfig,
    api_key: Option<String>,
    download_dir: PathBuf,
    start_date: Option<DateTime<Utc>>,
    max_concurrent_downloads: Option<usize>,
    client: Client,
    limiter: DirectRateLimiter,
}

impl PlanetSensor {
    pub fn new(sensor: &SensorConfig, config: &PlanetConfig) -> eodd_common::Result<Self> {
        let api_key = resolve_secret(
            PLANET_API_KEY_ENV,
            config.api_key.as_deref(),
            "Planet API key",
        );
        if api_key.is_none() {
            warn!(sensor_id = %sensor.id, "No Planet API key configured; requests will be anonymous");
        }
        let client = http::build_client()
            .map_err(|e| eodd_common::Error::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            id: sensor.id.clone(),
            config: config.clone(),
            api_key,
            download_dir: sensor.download_dir.clone(),
            start_date: sensor.start_date()?,
            max_concurrent_downloads: sensor.max_concurrent_downloads,
            client,
            limiter: http::rate_limiter(
                sensor
                    .requests_per_second
                    .unwrap_or(DEFAULT_REQUESTS_PER_SECOND),
            ),
        })
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.basic_auth(key, Some("")),
            None => request,
        }
    }

    /// quick-search request body
    pub fn search_request(&self, since: Option<DateTime<Utc>>) -> Value {
        let mut filters = Vec::new();

        if let Some(since) = since {
            filters.push(json!({
                "type": "DateRangeFilter",
                "field_name": "acquired",
                "config": { "gte": since.to_rfc3339_opts(SecondsFormat::Micros, true) }
            }));
        }

        if let Some(max_cloud) = self.config.max_cloud_cover {
            filters.push(json!({
                "type": "RangeFilter",
                "field_name": "cloud_cover",
                "config": { "lte": max_cloud / 100.0 }
            }));
        }

        if !self.config.geo_bounds.is_empty() {
            let geometries: Vec<Value> = self
                .config
                .geo_bounds
                .iter()
                .map(|b| {
                    json!({
                        "type": "GeometryFilter",
                        "field_name": "geometry",
                        "config": bbox_polygon(b)
                    })
                })
                .collect();
            filters.push(json!({ "type": "OrFilter", "config": geometries }));
        }

        json!({
            "item_types": self.config.item_types,
            "filter": { "type": "AndFilter", "config": filters }
        })
    }

    fn destination(&self, remote_id: &str) -> PathBuf {
        let ext = asset_extension(&self.config.asset_type);
        self.download_dir
            .join(remote_id)
            .join(format!("{}_{}.{}", remote_id, self.config.asset_type, ext))
    }
}

impl SensorPlugin for PlanetSensor {
    fn sensor_id(&self) -> &str {
        &self.id
    }

    fn max_concurrent_downloads(&self) -> Option<usize> {
        self.max_concurrent_downloads
    }

    fn query_since(&self, cursor: Option<DateTime<Utc>>) -> CandidateStream<'_> {
        let since = cursor.or(self.start_date);
        let body = self.search_request(since);
        let search_url = format!(
            "{}/quick-search?_sort=acquired%20asc",
            self.config.api_url.trim_end_matches('/')
        );

        async_stream::try_stream! {
            self.limiter.until_ready().await;
            let first = self.authorize(self.client.post(&search_url))
                .timeout(http::CATALOG_TIMEOUT)
                .json(&body);
            let mut page: Value = http::send_catalog(first).await?.json().await?;
            let mut page_count = 1;

            loop {
                for feature in features(&page)? {
                    yield parse_feature(feature)?;
                }

                let Some(next) = next_link(&page) else { break };
                self.limiter.until_ready().await;
                let request = self.authorize(self.client.get(&next)).timeout(http::CATALOG_TIMEOUT);
                page = http::send_catalog(request).await?.json().await?;
                page_count += 1;
            }

            debug!(sensor_id = %self.id, pages = page_count, "Planet search complete");
        }
        .boxed()
    }

    async fn download(&self, record: &SceneRecord) -> Result<LocalArtifact, DownloadError> {
        let assets_url = record.remote_url.as_deref().ok_or_else(|| {
            DownloadError::Permanent(format!("scene {} has no assets link", record.remote_id))
        })?;

        self.limiter.until_ready().await;
        let request = self
            .authorize(self.client.get(assets_url))
            .timeout(http::CATALOG_TIMEOUT);
        let assets: Value = http::send_lookup(request, "asset lookup")
            .await?
            .json()
            .await
            .map_err(|e| DownloadError::Transient(format!("asset lookup response: {}", e)))?;

        match asset_action(&assets, &self.config.asset_type)? {
            AssetAction::Activate(link) => {
                self.limiter.until_ready().await;
                let request = self
                    .authorize(self.client.post(&link))
                    .timeout(http::CATALOG_TIMEOUT);
                http::send_lookup(request, "asset activation").await?;
                info!(
                    sensor_id = %self.id,
                    remote_id = %record.remote_id,
                    asset = %self.config.asset_type,
                    "Requested asset activation"
                );
                Err(DownloadError::Transient("asset activation requested".to_string()))
            }
            AssetAction::Wait => Err(DownloadError::Transient("asset still activating".to_string())),
            AssetAction::Fetch { location, md5 } => {
                let dest = self.destination(&record.remote_id);
                self.limiter.until_ready().await;
                let response =
                    http::send_download(self.authorize(self.client.get(&location)), "asset download")
                        .await?;
                let size = http::stream_to_file(response, &dest).await?;
                Ok(LocalArtifact {
                    path: dest,
                    size: Some(size),
                    reported_checksum: md5,
                })
            }
        }
    }
}

fn features(page: &Value) -> Result<&Vec<Value>, CatalogQueryError> {
    page.get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| CatalogQueryError::Parse("search page has no features array".to_string()))
}

fn next_link(page: &Value) -> Option<String> {
    page.pointer("/_links/_next")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Closed polygon ring for a bounding box
fn bbox_polygon(b: &BoundingBox) -> Value {
    json!({
        "type": "Polygon",
        "coordinates": [[
            [b.west_lon, b.south_lat],
            [b.east_lon, b.south_lat],
            [b.east_lon, b.north_lat],
            [b.west_lon, b.north_lat],
            [b.west_lon, b.south_lat]
        ]]
    })
}

fn asset_extension(asset_type: &str) -> &'static str {
    if asset_type.ends_with("_xml") {
        "xml"
    } else if asset_type.ends_with("_json") {
        "json"
    } else {
        "tif"
    }
}

/// Collect every `[lon, lat]` pair in a GeoJSON coordinates tree
fn collect_points(value: &Value, out: &mut Vec<(f64, f64)>) {
    if let Some(items) = value.as_array() {
        match (items.first().and_then(Value::as_f64), items.get(1).and_then(Value::as_f64)) {
            (Some(lon), Some(lat)) => out.push((lon, lat)),
            _ => items.iter().for_each(|item| collect_points(item, out)),
        }
    }
}

/// Map one search feature to a candidate
pub fn parse_feature(feature: &Value) -> Result<CandidateProduct, CatalogQueryError> {
    let id = feature
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| CatalogQueryError::Parse("feature without id".to_string()))?;
    let properties = feature
        .get("properties")
        .and_then(Value::as_object)
        .ok_or_else(|| CatalogQueryError::Parse(format!("feature {} without properties", id)))?;
    let acquired = properties
        .get("acquired")
        .and_then(Value::as_str)
        .ok_or_else(|| CatalogQueryError::Parse(format!("feature {} without acquired time", id)))?;
    let acquisition_time = DateTime::parse_from_rfc3339(acquired)
        .map_err(|e| CatalogQueryError::Parse(format!("feature {} acquired '{}': {}", id, acquired, e)))?
        .with_timezone(&Utc);

    let mut points = Vec::new();
    if let Some(coordinates) = feature.pointer("/geometry/coordinates") {
        collect_points(coordinates, &mut points);
    }

    let mut metadata = properties.clone();
    metadata.remove("acquired");
    if let Some(item_type) = feature.pointer("/properties/item_type").cloned() {
        metadata.insert("item_type".to_string(), item_type);
    }

    let mut candidate = CandidateProduct::new(id, acquisition_time);
    candidate.bbox = BoundingBox::enclosing(points);
    candidate.cloud_cover = properties
        .get("cloud_cover")
        .and_then(Value::as_f64)
        .map(|fraction| fraction * 100.0);
    candidate.remote_url = feature
        .pointer("/_links/assets")
        .and_then(Value::as_str)
        .map(str::to_string);
    candidate.metadata = Value::Object(metadata);
    Ok(candidate)
}

/// Decide the next step for `asset_type` given an assets listing
pub fn asset_action(assets: &Value, asset_type: &str) -> Result<AssetAction, DownloadError> {
    let asset = assets.get(asset_type).ok_or_else(|| {
        DownloadError::Permanent(format!("asset type '{}' not offered for this item", asset_type))
    })?;

    let can_download = asset
        .get("_permissions")
        .and_then(Value::as_array)
        .map(|perms| perms.iter().any(|p| p.as_str() == Some("download")))
        .unwrap_or(false);
    if !can_download {
        return Err(DownloadError::Permanent(format!(
            "no download permission for asset '{}'",
            asset_type
        )));
    }

    match asset.get("status").and_then(Value::as_str) {
        Some("active") => {
            let location = asset
                .get("location")
                .and_then(Value::as_str)
                .ok_or_else(|| DownloadError::Transient("active asset without location".to_string()))?;
            Ok(AssetAction::Fetch {
                location: location.to_string(),
                md5: asset
                    .get("md5_digest")
                    .and_then(Value::as_str)
                    .map(str::to_lowercase),
            })
        }
        Some("inactive") => asset
            .pointer("/_links/activate")
            .and_then(Value::as_str)
            .map(|link| AssetAction::Activate(link.to_string()))
            .ok_or_else(|| DownloadError::Permanent("inactive asset without activation link".to_string())),
        Some("activating") => Ok(AssetAction::Wait),
        other => Err(DownloadError::Transient(format!(
            "unexpected asset status {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use crate::sensors::test_server::{scene, Reply, TestServer};
    use chrono::TimeZone;
    use std::path::Path;
    use tempfile::TempDir;

    fn sample_feature() -> Value {
        json!({
            "id": "20240301_101530_0f4e",
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[148.1, -35.9], [148.6, -35.9], [148.6, -35.2], [148.1, -35.2], [148.1, -35.9]]]
            },
            "properties": {
                "acquired": "2024-03-01T10:15:30.123456Z",
                "cloud_cover": 0.12,
                "item_type": "PSScene",
                "satellite_id": "2447"
            },
            "_links": {
                "assets": "https://api.planet.com/data/v1/item-types/PSScene/items/20240301_101530_0f4e/assets/"
            }
        })
    }

    fn sensor_at(api_url: &str, download_dir: &Path) -> PlanetSensor {
        let config = IngestConfig::from_toml_str(&format!(
            r#"
            [[sensors]]
            id = "planet"
            type = "planet"
            download_dir = "{}"
            start_date = "2024-01-01"
            api_url = "{}"
            asset_type = "ortho_analytic_4b"
            max_cloud_cover = 30.0
            [[sensors.geo_bounds]]
            north_lat = -35.0
            south_lat = -36.0
            west_lon = 148.0
            east_lon = 149.0
            "#,
            download_dir.display(),
            api_url
        ))
        .unwrap();
        let sensor = &config.sensors[0];
        match &sensor.kind {
            crate::config::SensorKind::Planet(planet) => PlanetSensor::new(sensor, planet).unwrap(),
            other => panic!("unexpected kind {:?}", other),
        }
    }

    fn sensor() -> PlanetSensor {
        sensor_at("https://api.planet.com/data/v1", Path::new("/data/planet"))
    }

    fn feature(base: &str, id: &str, acquired: &str) -> Value {
        json!({
            "id": id,
            "properties": { "acquired": acquired, "item_type": "PSScene" },
            "_links": { "assets": format!("{}/items/{}/assets", base, id) }
        })
    }

    #[test]
    fn test_parse_feature() {
        let candidate = parse_feature(&sample_feature()).unwrap();
        assert_eq!(candidate.remote_id, "20240301_101530_0f4e");
        assert_eq!(
            candidate.acquisition_time,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 30).unwrap()
                + chrono::Duration::microseconds(123_456)
        );
        assert!((candidate.cloud_cover.unwrap() - 12.0).abs() < 1e-9);
        let bbox = candidate.bbox.unwrap();
        assert_eq!(bbox.north_lat, -35.2);
        assert_eq!(bbox.west_lon, 148.1);
        assert!(candidate.remote_url.unwrap().ends_with("/assets/"));
        assert_eq!(candidate.metadata["satellite_id"], "2447");
        assert!(candidate.metadata.get("acquired").is_none());
    }

    #[test]
    fn test_parse_feature_missing_acquired() {
        let mut feature = sample_feature();
        feature["properties"].as_object_mut().unwrap().remove("acquired");
        assert!(matches!(parse_feature(&feature), Err(CatalogQueryError::Parse(_))));
    }

    #[test]
    fn test_next_link() {
        let page = json!({"features": [], "_links": {"_next": "https://next"}});
        assert_eq!(next_link(&page).as_deref(), Some("https://next"));
        let last = json!({"features": [], "_links": {}});
        assert_eq!(next_link(&last), None);
    }

    #[tokio::test]
    async fn test_search_request_filters() {
        let sensor = sensor();
        let since = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let body = sensor.search_request(Some(since));

        let filters = body["filter"]["config"].as_array().unwrap();
        assert_eq!(body["filter"]["type"], "AndFilter");
        assert_eq!(filters.len(), 3);
        assert_eq!(filters[0]["config"]["gte"], "2024-02-01T00:00:00.000000Z");
        assert!((filters[1]["config"]["lte"].as_f64().unwrap() - 0.3).abs() < 1e-9);
        assert_eq!(filters[2]["type"], "OrFilter");
        assert_eq!(body["item_types"][0], "PSScene");
    }

    #[tokio::test]
    async fn test_destination_layout() {
        let sensor = sensor();
        assert_eq!(
            sensor.destination("abc"),
            PathBuf::from("/data/planet/abc/abc_ortho_analytic_4b.tif")
        );
    }

    #[test]
    fn test_asset_action_by_status() {
        let assets = json!({
            "analytic": {
                "_permissions": ["download"],
                "status": "inactive",
                "_links": {"activate": "https://activate"}
            },
            "udm": {"_permissions": ["download"], "status": "activating"},
            "visual": {
                "_permissions": ["download"],
                "status": "active",
                "location": "https://dl",
                "md5_digest": "ABCDEF"
            },
            "basic": {"_permissions": [], "status": "active", "location": "https://dl"}
        });

        assert_eq!(
            asset_action(&assets, "analytic").unwrap(),
            AssetAction::Activate("https://activate".to_string())
        );
        assert_eq!(asset_action(&assets, "udm").unwrap(), AssetAction::Wait);
        assert_eq!(
            asset_action(&assets, "visual").unwrap(),
            AssetAction::Fetch {
                location: "https://dl".to_string(),
                md5: Some("abcdef".to_string())
            }
        );
        assert!(!asset_action(&assets, "basic").unwrap_err().is_retryable());
        assert!(!asset_action(&assets, "missing").unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_query_follows_next_links_in_order() {
        let server = TestServer::start(|base, request| match request.target.as_str() {
            "/page2" => Reply::json(json!({
                "features": [feature(base, "c", "2024-01-04T00:00:00Z")],
                "_links": {}
            })),
            _ => Reply::json(json!({
                "features": [
                    feature(base, "a", "2024-01-02T00:00:00Z"),
                    feature(base, "b", "2024-01-03T00:00:00Z"),
                ],
                "_links": { "_next": format!("{}/page2", base) }
            })),
        })
        .await;
        let sensor = sensor_at(&server.url(""), Path::new("/data/planet"));

        let cursor = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let candidates: Vec<CandidateProduct> = sensor
            .query_since(Some(cursor))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();
        let ids: Vec<&str> = candidates.iter().map(|c| c.remote_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(candidates[0].remote_url, Some(server.url("/items/a/assets")));

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].target, "/quick-search?_sort=acquired%20asc");
        assert!(requests[0].body.contains("2024-01-02T00:00:00.000000Z"), "{}", requests[0].body);
        assert_eq!(requests[1].method, "GET");
        assert_eq!(requests[1].target, "/page2");
    }

    #[tokio::test]
    async fn test_active_asset_downloads_to_disk() {
        let server = TestServer::start(|base, request| {
            if request.target.ends_with("/assets") {
                Reply::json(json!({
                    "ortho_analytic_4b": {
                        "_permissions": ["download"],
                        "status": "active",
                        "location": format!("{}/download/a", base),
                        "md5_digest": "5D41402ABC4B2A76B9719D911017C592"
                    }
                }))
            } else {
                Reply::bytes("hello")
            }
        })
        .await;
        let dir = TempDir::new().unwrap();
        let sensor = sensor_at(&server.url(""), dir.path());

        let artifact = sensor
            .download(&scene("a", Some(server.url("/items/a/assets"))))
            .await
            .unwrap();
        assert_eq!(artifact.path, dir.path().join("a").join("a_ortho_analytic_4b.tif"));
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"hello");
        assert_eq!(artifact.size, Some(5));
        assert_eq!(
            artifact.reported_checksum.as_deref(),
            Some("5d41402abc4b2a76b9719d911017c592")
        );
        assert_eq!(server.requests()[1].target, "/download/a");
    }

    #[tokio::test]
    async fn test_inactive_asset_requests_activation() {
        let server = TestServer::start(|base, request| {
            if request.method == "POST" {
                Reply::status(202)
            } else {
                Reply::json(json!({
                    "ortho_analytic_4b": {
                        "_permissions": ["download"],
                        "status": "inactive",
                        "_links": { "activate": format!("{}/activate/a", base) }
                    }
                }))
            }
        })
        .await;
        let sensor = sensor_at(&server.url(""), Path::new("/data/planet"));

        let err = sensor
            .download(&scene("a", Some(server.url("/items/a/assets"))))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let requests = server.requests();
        assert_eq!(requests[1].method, "POST");
        assert_eq!(requests[1].target, "/activate/a");
    }

    #[tokio::test]
    async fn test_rejected_key_on_lookup_is_a_sensor_failure() {
        for status in [401, 403] {
            let server = TestServer::start(move |_, _| Reply::status(status)).await;
            let sensor = sensor_at(&server.url(""), Path::new("/data/planet"));

            let err = sensor
                .download(&scene("a", Some(server.url("/items/a/assets"))))
                .await
                .unwrap_err();
            assert!(err.is_sensor_failure(), "HTTP {}: {:?}", status, err);
            assert_eq!(server.requests().len(), 1);
        }
    }
}
