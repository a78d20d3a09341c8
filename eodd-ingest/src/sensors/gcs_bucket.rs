//! Cloud Storage bucket sensor
//!
//! Lists objects under the configured prefixes through the JSON API. A
//! product is either one object ending in `product_suffix`, or, when
//! `product_marker` is set, every object below a folder whose name ends in
//! the marker. Listing order is lexical, so a prefix is listed in full and
//! sorted by acquisition time before anything is yielded.
//!
//! Downloads mirror the object path under `download_dir`, so tiles sharing
//! a file name in different folders never collide.

use super::http::{self, DirectRateLimiter};
use super::{CandidateStream, SensorPlugin};
use crate::config::{resolve_secret, GcsBucketConfig, SensorConfig, GCS_ACCESS_TOKEN_ENV};
use crate::error::{CatalogQueryError, DownloadError};
use crate::models::{CandidateProduct, LocalArtifact, SceneRecord};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Url};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DEFAULT_REQUESTS_PER_SECOND: u32 = 20;

/// One entry of an objects listing
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsObject {
    pub name: String,
    /// Decimal string
    pub size: Option<String>,
    /// Base64 MD5
    pub md5_hash: Option<String>,
    pub time_created: Option<String>,
    pub media_link: Option<String>,
    pub generation: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectListing {
    #[serde(default)]
    items: Vec<GcsObject>,
    next_page_token: Option<String>,
}

pub struct GcsBucketSensor {
    id: String,
    config: GcsBucketConfig,
    access_token: Option<String>,
    download_dir: PathBuf,
    start_date: Option<DateTime<Utc>>,
    max_concurrent_downloads: Option<usize>,
    client: Client,
    limiter: DirectRateLimiter,
}

impl GcsBucketSensor {
    pub fn new(sensor: &SensorConfig, config: &GcsBucketConfig) -> eodd_common::Result<Self> {
        let access_token = resolve_secret(
            GCS_ACCESS_TOKEN_ENV,
            config.access_token.as_deref(),
            "Cloud Storage access token",
        );
        let client = http::build_client()
            .map_err(|e| eodd_common::Error::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            id: sensor.id.clone(),
            config: config.clone(),
            access_token,
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
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn list_url(&self) -> String {
        format!(
            "{}/storage/v1/b/{}/o",
            self.config.api_url.trim_end_matches('/'),
            self.config.bucket
        )
    }

    /// Every object under `prefix`, across all listing pages
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<GcsObject>, CatalogQueryError> {
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            self.limiter.until_ready().await;
            let mut request = self
                .authorize(self.client.get(self.list_url()))
                .timeout(http::CATALOG_TIMEOUT)
                .query(&[("prefix", prefix)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let listing: ObjectListing = http::send_catalog(request).await?.json().await?;
            objects.extend(listing.items);

            match listing.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        debug!(sensor_id = %self.id, prefix, objects = objects.len(), "Listed bucket prefix");
        Ok(objects)
    }

    /// Media URL used when the listing carries no `mediaLink`
    fn media_url(&self, object_name: &str) -> Result<String, DownloadError> {
        let mut url = Url::parse(&format!(
            "{}/download/storage/v1/b/",
            self.config.api_url.trim_end_matches('/')
        ))
        .map_err(|e| DownloadError::Permanent(format!("invalid api_url: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| DownloadError::Permanent("api_url cannot be a base".to_string()))?
            .pop_if_empty()
            .push(&self.config.bucket)
            .push("o")
            .push(object_name);
        url.query_pairs_mut().append_pair("alt", "media");
        Ok(url.to_string())
    }

    /// Candidates for one listing, in listing order
    pub fn to_candidates(&self, objects: &[GcsObject]) -> Vec<CandidateProduct> {
        match &self.config.product_marker {
            Some(marker) => group_directory_products(objects, marker, &self.config.bucket),
            None => objects
                .iter()
                .filter_map(|o| object_to_candidate(o, &self.config.product_suffix, &self.config.bucket))
                .collect(),
        }
    }

    async fn fetch_object(&self, object_name: &str, media_link: Option<&str>, dest: &Path) -> Result<i64, DownloadError> {
        let url = match media_link {
            Some(url) => url.to_string(),
            None => self.media_url(object_name)?,
        };
        self.limiter.until_ready().await;
        // 403 here means the token lacks read access to the bucket
        let response = http::send_lookup(self.authorize(self.client.get(&url)), "object download").await?;
        http::stream_to_file(response, dest).await
    }

    /// Fetch every member of a product folder into `dest`
    ///
    /// Members land in `<dest>.part` first; the folder is renamed into place
    /// only once every member is complete.
    async fn download_directory(&self, product: &str, dest: &Path) -> Result<i64, DownloadError> {
        let folder = format!("{}/", product);
        let members: Vec<GcsObject> = self
            .list_prefix(&folder)
            .await?
            .into_iter()
            .filter(|o| is_member_object(&o.name))
            .collect();
        if members.is_empty() {
            return Err(DownloadError::Permanent(format!("product folder '{}' has no objects", product)));
        }

        let staging = http::partial_path(dest);
        remove_dir_if_present(&staging).await?;

        let mut total = 0i64;
        for member in &members {
            let relative = &member.name[folder.len()..];
            let target = local_path_for(&staging, relative)?;
            match self.fetch_object(&member.name, member.media_link.as_deref(), &target).await {
                Ok(size) => total += size,
                Err(err) => {
                    if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                        warn!(path = %staging.display(), error = %e, "Failed to remove partial product folder");
                    }
                    return Err(err);
                }
            }
        }

        remove_dir_if_present(dest).await?;
        tokio::fs::rename(&staging, dest).await?;
        debug!(sensor_id = %self.id, product, members = members.len(), bytes = total, "Product folder complete");
        Ok(total)
    }
}

async fn remove_dir_if_present(path: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl SensorPlugin for GcsBucketSensor {
    fn sensor_id(&self) -> &str {
        &self.id
    }

    fn max_concurrent_downloads(&self) -> Option<usize> {
        self.max_concurrent_downloads
    }

    fn query_since(&self, cursor: Option<DateTime<Utc>>) -> CandidateStream<'_> {
        let since = cursor.or(self.start_date);

        async_stream::try_stream! {
            let mut candidates = Vec::new();
            for prefix in &self.config.prefixes {
                let objects = self.list_prefix(prefix).await?;
                candidates.extend(
                    self.to_candidates(&objects)
                        .into_iter()
                        .filter(|c| since.map_or(true, |s| c.acquisition_time >= s)),
                );
            }

            candidates.sort_by(|a, b| {
                (a.acquisition_time, &a.remote_id).cmp(&(b.acquisition_time, &b.remote_id))
            });
            candidates.dedup_by(|a, b| a.remote_id == b.remote_id);

            for candidate in candidates {
                yield candidate;
            }
        }
        .boxed()
    }

    async fn download(&self, record: &SceneRecord) -> Result<LocalArtifact, DownloadError> {
        let dest = local_path_for(&self.download_dir, &record.remote_id)?;
        let size = if self.config.product_marker.is_some() {
            self.download_directory(&record.remote_id, &dest).await?
        } else {
            self.fetch_object(&record.remote_id, record.remote_url.as_deref(), &dest)
                .await?
        };

        Ok(LocalArtifact {
            path: dest,
            size: Some(size),
            reported_checksum: None,
        })
    }
}

/// Where an object (or product folder) lands below `base`
///
/// Empty, `.` and `..` segments are dropped so a name can never climb out
/// of `base`.
pub fn local_path_for(base: &Path, object_name: &str) -> Result<PathBuf, DownloadError> {
    let mut path = base.to_path_buf();
    let mut pushed = false;
    for segment in object_name.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            continue;
        }
        path.push(segment);
        pushed = true;
    }
    if !pushed {
        return Err(DownloadError::Permanent(format!(
            "object name '{}' has no usable path",
            object_name
        )));
    }
    Ok(path)
}

/// Folder placeholders and console `$folder$` markers are not data
fn is_member_object(name: &str) -> bool {
    !name.is_empty() && !name.ends_with('/') && !name.contains("$folder$")
}

/// Product folder an object belongs to, without the trailing slash
pub fn product_root<'a>(object_name: &'a str, marker: &str) -> Option<&'a str> {
    let start = object_name.find(marker)?;
    let end = start + marker.len();
    if end >= object_name.len() {
        return None;
    }
    Some(&object_name[..end - 1])
}

/// Group a listing into directory products keyed by their folder
pub fn group_directory_products(objects: &[GcsObject], marker: &str, bucket: &str) -> Vec<CandidateProduct> {
    let mut folders: BTreeMap<&str, Vec<&GcsObject>> = BTreeMap::new();
    for object in objects.iter().filter(|o| is_member_object(&o.name)) {
        if let Some(root) = product_root(&object.name, marker) {
            folders.entry(root).or_default().push(object);
        }
    }

    folders
        .into_iter()
        .filter_map(|(root, members)| {
            let acquisition_time = timestamp_from_name(root).or_else(|| {
                members
                    .iter()
                    .filter_map(|m| m.time_created.as_deref())
                    .filter_map(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .min()
            })?;

            let mut candidate = CandidateProduct::new(root, acquisition_time);
            candidate.expected_size = members
                .iter()
                .map(|m| m.size.as_deref().and_then(|s| s.parse::<i64>().ok()))
                .sum::<Option<i64>>();
            candidate.metadata = json!({
                "bucket": bucket,
                "product": root,
                "members": members.len(),
            });
            Some(candidate)
        })
        .collect()
}

/// First `YYYYMMDDTHHMMSS` token in an object name
pub fn timestamp_from_name(name: &str) -> Option<DateTime<Utc>> {
    let bytes = name.as_bytes();
    (0..bytes.len().saturating_sub(14)).find_map(|start| {
        let window = &bytes[start..start + 15];
        let shaped = window[8] == b'T'
            && window[..8].iter().all(u8::is_ascii_digit)
            && window[9..].iter().all(u8::is_ascii_digit);
        if !shaped {
            return None;
        }
        let text = std::str::from_utf8(window).ok()?;
        NaiveDateTime::parse_from_str(text, "%Y%m%dT%H%M%S")
            .ok()
            .map(|naive| naive.and_utc())
    })
}

/// Base64 MD5 as lower-case hex
pub fn md5_base64_to_hex(value: &str) -> Option<String> {
    let raw = BASE64.decode(value.trim()).ok()?;
    if raw.len() != 16 {
        return None;
    }
    Some(raw.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Map a listed object to a candidate; non-product objects yield `None`
pub fn object_to_candidate(object: &GcsObject, product_suffix: &str, bucket: &str) -> Option<CandidateProduct> {
    if !object.name.ends_with(product_suffix) {
        return None;
    }

    let acquisition_time = timestamp_from_name(&object.name).or_else(|| {
        object
            .time_created
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
    })?;

    let mut candidate = CandidateProduct::new(object.name.clone(), acquisition_time);
    candidate.remote_url = object.media_link.clone();
    candidate.expected_size = object.size.as_deref().and_then(|s| s.parse().ok());
    candidate.expected_checksum = object.md5_hash.as_deref().and_then(md5_base64_to_hex);
    candidate.metadata = json!({
        "bucket": bucket,
        "object": object.name,
        "generation": object.generation,
        "time_created": object.time_created,
    });
    Some(candidate)
}
