//! Shared HTTP plumbing for sensor plugins
//!
//! Client construction, rate limiting, status classification and the
//! chunked body-to-disk transfer used by every download.

use crate::error::{CatalogQueryError, DownloadError};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::ffi::OsString;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("eodd/", env!("CARGO_PKG_VERSION"));

/// Token-bucket limiter owned by one plugin instance
pub type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub fn rate_limiter(requests_per_second: u32) -> DirectRateLimiter {
    let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
    RateLimiter::direct(Quota::per_second(rps))
}

/// Timeout applied to catalog and asset-metadata requests
pub const CATALOG_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP client with connect timeout only; product transfers can run for a
/// long time, so metadata requests set [`CATALOG_TIMEOUT`] per request
pub fn build_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(Duration::from_secs(15))
        .tcp_keepalive(Duration::from_secs(60))
        .user_agent(USER_AGENT)
        .build()
}

/// Map a non-success download status to a retry classification
///
/// 401 means the sensor's credentials are bad, whatever the product.
pub fn classify_status(status: StatusCode, context: &str) -> DownloadError {
    let message = format!("{} returned HTTP {}", context, status);
    match status {
        StatusCode::UNAUTHORIZED => DownloadError::Unauthorized(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => DownloadError::Transient(message),
        s if s.is_server_error() => DownloadError::Transient(message),
        _ => DownloadError::Permanent(message),
    }
}

/// Transport-level failures are transient unless the request itself was malformed
pub fn classify_transport(err: &reqwest::Error, context: &str) -> DownloadError {
    if err.is_builder() {
        DownloadError::Permanent(format!("{}: invalid request: {}", context, err))
    } else {
        DownloadError::Transient(format!("{}: {}", context, err))
    }
}

/// Map a non-success catalog status to a query error
pub fn catalog_status_error(status: StatusCode, body: String) -> CatalogQueryError {
    let message: String = body.chars().take(500).collect();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CatalogQueryError::Unauthorized(message),
        _ => CatalogQueryError::Http {
            status: status.as_u16(),
            message,
        },
    }
}

/// Send a catalog request and return the successful response
pub async fn send_catalog(request: RequestBuilder) -> Result<Response, CatalogQueryError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(catalog_status_error(status, body))
    }
}

/// Send a download-side request (asset lookup, activation, transfer)
pub async fn send_download(request: RequestBuilder, context: &str) -> Result<Response, DownloadError> {
    let response = request
        .send()
        .await
        .map_err(|e| classify_transport(&e, context))?;
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(classify_status(status, context))
    }
}

/// Like [`send_download`] for authenticated metadata requests, where a 403
/// also means the credentials lack access rather than the product being gone
pub async fn send_lookup(request: RequestBuilder, context: &str) -> Result<Response, DownloadError> {
    let response = request
        .send()
        .await
        .map_err(|e| classify_transport(&e, context))?;
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else if status == StatusCode::FORBIDDEN {
        Err(DownloadError::Unauthorized(format!("{} returned HTTP {}", context, status)))
    } else {
        Err(classify_status(status, context))
    }
}

/// `<dest>.part`
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// Stream a response body to `dest` and return the byte count
///
/// The body is written to `<dest>.part` and renamed into place only after
/// the last chunk, so `dest` never holds a partial file.
pub async fn stream_to_file(mut response: Response, dest: &Path) -> Result<i64, DownloadError> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let part = partial_path(dest);
    let expected = response.content_length();

    let result = async {
        let mut file = tokio::fs::File::create(&part).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| classify_transport(&e, "body transfer"))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;

        if let Some(expected) = expected {
            if expected != written {
                return Err(DownloadError::Transient(format!(
                    "truncated transfer: {} of {} bytes",
                    written, expected
                )));
            }
        }
        Ok(written)
    }
    .await;

    match result {
        Ok(written) => {
            tokio::fs::rename(&part, dest).await?;
            debug!(path = %dest.display(), bytes = written, "Transfer complete");
            Ok(written as i64)
        }
        Err(err) => {
            if let Err(e) = tokio::fs::remove_file(&part).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %part.display(), error = %e, "Failed to remove partial download");
                }
            }
            Err(err)
        }
    }
}
