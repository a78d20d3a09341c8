//! Error types for eodd-ingest
//!
//! Failures are scoped: a [`DownloadError`] or [`ValidationError`] affects one
//! scene, a [`CatalogQueryError`] or [`DownloadError::Unauthorized`] aborts one
//! sensor's pass, and only store connectivity failures (see
//! [`IngestError::is_fatal`]) abort a whole run.

use thiserror::Error;

/// Outcome of a failed download attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DownloadError {
    /// Network failure, timeout, throttling, server error or asset not yet ready
    #[error("transient download failure: {0}")]
    Transient(String),

    /// Product gone, access denied or locator unusable
    #[error("permanent download failure: {0}")]
    Permanent(String),

    /// Credentials rejected; every product of the sensor is affected, so no
    /// single scene is charged for it
    #[error("sensor credentials rejected: {0}")]
    Unauthorized(String),
}

impl DownloadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Transient(_))
    }

    /// True when the failure belongs to the sensor rather than the scene
    pub fn is_sensor_failure(&self) -> bool {
        matches!(self, DownloadError::Unauthorized(_))
    }

    /// Bare message without the classification prefix
    pub fn message(&self) -> &str {
        match self {
            DownloadError::Transient(msg)
            | DownloadError::Permanent(msg)
            | DownloadError::Unauthorized(msg) => msg,
        }
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        // Local disk trouble may clear up (full disk, NFS hiccup)
        DownloadError::Transient(format!("I/O error: {}", err))
    }
}

/// Catalog query failure; aborts the current synchronizer pass
#[derive(Debug, Error)]
pub enum CatalogQueryError {
    #[error("catalog network error: {0}")]
    Network(String),

    #[error("catalog returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("catalog rejected credentials: {0}")]
    Unauthorized(String),

    #[error("catalog response could not be parsed: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for CatalogQueryError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            CatalogQueryError::Parse(err.to_string())
        } else {
            CatalogQueryError::Network(err.to_string())
        }
    }
}

/// Listing requests made while downloading (multi-object products)
impl From<CatalogQueryError> for DownloadError {
    fn from(err: CatalogQueryError) -> Self {
        match err {
            CatalogQueryError::Unauthorized(msg) => DownloadError::Unauthorized(msg),
            CatalogQueryError::Http { status, message } => {
                let message = format!("listing returned HTTP {}: {}", status, message);
                if status == 408 || status == 429 || status >= 500 {
                    DownloadError::Transient(message)
                } else {
                    DownloadError::Permanent(message)
                }
            }
            CatalogQueryError::Network(msg) | CatalogQueryError::Parse(msg) => {
                DownloadError::Transient(format!("listing failed: {}", msg))
            }
        }
    }
}

/// Artifact integrity failure; the scene becomes CORRUPT
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("artifact missing: {0}")]
    Missing(String),

    #[error("artifact unreadable: {0}")]
    Unreadable(String),

    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: i64, actual: i64 },

    #[error("checksum mismatch: expected {expected}, found {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("malformed artifact: {0}")]
    Malformed(String),
}

/// Errors surfaced by the synchronizer, scheduler, validator and orchestrator
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("store error: {0}")]
    Store(#[from] eodd_common::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogQueryError),

    /// Sensor misconfiguration or plugin construction failure
    #[error("sensor {sensor_id}: {message}")]
    Sensor { sensor_id: String, message: String },

    #[error("processing error: {0}")]
    Processing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// True when the record store itself failed and the run must stop
    pub fn is_fatal(&self) -> bool {
        match self {
            IngestError::Store(err) => err.is_connectivity(),
            _ => false,
        }
    }
}

pub type IngestResult<T> = std::result::Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_retryability() {
        assert!(DownloadError::Transient("503".into()).is_retryable());
        assert!(!DownloadError::Permanent("404".into()).is_retryable());
        assert_eq!(DownloadError::Permanent("gone".into()).message(), "gone");
    }

    #[test]
    fn test_unauthorized_is_a_sensor_failure() {
        let err = DownloadError::Unauthorized("HTTP 401".into());
        assert!(err.is_sensor_failure());
        assert!(!err.is_retryable());
        assert!(!DownloadError::Permanent("HTTP 404".into()).is_sensor_failure());
    }

    #[test]
    fn test_listing_errors_map_to_download_errors() {
        let err: DownloadError = CatalogQueryError::Unauthorized("expired".into()).into();
        assert!(err.is_sensor_failure());
        let err: DownloadError = CatalogQueryError::Http { status: 503, message: String::new() }.into();
        assert!(err.is_retryable());
        let err: DownloadError = CatalogQueryError::Http { status: 404, message: String::new() }.into();
        assert_eq!(err, DownloadError::Permanent("listing returned HTTP 404: ".into()));
    }

    #[test]
    fn test_io_error_is_transient() {
        let err: DownloadError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_only_store_connectivity_is_fatal() {
        let conflict = IngestError::Store(eodd_common::Error::Conflict("lost".into()));
        assert!(!conflict.is_fatal());

        let db = IngestError::Store(eodd_common::Error::Database(sqlx::Error::PoolClosed));
        assert!(db.is_fatal());

        let catalog = IngestError::Catalog(CatalogQueryError::Network("reset".into()));
        assert!(!catalog.is_fatal());
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::SizeMismatch {
            expected: 10,
            actual: 7,
        };
        assert_eq!(err.to_string(), "size mismatch: expected 10 bytes, found 7");
    }
}
