//! Scriptable sensor plugin
//!
//! Serves a fixed catalog and per-product download outcomes, and records
//! how it was called so tests can assert on claim and concurrency behavior.

use chrono::{DateTime, Utc};
use eodd_ingest::error::{CatalogQueryError, DownloadError};
use eodd_ingest::models::{CandidateProduct, LocalArtifact, SceneRecord};
use eodd_ingest::sensors::{CandidateStream, SensorPlugin};
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Smallest byte sequence the validator accepts as a ZIP archive
pub fn minimal_zip() -> Vec<u8> {
    let mut bytes = b"PK\x03\x04".to_vec();
    bytes.extend_from_slice(&[0u8; 26]);
    bytes.extend_from_slice(b"PK\x05\x06");
    bytes.extend_from_slice(&[0u8; 18]);
    bytes
}

enum CatalogItem {
    Product(CandidateProduct),
    Failure(String),
}

/// Scripted result of one download call
#[derive(Debug, Clone)]
pub enum FakeDownload {
    /// Write these bytes and succeed
    Bytes(Vec<u8>),
    Transient(String),
    Permanent(String),
    /// Credentials rejected
    Unauthorized(String),
}

pub struct FakeSensor {
    id: String,
    download_dir: PathBuf,
    catalog: Mutex<Vec<CatalogItem>>,
    outcomes: Mutex<HashMap<String, VecDeque<FakeDownload>>>,
    delay: Duration,
    pool_cap: Option<usize>,
    cancel_on_download: Option<CancellationToken>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    download_calls: Mutex<Vec<String>>,
    queries: Mutex<Vec<Option<DateTime<Utc>>>>,
}

impl FakeSensor {
    pub fn new(id: &str, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            download_dir: download_dir.into(),
            catalog: Mutex::new(Vec::new()),
            outcomes: Mutex::new(HashMap::new()),
            delay: Duration::ZERO,
            pool_cap: None,
            cancel_on_download: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            download_calls: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_products(self, products: Vec<CandidateProduct>) -> Self {
        for product in products {
            self.add_product(product);
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_pool_cap(mut self, cap: usize) -> Self {
        self.pool_cap = Some(cap);
        self
    }

    /// Cancel `token` as soon as the first download starts
    pub fn cancelling(mut self, token: CancellationToken) -> Self {
        self.cancel_on_download = Some(token);
        self
    }

    pub fn add_product(&self, product: CandidateProduct) {
        self.catalog.lock().unwrap().push(CatalogItem::Product(product));
    }

    /// The catalog fails at this point of the listing
    pub fn add_catalog_failure(&self, message: &str) {
        self.catalog
            .lock()
            .unwrap()
            .push(CatalogItem::Failure(message.to_string()));
    }

    pub fn clear_catalog(&self) {
        self.catalog.lock().unwrap().clear();
    }

    /// Outcomes for successive download calls of `remote_id`; once used up,
    /// downloads succeed with a valid archive
    pub fn script(&self, remote_id: &str, outcomes: Vec<FakeDownload>) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(remote_id.to_string(), outcomes.into());
    }

    pub fn download_calls(&self) -> Vec<String> {
        self.download_calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, remote_id: &str) -> usize {
        self.download_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == remote_id)
            .count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<Option<DateTime<Utc>>> {
        self.queries.lock().unwrap().clone()
    }
}

impl SensorPlugin for FakeSensor {
    fn sensor_id(&self) -> &str {
        &self.id
    }

    fn query_since(&self, cursor: Option<DateTime<Utc>>) -> CandidateStream<'_> {
        self.queries.lock().unwrap().push(cursor);

        let items: Vec<Result<CandidateProduct, CatalogQueryError>> = self
            .catalog
            .lock()
            .unwrap()
            .iter()
            .filter_map(|item| match item {
                CatalogItem::Product(p) if cursor.map_or(true, |c| p.acquisition_time >= c) => Some(Ok(p.clone())),
                CatalogItem::Product(_) => None,
                CatalogItem::Failure(msg) => Some(Err(CatalogQueryError::Network(msg.clone()))),
            })
            .collect();

        stream::iter(items).boxed()
    }

    async fn download(&self, record: &SceneRecord) -> Result<LocalArtifact, DownloadError> {
        self.download_calls.lock().unwrap().push(record.remote_id.clone());
        if let Some(token) = &self.cancel_on_download {
            token.cancel();
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&record.remote_id)
            .and_then(|queue| queue.pop_front())
            .unwrap_or_else(|| FakeDownload::Bytes(minimal_zip()));

        match outcome {
            FakeDownload::Bytes(bytes) => {
                let path = self.download_dir.join(format!("{}.zip", record.remote_id));
                tokio::fs::create_dir_all(&self.download_dir).await?;
                tokio::fs::write(&path, &bytes).await?;
                Ok(LocalArtifact {
                    path,
                    size: Some(bytes.len() as i64),
                    reported_checksum: None,
                })
            }
            FakeDownload::Transient(msg) => Err(DownloadError::Transient(msg)),
            FakeDownload::Permanent(msg) => Err(DownloadError::Permanent(msg)),
            FakeDownload::Unauthorized(msg) => Err(DownloadError::Unauthorized(msg)),
        }
    }

    fn max_concurrent_downloads(&self) -> Option<usize> {
        self.pool_cap
    }
}
