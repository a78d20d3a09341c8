//! Scene lifecycle and records
//!
//! DISCOVERED → DOWNLOADING → DOWNLOADED → VALIDATING → ARCHIVED → PROCESSED
//!
//! with the failure branches DOWNLOAD_FAILED (retryable), DOWNLOAD_FAILED_PERMANENT,
//! CORRUPT and PROCESSING_FAILED.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Scene lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SceneState {
    /// Known from the catalog, nothing fetched yet
    Discovered,
    /// Claimed by a scheduler worker
    Downloading,
    /// Artifact on disk, not yet verified
    Downloaded,
    /// Last attempt failed; eligible for retry after backoff
    DownloadFailed,
    /// Retries exhausted or permanent error
    DownloadFailedPermanent,
    /// Claimed by the validator
    Validating,
    /// Verified and kept
    Archived,
    /// Failed integrity checks
    Corrupt,
    /// External processor succeeded
    Processed,
    /// External processor failed
    ProcessingFailed,
}

impl SceneState {
    pub const ALL: [SceneState; 10] = [
        SceneState::Discovered,
        SceneState::Downloading,
        SceneState::Downloaded,
        SceneState::DownloadFailed,
        SceneState::DownloadFailedPermanent,
        SceneState::Validating,
        SceneState::Archived,
        SceneState::Corrupt,
        SceneState::Processed,
        SceneState::ProcessingFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SceneState::Discovered => "DISCOVERED",
            SceneState::Downloading => "DOWNLOADING",
            SceneState::Downloaded => "DOWNLOADED",
            SceneState::DownloadFailed => "DOWNLOAD_FAILED",
            SceneState::DownloadFailedPermanent => "DOWNLOAD_FAILED_PERMANENT",
            SceneState::Validating => "VALIDATING",
            SceneState::Archived => "ARCHIVED",
            SceneState::Corrupt => "CORRUPT",
            SceneState::Processed => "PROCESSED",
            SceneState::ProcessingFailed => "PROCESSING_FAILED",
        }
    }

    /// No automatic transition leaves this state
    ///
    /// ARCHIVED counts as terminal for the download pipeline; only the
    /// optional processing stage moves it on.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SceneState::DownloadFailedPermanent
                | SceneState::Archived
                | SceneState::Corrupt
                | SceneState::Processed
                | SceneState::ProcessingFailed
        )
    }

    /// Terminal failure states reported by `eodd failures`
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            SceneState::DownloadFailedPermanent | SceneState::Corrupt | SceneState::ProcessingFailed
        )
    }

    /// States in which the record carries a `local_path`
    pub fn has_local_path(&self) -> bool {
        matches!(
            self,
            SceneState::Downloaded
                | SceneState::Validating
                | SceneState::Archived
                | SceneState::Corrupt
                | SceneState::Processed
                | SceneState::ProcessingFailed
        )
    }

    /// Automatic (non-administrative) transitions
    pub fn can_transition_to(&self, next: SceneState) -> bool {
        use SceneState::*;
        matches!(
            (self, next),
            (Discovered, Downloading)
                | (DownloadFailed, Downloading)
                | (Downloading, Discovered)
                | (DownloadFailed, DownloadFailedPermanent)
                | (Downloading, Downloaded)
                | (Downloading, DownloadFailed)
                | (Downloading, DownloadFailedPermanent)
                | (Downloaded, Validating)
                | (Validating, Validating)
                | (Validating, Archived)
                | (Validating, Corrupt)
                | (Archived, Processed)
                | (Archived, ProcessingFailed)
        )
    }
}

impl fmt::Display for SceneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SceneState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SceneState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown scene state '{}'", s))
    }
}

/// Geographic footprint in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub north_lat: f64,
    pub south_lat: f64,
    pub east_lon: f64,
    pub west_lon: f64,
}

impl BoundingBox {
    pub fn validate(&self) -> Result<(), String> {
        for lat in [self.north_lat, self.south_lat] {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(format!("latitude {} outside [-90, 90]", lat));
            }
        }
        for lon in [self.east_lon, self.west_lon] {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(format!("longitude {} outside [-180, 180]", lon));
            }
        }
        if self.north_lat < self.south_lat {
            return Err(format!(
                "north_lat {} is south of south_lat {}",
                self.north_lat, self.south_lat
            ));
        }
        Ok(())
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.south_lat <= other.north_lat
            && other.south_lat <= self.north_lat
            && self.west_lon <= other.east_lon
            && other.west_lon <= self.east_lon
    }

    /// Smallest box enclosing a set of (lon, lat) points
    pub fn enclosing(points: impl IntoIterator<Item = (f64, f64)>) -> Option<BoundingBox> {
        points.into_iter().fold(None, |acc, (lon, lat)| {
            Some(match acc {
                None => BoundingBox {
                    north_lat: lat,
                    south_lat: lat,
                    east_lon: lon,
                    west_lon: lon,
                },
                Some(b) => BoundingBox {
                    north_lat: b.north_lat.max(lat),
                    south_lat: b.south_lat.min(lat),
                    east_lon: b.east_lon.max(lon),
                    west_lon: b.west_lon.min(lon),
                },
            })
        })
    }
}

impl FromStr for BoundingBox {
    type Err = String;

    /// `north,south,east,west` in decimal degrees
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let values = s
            .split(',')
            .map(|v| v.trim().parse::<f64>().map_err(|e| format!("'{}': {}", v.trim(), e)))
            .collect::<Result<Vec<_>, _>>()?;
        let [north_lat, south_lat, east_lon, west_lon] = values[..] else {
            return Err(format!("expected north,south,east,west but got '{}'", s));
        };
        let bbox = BoundingBox {
            north_lat,
            south_lat,
            east_lon,
            west_lon,
        };
        bbox.validate()?;
        Ok(bbox)
    }
}

/// Catalog filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneQuery {
    pub sensor_id: Option<String>,
    pub state: Option<SceneState>,
    /// Inclusive lower bound on acquisition time
    pub acquired_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on acquisition time
    pub acquired_until: Option<DateTime<Utc>>,
    /// Footprint must intersect; scenes without a footprint never match
    pub bbox: Option<BoundingBox>,
}

impl SceneQuery {
    pub fn matches(&self, scene: &SceneRecord) -> bool {
        self.sensor_id.as_ref().map_or(true, |id| *id == scene.sensor_id)
            && self.state.map_or(true, |state| state == scene.state)
            && self.acquired_from.map_or(true, |t| scene.acquisition_time >= t)
            && self.acquired_until.map_or(true, |t| scene.acquisition_time < t)
            && self.bbox.as_ref().map_or(true, |query| {
                scene.bbox.as_ref().is_some_and(|footprint| footprint.intersects(query))
            })
    }
}

/// One product as reported by a remote catalog, before it is persisted
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateProduct {
    pub remote_id: String,
    pub acquisition_time: DateTime<Utc>,
    pub bbox: Option<BoundingBox>,
    /// Percent, 0-100
    pub cloud_cover: Option<f64>,
    pub remote_url: Option<String>,
    /// Lower-case hex MD5
    pub expected_checksum: Option<String>,
    pub expected_size: Option<i64>,
    pub metadata: serde_json::Value,
}

impl CandidateProduct {
    pub fn new(remote_id: impl Into<String>, acquisition_time: DateTime<Utc>) -> Self {
        Self {
            remote_id: remote_id.into(),
            acquisition_time,
            bbox: None,
            cloud_cover: None,
            remote_url: None,
            expected_checksum: None,
            expected_size: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }
}

/// Persisted scene row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneRecord {
    pub id: i64,
    pub sensor_id: String,
    pub remote_id: String,
    pub discovery_time: DateTime<Utc>,
    pub acquisition_time: DateTime<Utc>,
    pub bbox: Option<BoundingBox>,
    pub cloud_cover: Option<f64>,
    pub remote_url: Option<String>,
    pub expected_checksum: Option<String>,
    pub expected_size: Option<i64>,
    pub metadata: serde_json::Value,
    pub state: SceneState,
    pub local_path: Option<PathBuf>,
    pub retry_count: i64,
    pub last_error: Option<String>,
    pub failed_pass: i64,
    pub checksum: Option<String>,
    pub size: Option<i64>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a successful plugin download
#[derive(Debug, Clone, PartialEq)]
pub struct LocalArtifact {
    /// File or directory holding the product
    pub path: PathBuf,
    pub size: Option<i64>,
    /// Checksum reported by the archive during transfer, if any
    pub reported_checksum: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_state_string_round_trip() {
        for state in SceneState::ALL {
            assert_eq!(state.as_str().parse::<SceneState>().unwrap(), state);
        }
        assert!("LOST".parse::<SceneState>().is_err());
        assert_eq!(
            "download_failed".parse::<SceneState>().unwrap(),
            SceneState::DownloadFailed
        );
    }

    #[test]
    fn test_serde_matches_column_values() {
        let json = serde_json::to_string(&SceneState::DownloadFailedPermanent).unwrap();
        assert_eq!(json, "\"DOWNLOAD_FAILED_PERMANENT\"");
    }

    #[test]
    fn test_no_backward_automatic_transitions() {
        assert!(SceneState::Discovered.can_transition_to(SceneState::Downloading));
        assert!(SceneState::DownloadFailed.can_transition_to(SceneState::Downloading));
        assert!(!SceneState::Archived.can_transition_to(SceneState::Discovered));
        assert!(!SceneState::Corrupt.can_transition_to(SceneState::Validating));
        assert!(!SceneState::DownloadFailedPermanent.can_transition_to(SceneState::Downloading));
    }

    #[test]
    fn test_local_path_states() {
        let with_path: Vec<_> = SceneState::ALL
            .iter()
            .filter(|s| s.has_local_path())
            .collect();
        assert_eq!(with_path.len(), 6);
        assert!(!SceneState::Downloading.has_local_path());
        assert!(!SceneState::DownloadFailed.has_local_path());
    }

    #[test]
    fn test_bbox_validation() {
        let good = BoundingBox {
            north_lat: -35.0,
            south_lat: -36.0,
            east_lon: 149.0,
            west_lon: 148.0,
        };
        assert!(good.validate().is_ok());

        let flipped = BoundingBox {
            north_lat: -36.0,
            south_lat: -35.0,
            ..good
        };
        assert!(flipped.validate().is_err());

        let off_world = BoundingBox {
            east_lon: 181.0,
            ..good
        };
        assert!(off_world.validate().is_err());
    }

    #[test]
    fn test_bbox_intersects_and_enclosing() {
        let a = BoundingBox {
            north_lat: 1.0,
            south_lat: 0.0,
            east_lon: 1.0,
            west_lon: 0.0,
        };
        let b = BoundingBox::enclosing([(0.5, 0.5), (2.0, 3.0)]).unwrap();
        assert_eq!(b.north_lat, 3.0);
        assert_eq!(b.west_lon, 0.5);
        assert!(a.intersects(&b));

        let far = BoundingBox {
            north_lat: 50.0,
            south_lat: 40.0,
            east_lon: 10.0,
            west_lon: 5.0,
        };
        assert!(!a.intersects(&far));
        assert!(BoundingBox::enclosing(Vec::new()).is_none());
    }

    #[test]
    fn test_bbox_from_str() {
        let bbox: BoundingBox = "-35, -36, 149, 148".parse().unwrap();
        assert_eq!(bbox.north_lat, -35.0);
        assert_eq!(bbox.west_lon, 148.0);
        assert!("1,2,3".parse::<BoundingBox>().is_err());
        assert!("-36,-35,149,148".parse::<BoundingBox>().is_err());
        assert!("a,b,c,d".parse::<BoundingBox>().is_err());
    }

    #[test]
    fn test_scene_query_matches() {
        let t = |day| Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
        let scene = SceneRecord {
            id: 1,
            sensor_id: "s2".into(),
            remote_id: "r".into(),
            discovery_time: t(1),
            acquisition_time: t(5),
            bbox: Some("1,0,1,0".parse().unwrap()),
            cloud_cover: None,
            remote_url: None,
            expected_checksum: None,
            expected_size: None,
            metadata: serde_json::json!({}),
            state: SceneState::Corrupt,
            local_path: None,
            retry_count: 0,
            last_error: None,
            failed_pass: 0,
            checksum: None,
            size: None,
            claimed_at: None,
            updated_at: t(5),
        };

        assert!(SceneQuery::default().matches(&scene));
        let query = SceneQuery {
            sensor_id: Some("s2".into()),
            state: Some(SceneState::Corrupt),
            acquired_from: Some(t(5)),
            acquired_until: Some(t(6)),
            bbox: Some("0.5,-1,0.5,-1".parse().unwrap()),
        };
        assert!(query.matches(&scene));

        assert!(!SceneQuery { acquired_until: Some(t(5)), ..query.clone() }.matches(&scene));
        assert!(!SceneQuery { state: Some(SceneState::Archived), ..query.clone() }.matches(&scene));
        assert!(!SceneQuery { bbox: Some("50,40,10,5".parse().unwrap()), ..query.clone() }.matches(&scene));

        let no_footprint = SceneRecord { bbox: None, ..scene };
        assert!(!query.matches(&no_footprint));
    }
}
