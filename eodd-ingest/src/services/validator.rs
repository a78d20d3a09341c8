//! Post-download validator
//!
//! Verifies downloaded artifacts before they are archived: size and MD5
//! against what the catalog or transfer reported, plus a cheap structural
//! check chosen by file extension. Hashing runs on the blocking pool.

use crate::db::{RecordStore, UsageEntry};
use crate::error::{IngestResult, ValidationError};
use crate::models::SceneRecord;
use chrono::Utc;
use eodd_common::Error;
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Largest possible ZIP end-of-central-directory record (22 bytes + comment)
const ZIP_EOCD_SEARCH: u64 = 22 + 65_535;

/// Result of one validation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub claimed: u64,
    pub archived: u64,
    pub corrupt: u64,
}

/// Size and checksum of an artifact as found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDigest {
    pub size: i64,
    /// Lower-case hex MD5; for directories, over all files in sorted path order
    pub md5: String,
    pub is_directory: bool,
}

/// Hash and measure a file or directory
pub fn digest_artifact(path: &Path) -> Result<ArtifactDigest, ValidationError> {
    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => ValidationError::Missing(path.display().to_string()),
        _ => ValidationError::Unreadable(format!("{}: {}", path.display(), e)),
    })?;

    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    let files: Vec<PathBuf> = if metadata.is_dir() {
        let mut files = Vec::new();
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| ValidationError::Unreadable(e.to_string()))?;
            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }
        files
    } else {
        vec![path.to_path_buf()]
    };

    let mut size: u64 = 0;
    for file in &files {
        let mut handle =
            File::open(file).map_err(|e| ValidationError::Unreadable(format!("{}: {}", file.display(), e)))?;
        loop {
            let n = handle
                .read(&mut buffer)
                .map_err(|e| ValidationError::Unreadable(format!("{}: {}", file.display(), e)))?;
            if n == 0 {
                break;
            }
            context.consume(&buffer[..n]);
            size += n as u64;
        }
    }

    Ok(ArtifactDigest {
        size: size as i64,
        md5: format!("{:x}", context.compute()),
        is_directory: metadata.is_dir(),
    })
}

/// Structural sanity check for one file, chosen by extension
///
/// Empty files always fail; unknown extensions only need to be non-empty.
pub fn check_structure(path: &Path) -> Result<(), ValidationError> {
    let malformed = |what: &str| ValidationError::Malformed(format!("{}: {}", path.display(), what));
    let unreadable = |e: std::io::Error| ValidationError::Unreadable(format!("{}: {}", path.display(), e));

    let mut file = File::open(path).map_err(unreadable)?;
    let len = file.metadata().map_err(unreadable)?.len();
    if len == 0 {
        return Err(malformed("empty file"));
    }

    let mut head = [0u8; 8];
    let head_len = read_up_to(&mut file, &mut head).map_err(unreadable)?;
    let head = &head[..head_len];

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "tif" | "tiff" => {
            const MAGICS: [&[u8]; 4] = [b"II*\0", b"MM\0*", b"II+\0", b"MM\0+"];
            if !MAGICS.iter().any(|m| head.starts_with(m)) {
                return Err(malformed("not a TIFF/BigTIFF file"));
            }
        }
        "zip" => {
            if !head.starts_with(b"PK\x03\x04") {
                return Err(malformed("missing ZIP local file header"));
            }
            let tail_len = len.min(ZIP_EOCD_SEARCH);
            file.seek(SeekFrom::Start(len - tail_len)).map_err(unreadable)?;
            let mut tail = Vec::with_capacity(tail_len as usize);
            file.read_to_end(&mut tail).map_err(unreadable)?;
            if !tail.windows(4).any(|w| w == b"PK\x05\x06") {
                return Err(malformed("missing ZIP end of central directory (truncated?)"));
            }
        }
        "gz" | "tgz" => {
            if !head.starts_with(&[0x1f, 0x8b]) {
                return Err(malformed("not a gzip file"));
            }
        }
        "h5" | "hdf5" | "he5" => {
            if !head.starts_with(b"\x89HDF\r\n\x1a\n") {
                return Err(malformed("missing HDF5 signature"));
            }
        }
        "nc" => {
            if !head.starts_with(b"\x89HDF\r\n\x1a\n") && !head.starts_with(b"CDF") {
                return Err(malformed("not a netCDF file"));
            }
        }
        "xml" => {
            if first_significant_byte(&mut file).map_err(unreadable)? != Some(b'<') {
                return Err(malformed("does not start with an XML tag"));
            }
        }
        "json" => {
            if !matches!(first_significant_byte(&mut file).map_err(unreadable)?, Some(b'{') | Some(b'[')) {
                return Err(malformed("does not start with a JSON object or array"));
            }
        }
        _ => {}
    }
    Ok(())
}

fn read_up_to(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// First byte that is neither whitespace nor part of a UTF-8 BOM
fn first_significant_byte(file: &mut File) -> std::io::Result<Option<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut buf = [0u8; 4096];
    let n = read_up_to(file, &mut buf)?;
    let body = buf[..n].strip_prefix(b"\xEF\xBB\xBF").unwrap_or(&buf[..n]);
    Ok(body.iter().copied().find(|b| !b.is_ascii_whitespace()))
}

/// Full integrity check of one downloaded scene
pub fn verify_artifact(record: &SceneRecord) -> Result<ArtifactDigest, ValidationError> {
    let path = record
        .local_path
        .as_deref()
        .ok_or_else(|| ValidationError::Missing(format!("scene {} has no local path", record.id)))?;

    let digest = digest_artifact(path)?;

    for expected in [record.size, record.expected_size].into_iter().flatten() {
        if expected != digest.size {
            return Err(ValidationError::SizeMismatch {
                expected,
                actual: digest.size,
            });
        }
    }

    if digest.is_directory {
        if digest.size == 0 {
            return Err(ValidationError::Malformed(format!("{}: empty directory", path.display())));
        }
        if let Some(expected) = &record.expected_checksum {
            // Archive checksums describe a packaged file, not an unpacked folder
            debug!(
                scene_id = record.id,
                expected = %expected,
                "Directory artifact; expected checksum not compared"
            );
        }
        for entry in WalkDir::new(path).sort_by_file_name() {
            let entry = entry.map_err(|e| ValidationError::Unreadable(e.to_string()))?;
            if entry.file_type().is_file() && entry.metadata().map(|m| m.len() > 0).unwrap_or(false) {
                check_structure(entry.path())?;
            }
        }
    } else {
        if let Some(expected) = &record.expected_checksum {
            if !expected.eq_ignore_ascii_case(&digest.md5) {
                return Err(ValidationError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: digest.md5.clone(),
                });
            }
        }
        check_structure(path)?;
    }

    Ok(digest)
}

pub struct Validator {
    claim_batch_size: usize,
    /// VALIDATING claims older than this belong to a dead validator
    stale_timeout: Duration,
    cancel: CancellationToken,
}

impl Validator {
    pub fn new(claim_batch_size: usize, stale_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            claim_batch_size: claim_batch_size.max(1),
            stale_timeout,
            cancel,
        }
    }

    /// Validate every DOWNLOADED scene of one sensor
    pub async fn validate_pending(
        &self,
        store: &RecordStore,
        sensor_id: &str,
        run_id: Uuid,
    ) -> IngestResult<ValidationReport> {
        let mut report = ValidationReport::default();
        let stale = chrono::Duration::from_std(self.stale_timeout).unwrap_or(chrono::Duration::MAX);
        let stale_before = Utc::now().checked_sub_signed(stale).unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);

        loop {
            if self.cancel.is_cancelled() {
                info!(sensor_id, "Validation cancelled between batches");
                break;
            }

            let batch = store
                .claim_for_validation(sensor_id, self.claim_batch_size as i64, stale_before)
                .await?;
            if batch.is_empty() {
                break;
            }
            report.claimed += batch.len() as u64;

            for record in batch {
                let id = record.id;
                let remote_id = record.remote_id.clone();
                let verdict = tokio::task::spawn_blocking(move || verify_artifact(&record))
                    .await
                    .unwrap_or_else(|e| Err(ValidationError::Unreadable(format!("validation task failed: {}", e))));

                let recorded = match verdict {
                    Ok(digest) => {
                        debug!(sensor_id, scene_id = id, size = digest.size, md5 = %digest.md5, "Artifact verified");
                        store.mark_validated(id, &digest.md5, digest.size).await.map(|()| {
                            report.archived += 1;
                            info!(sensor_id, scene_id = id, remote_id = %remote_id, "Archived");
                        })
                    }
                    Err(err) => store.mark_corrupt(id, &err.to_string()).await.map(|()| {
                        report.corrupt += 1;
                        warn!(sensor_id, scene_id = id, remote_id = %remote_id, error = %err, "Artifact corrupt");
                    }),
                };

                match recorded {
                    Ok(()) => {}
                    Err(Error::Conflict(msg)) => {
                        warn!(sensor_id, scene_id = id, "Validation outcome not recorded: {}", msg)
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }

        if report.claimed > 0 {
            info!(
                sensor_id,
                archived = report.archived,
                corrupt = report.corrupt,
                "Validation pass complete"
            );
        }

        let mut entry = UsageEntry::new(run_id, sensor_id, "validate", format!("{} checked", report.claimed));
        entry.archived = report.archived as i64;
        entry.corrupt = report.corrupt as i64;
        store.record_usage(&entry).await?;

        Ok(report)
    }
}
