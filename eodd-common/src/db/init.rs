//! Database initialization
//!
//! Opens (or creates) the SQLite record store and brings its schema up to
//! date. Every `create_*` function is idempotent.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default SQLite busy timeout before a locked write surfaces as an error
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 250;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    init_database_with(db_path, 20, DEFAULT_BUSY_TIMEOUT_MS).await
}

/// Initialize database with explicit pool size and busy timeout
///
/// The busy timeout is kept short on purpose: lock contention is handled by
/// the caller's retry-with-backoff loop rather than by blocking inside SQLite.
pub async fn init_database_with(
    db_path: &Path,
    max_connections: u32,
    busy_timeout_ms: u64,
) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // WAL lets the validator and reporting read while schedulers write
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;
    crate::db::migrations::run_migrations(&pool).await?;

    Ok(pool)
}

/// Create every table used by the ingestion engine
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_scenes_table(pool).await?;
    create_sync_cursors_table(pool).await?;
    create_usage_log_table(pool).await?;
    Ok(())
}

pub async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// One row per remote product known to any sensor
///
/// The CHECK constraint pins `local_path` to the states reached after a
/// completed download.
pub async fn create_scenes_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scenes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sensor_id TEXT NOT NULL,
            remote_id TEXT NOT NULL,
            discovery_time TEXT NOT NULL,
            acquisition_time TEXT NOT NULL,
            north_lat REAL,
            south_lat REAL,
            east_lon REAL,
            west_lon REAL,
            cloud_cover REAL,
            remote_url TEXT,
            expected_checksum TEXT,
            expected_size INTEGER,
            metadata TEXT NOT NULL DEFAULT '{}',
            state TEXT NOT NULL DEFAULT 'DISCOVERED',
            local_path TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            last_error TEXT,
            failed_pass INTEGER NOT NULL DEFAULT 0,
            checksum TEXT,
            size INTEGER,
            claimed_at TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE (sensor_id, remote_id),
            CHECK (state IN (
                'DISCOVERED', 'DOWNLOADING', 'DOWNLOADED', 'DOWNLOAD_FAILED',
                'DOWNLOAD_FAILED_PERMANENT', 'VALIDATING', 'ARCHIVED', 'CORRUPT',
                'PROCESSED', 'PROCESSING_FAILED'
            )),
            CHECK ((local_path IS NOT NULL) = (state IN (
                'DOWNLOADED', 'VALIDATING', 'ARCHIVED', 'CORRUPT',
                'PROCESSED', 'PROCESSING_FAILED'
            )))
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Per-sensor synchronization cursor and scheduler pass counter
pub async fn create_sync_cursors_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_cursors (
            sensor_id TEXT PRIMARY KEY,
            last_acquisition_time TEXT,
            last_synced_at TEXT,
            download_pass INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append-only log of pipeline passes
pub async fn create_usage_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS usage_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            sensor_id TEXT NOT NULL DEFAULT 'NA',
            logged_at TEXT NOT NULL,
            stage TEXT NOT NULL,
            description TEXT NOT NULL,
            new_scenes INTEGER NOT NULL DEFAULT 0,
            downloaded INTEGER NOT NULL DEFAULT 0,
            failed INTEGER NOT NULL DEFAULT 0,
            archived INTEGER NOT NULL DEFAULT 0,
            corrupt INTEGER NOT NULL DEFAULT 0,
            processed INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
