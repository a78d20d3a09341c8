//! Usage log: append-only audit of pipeline passes

use super::RecordStore;
use crate::utils::retry_on_lock;
use chrono::{DateTime, Utc};
use eodd_common::time::{self, from_db, to_db};
use eodd_common::{Error, Result};
use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

/// One usage log row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageEntry {
    pub run_id: Uuid,
    pub sensor_id: String,
    pub logged_at: DateTime<Utc>,
    /// sync, download, validate, process, run or reset
    pub stage: String,
    pub description: String,
    pub new_scenes: i64,
    pub downloaded: i64,
    pub failed: i64,
    pub archived: i64,
    pub corrupt: i64,
    pub processed: i64,
}

impl UsageEntry {
    pub fn new(run_id: Uuid, sensor_id: &str, stage: &str, description: impl Into<String>) -> Self {
        Self {
            run_id,
            sensor_id: sensor_id.to_string(),
            logged_at: time::now(),
            stage: stage.to_string(),
            description: description.into(),
            new_scenes: 0,
            downloaded: 0,
            failed: 0,
            archived: 0,
            corrupt: 0,
            processed: 0,
        }
    }
}

impl RecordStore {
    pub async fn record_usage(&self, entry: &UsageEntry) -> Result<()> {
        let run_id = entry.run_id.to_string();
        let logged_at = to_db(&entry.logged_at);

        retry_on_lock("record_usage", self.policy.lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT INTO usage_log (
                    run_id, sensor_id, logged_at, stage, description,
                    new_scenes, downloaded, failed, archived, corrupt, processed
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&run_id)
            .bind(&entry.sensor_id)
            .bind(&logged_at)
            .bind(&entry.stage)
            .bind(&entry.description)
            .bind(entry.new_scenes)
            .bind(entry.downloaded)
            .bind(entry.failed)
            .bind(entry.archived)
            .bind(entry.corrupt)
            .bind(entry.processed)
            .execute(&self.pool)
            .await?;
            Ok::<_, Error>(())
        })
        .await
    }

    /// Most recent entries first
    pub async fn recent_usage(&self, limit: i64) -> Result<Vec<UsageEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, sensor_id, logged_at, stage, description,
                   new_scenes, downloaded, failed, archived, corrupt, processed
            FROM usage_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let run_id: String = row.try_get("run_id")?;
                let logged_at: String = row.try_get("logged_at")?;
                Ok(UsageEntry {
                    run_id: Uuid::parse_str(&run_id)
                        .map_err(|e| Error::Internal(format!("Invalid run id '{}': {}", run_id, e)))?,
                    sensor_id: row.try_get("sensor_id")?,
                    logged_at: from_db(&logged_at)?,
                    stage: row.try_get("stage")?,
                    description: row.try_get("description")?,
                    new_scenes: row.try_get("new_scenes")?,
                    downloaded: row.try_get("downloaded")?,
                    failed: row.try_get("failed")?,
                    archived: row.try_get("archived")?,
                    corrupt: row.try_get("corrupt")?,
                    processed: row.try_get("processed")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StorePolicy;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_usage_round_trip_newest_first() {
        let dir = TempDir::new().unwrap();
        let store = RecordStore::open(&dir.path().join("eodd.db"), StorePolicy::default())
            .await
            .unwrap();
        let run_id = Uuid::new_v4();

        let mut sync = UsageEntry::new(run_id, "s2", "sync", "catalog sync");
        sync.new_scenes = 4;
        store.record_usage(&sync).await.unwrap();

        let mut download = UsageEntry::new(run_id, "s2", "download", "download pass 1");
        download.downloaded = 3;
        download.failed = 1;
        store.record_usage(&download).await.unwrap();

        let entries = store.recent_usage(10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stage, "download");
        assert_eq!(entries[0].failed, 1);
        assert_eq!(entries[1].new_scenes, 4);
        assert_eq!(entries[1].run_id, run_id);
    }
}
