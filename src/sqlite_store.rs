//! SQLite-backed [`LocalStore`] implementation.
//!
//! Snapshots are stored as JSON in `sessions`; file bytes live in
//! `session_blobs` and are reattached to the tree on load. Blobs whose size,
//! mtime and sampled digest are unchanged since the last save are not
//! rewritten, so the periodic autosave stays cheap for large photo sets.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use field_audit_core::fingerprint::{sample_digest, Fingerprint};
use field_audit_core::models::{Blob, CacheEntry, ProjectSnapshot, SyncQueueItem, Verdict};
use field_audit_core::store::LocalStore;

use crate::config::Config;
use crate::{db, migrate};

/// SQLite implementation of the [`LocalStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and make sure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// What identifies a stored blob's content without reading its bytes back.
#[derive(Debug, PartialEq, Eq)]
struct StoredBlob {
    last_modified_ms: i64,
    size: i64,
    digest: String,
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn get_cache(
        &self,
        folder_path: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT verdict_json, created_at FROM analysis_cache WHERE folder_path = ? AND fingerprint = ?",
        )
        .bind(folder_path)
        .bind(fingerprint.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let verdict_json: String = row.get("verdict_json");
        let verdict: Verdict = serde_json::from_str(&verdict_json)
            .with_context(|| format!("corrupt cache entry for {}", folder_path))?;

        Ok(Some(CacheEntry {
            folder_path: folder_path.to_string(),
            fingerprint: fingerprint.as_str().to_string(),
            verdict,
            created_at: from_millis(row.get("created_at")),
        }))
    }

    async fn put_cache(&self, entry: &CacheEntry) -> Result<()> {
        let verdict_json = serde_json::to_string(&entry.verdict)?;
        sqlx::query(
            r#"
            INSERT INTO analysis_cache (folder_path, fingerprint, verdict_json, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(folder_path, fingerprint) DO UPDATE SET
                verdict_json = excluded.verdict_json,
                created_at = excluded.created_at
            "#,
        )
        .bind(&entry.folder_path)
        .bind(&entry.fingerprint)
        .bind(verdict_json)
        .bind(entry.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_cache(&self) -> Result<()> {
        sqlx::query("DELETE FROM analysis_cache")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn session_version(&self) -> Result<Option<u32>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT schema_version FROM sessions WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.map(|v| v as u32))
    }

    async fn get_session(&self) -> Result<Option<ProjectSnapshot>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT snapshot_json FROM sessions WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        let Some(json) = json else {
            return Ok(None);
        };

        let mut snapshot: ProjectSnapshot =
            serde_json::from_str(&json).context("corrupt session snapshot")?;

        let rows = sqlx::query("SELECT path, last_modified_ms, data FROM session_blobs")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let path: String = row.get("path");
            let last_modified_ms: i64 = row.get("last_modified_ms");
            let data: Vec<u8> = row.get("data");
            snapshot.tree.update_file(&path, move |file| {
                file.blob = Some(Blob::new(data, last_modified_ms));
            });
        }

        Ok(Some(snapshot))
    }

    async fn put_session(&self, snapshot: &ProjectSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot)?;

        let stored: HashMap<String, StoredBlob> = sqlx::query(
            "SELECT path, last_modified_ms, length(data) AS size, digest FROM session_blobs",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| {
            (
                row.get::<String, _>("path"),
                StoredBlob {
                    last_modified_ms: row.get("last_modified_ms"),
                    size: row.get("size"),
                    digest: row.get("digest"),
                },
            )
        })
        .collect();

        let files = snapshot.tree.files();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sessions (id, schema_version, saved_at, snapshot_json)
            VALUES (1, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                schema_version = excluded.schema_version,
                saved_at = excluded.saved_at,
                snapshot_json = excluded.snapshot_json
            "#,
        )
        .bind(snapshot.schema_version as i64)
        .bind(snapshot.saved_at.timestamp_millis())
        .bind(&json)
        .execute(&mut *tx)
        .await?;

        let mut live: HashSet<&str> = HashSet::new();
        for file in &files {
            let Some(blob) = &file.blob else {
                continue;
            };
            live.insert(file.path.as_str());
            let current = StoredBlob {
                last_modified_ms: blob.last_modified_ms(),
                size: blob.len() as i64,
                digest: sample_digest(blob.bytes()),
            };
            if stored.get(&file.path) == Some(&current) {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO session_blobs (path, last_modified_ms, digest, data) VALUES (?, ?, ?, ?)
                ON CONFLICT(path) DO UPDATE SET
                    last_modified_ms = excluded.last_modified_ms,
                    digest = excluded.digest,
                    data = excluded.data
                "#,
            )
            .bind(&file.path)
            .bind(current.last_modified_ms)
            .bind(&current.digest)
            .bind(blob.bytes())
            .execute(&mut *tx)
            .await?;
        }

        for path in stored.keys().filter(|p| !live.contains(p.as_str())) {
            sqlx::query("DELETE FROM session_blobs WHERE path = ?")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn clear_session(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sessions").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM session_blobs")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn enqueue_sync(&self, folder_name: &str, payload: &serde_json::Value) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO sync_queue (folder_name, payload_json, enqueued_at) VALUES (?, ?, ?)",
        )
        .bind(folder_name)
        .bind(serde_json::to_string(payload)?)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn list_sync_queue(&self) -> Result<Vec<SyncQueueItem>> {
        let rows = sqlx::query(
            "SELECT id, folder_name, payload_json, enqueued_at FROM sync_queue ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<SyncQueueItem> {
                let payload_json: String = row.get("payload_json");
                Ok(SyncQueueItem {
                    id: row.get("id"),
                    folder_name: row.get("folder_name"),
                    payload: serde_json::from_str(&payload_json)?,
                    enqueued_at: from_millis(row.get("enqueued_at")),
                })
            })
            .collect()
    }

    async fn remove_sync_item(&self, id: i64) -> Result<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
