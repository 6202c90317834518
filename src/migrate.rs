use anyhow::Result;
use sqlx::SqlitePool;

/// Create the local store tables. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Single-row table holding the current project snapshot
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            schema_version INTEGER NOT NULL,
            saved_at INTEGER NOT NULL,
            snapshot_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Blob bytes of the snapshot's files, keyed by file path
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS session_blobs (
            path TEXT PRIMARY KEY,
            last_modified_ms INTEGER NOT NULL,
            digest TEXT NOT NULL DEFAULT '',
            data BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before blob digests were tracked
    let has_digest: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM pragma_table_info('session_blobs') WHERE name = 'digest'",
    )
    .fetch_one(pool)
    .await?;
    if has_digest == 0 {
        sqlx::query("ALTER TABLE session_blobs ADD COLUMN digest TEXT NOT NULL DEFAULT ''")
            .execute(pool)
            .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_cache (
            folder_path TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            verdict_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (folder_path, fingerprint)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            folder_name TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
