use anyhow::{Context, Result};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Open (creating if needed) the state database and bring the schema up to
/// date. WAL journaling, foreign keys, and NORMAL sync are set on every
/// connection.
pub async fn open_pool(path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    info!("Opening state database at {:?}", path);

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(8));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(8))
        .connect_with(options)
        .await
        .context("Failed to open state database")?;

    migrate(&pool).await?;

    Ok(pool)
}

/// In-memory database for tests.
pub async fn open_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);

    // A single connection keeps the in-memory database alive and shared
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("Failed to open in-memory database")?;

    migrate(&pool).await?;

    Ok(pool)
}

/// Idempotent schema creation plus incremental column migrations.
async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS downloads (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            title            TEXT NOT NULL,
            url              TEXT NOT NULL,
            save_path        TEXT NOT NULL,
            temp_base        TEXT NOT NULL DEFAULT '',
            total_bytes      INTEGER NOT NULL,
            downloaded_bytes INTEGER NOT NULL DEFAULT 0,
            progress         REAL NOT NULL DEFAULT 0,
            state            TEXT NOT NULL,
            priority         INTEGER NOT NULL DEFAULT 2,
            force_overwrite  INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            started_at       TEXT,
            completed_at     TEXT,
            updated_at       TEXT NOT NULL,
            retry_count      INTEGER NOT NULL DEFAULT 0,
            last_error       TEXT,
            expected_hash    TEXT,
            actual_hash      TEXT,
            verified         INTEGER NOT NULL DEFAULT 0,
            queue_position   INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            download_id      INTEGER NOT NULL REFERENCES downloads(id) ON DELETE CASCADE,
            chunk_index      INTEGER NOT NULL,
            start_byte       INTEGER NOT NULL,
            end_byte         INTEGER NOT NULL,
            downloaded_bytes INTEGER NOT NULL DEFAULT 0,
            state            TEXT NOT NULL DEFAULT 'pending',
            temp_path        TEXT NOT NULL,
            hash             TEXT,
            UNIQUE (download_id, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS attempts (
            id                INTEGER PRIMARY KEY AUTOINCREMENT,
            download_id       INTEGER NOT NULL,
            chunk_id          INTEGER,
            attempt_number    INTEGER NOT NULL,
            created_at        TEXT NOT NULL,
            error_text        TEXT,
            error_code        TEXT,
            bytes_transferred INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            download_id INTEGER NOT NULL,
            title       TEXT NOT NULL,
            url         TEXT NOT NULL,
            save_path   TEXT NOT NULL,
            total_bytes INTEGER NOT NULL,
            outcome     TEXT NOT NULL,
            duration_ms INTEGER,
            created_at  TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS state_version (
            id      INTEGER PRIMARY KEY CHECK (id = 1),
            version INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO state_version (id, version) VALUES (1, 0)")
        .execute(pool)
        .await?;

    // Triggers bump the version on insert/update; deletes go through an
    // explicit bump in the store so the DELETE path stays visible in code.
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS downloads_version_on_insert
        AFTER INSERT ON downloads
        BEGIN
            UPDATE state_version SET version = version + 1 WHERE id = 1;
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS downloads_version_on_update
        AFTER UPDATE ON downloads
        BEGIN
            UPDATE state_version SET version = version + 1 WHERE id = 1;
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_downloads_state ON downloads (state)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_downloads_queue
         ON downloads (state, priority DESC, queue_position ASC)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_download ON chunks (download_id, chunk_index)",
    )
    .execute(pool)
    .await?;

    // Tail-checkpoint columns arrived after the initial schema
    add_column_if_missing(pool, "downloads", "tail_hash", "TEXT").await?;
    add_column_if_missing(pool, "downloads", "tail_size", "INTEGER").await?;
    add_column_if_missing(pool, "chunks", "tail_hash", "TEXT").await?;
    add_column_if_missing(pool, "chunks", "tail_size", "INTEGER").await?;

    Ok(())
}

async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    column_type: &str,
) -> Result<()> {
    use sqlx::Row;

    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;

    let exists = rows.iter().any(|row| {
        row.try_get::<String, _>("name")
            .map(|name| name == column)
            .unwrap_or(false)
    });

    if !exists {
        debug!("Migrating: adding {table}.{column}");
        sqlx::query(&format!(
            "ALTER TABLE {table} ADD COLUMN {column} {column_type}"
        ))
        .execute(pool)
        .await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_memory_pool() {
        let pool = open_memory_pool().await.unwrap();
        let version: (i64,) = sqlx::query_as("SELECT version FROM state_version WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version.0, 0);
    }

    #[tokio::test]
    async fn test_migrations_idempotent() {
        let pool = open_memory_pool().await.unwrap();
        // Running the whole migration again must be a no-op
        migrate(&pool).await.unwrap();
        migrate(&pool).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config").join("downloads-state.db");

        let pool = open_pool(&path).await.unwrap();
        drop(pool);
        assert!(path.exists());

        // Re-open over the existing file
        let pool = open_pool(&path).await.unwrap();
        let version: (i64,) = sqlx::query_as("SELECT version FROM state_version WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version.0, 0);
    }

    #[tokio::test]
    async fn test_insert_bumps_version() {
        let pool = open_memory_pool().await.unwrap();
        let now = chrono::Utc::now().naive_utc();
        sqlx::query(
            "INSERT INTO downloads (title, url, save_path, total_bytes, state, created_at, updated_at)
             VALUES ('t', 'http://x/f', '/tmp/f', 10, 'queued', ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        let version: (i64,) = sqlx::query_as("SELECT version FROM state_version WHERE id = 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(version.0, 1);
    }
}
