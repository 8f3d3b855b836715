//! SQLite database holding blob rows, storage references and the job queue.
//!
//! Queries are runtime `sqlx::query` calls grouped per table in the
//! submodules, each extending [`Database`] with its own methods.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

mod blobs;
mod storage_references;

pub use blobs::BlobRecord;
pub use storage_references::StorageReference;

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl std::ops::Deref for Database {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("invalid row in {table}: {reason}")]
    InvalidRow { table: &'static str, reason: String },
}

impl Database {
    /// Open (or create) a file-backed database and run migrations.
    ///
    /// WAL mode with a busy timeout lets several processes share the file,
    /// which is how the queue is shared between `run` and one-shot commands.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Migration(format!("Failed to create database directory: {}", e))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        info!("database initialized at {:?}", path);
        Ok(db)
    }

    /// In-memory database, used by tests and ephemeral runs.
    ///
    /// A single connection that is never recycled, otherwise every new
    /// connection would see a fresh empty database.
    pub async fn in_memory() -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                versioned_hash TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                block_number INTEGER,
                inserted_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_blobs_inserted_at ON blobs(inserted_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blob_storage_references (
                blob_hash TEXT NOT NULL,
                storage TEXT NOT NULL,
                data_reference TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (blob_hash, storage)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                name TEXT NOT NULL,
                parent_id TEXT,
                data TEXT NOT NULL,
                priority INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL,
                attempts_made INTEGER NOT NULL DEFAULT 0,
                backoff_delay_ms INTEGER NOT NULL,
                state TEXT NOT NULL,
                run_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                finished_at INTEGER,
                failed_reason TEXT,
                return_value TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_runnable ON jobs(queue, state, priority, run_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_parent ON jobs(parent_id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Current wall clock as unix milliseconds, the unit every table stores.
pub(crate) fn now_millis() -> i64 {
    to_millis(OffsetDateTime::now_utc())
}

pub(crate) fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_millis(millis: i64) -> Result<OffsetDateTime, DatabaseError> {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000).map_err(|e| {
        DatabaseError::InvalidRow {
            table: "timestamp",
            reason: e.to_string(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
    }

    #[tokio::test]
    async fn test_file_database_is_shared() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("blobprop.db");

        let first = Database::new(&path).await.unwrap();
        let hash = common::blob::VersionedHash::from_kzg_commitment(b"shared");
        first.insert_blob(&hash, 10, None).await.unwrap();

        let second = Database::new(&path).await.unwrap();
        assert!(second.get_blob(&hash).await.unwrap().is_some());
    }

    #[test]
    fn test_millis_roundtrip() {
        let at = from_millis(1_700_000_000_123).unwrap();
        assert_eq!(to_millis(at), 1_700_000_000_123);
    }
}
