//! Relational blob storage backed by SQLite.
//!
//! This backend manages its own connection pool, separate from the engine's
//! database, and keeps blob bytes in a single `blob_data` table. The blob URI
//! is the versioned hash itself.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use common::blob::VersionedHash;
use common::storage::{BlobStorage, StorageError, StorageName};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a file-backed store.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Self::error(e))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(Self::error)?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        info!("sqlite blob storage initialized at {:?}", path);
        Ok(storage)
    }

    /// Create an in-memory store, useful for tests.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(Self::error)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blob_data (
                versioned_hash TEXT PRIMARY KEY,
                data BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(Self::error)?;

        Ok(())
    }

    /// Number of blobs currently held.
    pub async fn count(&self) -> Result<i64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM blob_data")
            .fetch_one(&self.pool)
            .await
            .map_err(Self::error)?;
        Ok(row.get("count"))
    }

    fn error(e: impl Into<anyhow::Error>) -> StorageError {
        StorageError::backend(StorageName::Sqlite, e)
    }
}

#[async_trait]
impl BlobStorage for SqliteStorage {
    fn name(&self) -> StorageName {
        StorageName::Sqlite
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Unhealthy {
                storage: StorageName::Sqlite,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn get_blob(&self, uri: &str) -> Result<Bytes, StorageError> {
        let row = sqlx::query("SELECT data FROM blob_data WHERE versioned_hash = ?1")
            .bind(uri)
            .fetch_optional(&self.pool)
            .await
            .map_err(Self::error)?;

        match row {
            Some(row) => {
                let data: Vec<u8> = row.get("data");
                Ok(Bytes::from(data))
            }
            None => Err(StorageError::NotFound(uri.to_string())),
        }
    }

    async fn store_blob(&self, hash: &VersionedHash, data: Bytes) -> Result<String, StorageError> {
        let uri = hash.to_string();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO blob_data (versioned_hash, data, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(versioned_hash) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(&uri)
        .bind(data.as_ref())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(Self::error)?;

        debug!(versioned_hash = %hash, size = data.len(), "blob stored in sqlite");
        Ok(uri)
    }

    async fn remove_blob(&self, uri: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM blob_data WHERE versioned_hash = ?1")
            .bind(uri)
            .execute(&self.pool)
            .await
            .map_err(Self::error)?;
        Ok(())
    }

    fn blob_uri(&self, hash: &VersionedHash) -> Option<String> {
        Some(hash.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let storage = SqliteStorage::in_memory().await.unwrap();
        storage.health_check().await.unwrap();

        let hash = VersionedHash::from_kzg_commitment(b"sqlite");
        let uri = storage
            .store_blob(&hash, Bytes::from_static(b"row bytes"))
            .await
            .unwrap();
        assert_eq!(uri, hash.to_string());
        assert_eq!(storage.count().await.unwrap(), 1);

        // upsert keeps a single row
        storage
            .store_blob(&hash, Bytes::from_static(b"row bytes"))
            .await
            .unwrap();
        assert_eq!(storage.count().await.unwrap(), 1);

        assert_eq!(storage.get_blob(&uri).await.unwrap().as_ref(), b"row bytes");
        storage.remove_blob(&uri).await.unwrap();
        assert!(matches!(
            storage.get_blob(&uri).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("data").join("blobs.sqlite");
        let hash = VersionedHash::from_kzg_commitment(b"persisted");

        {
            let storage = SqliteStorage::new(&path).await.unwrap();
            storage
                .store_blob(&hash, Bytes::from_static(b"kept"))
                .await
                .unwrap();
        }

        let storage = SqliteStorage::new(&path).await.unwrap();
        let data = storage.get_blob(&hash.to_string()).await.unwrap();
        assert_eq!(data.as_ref(), b"kept");
    }
}
