//! Object storage backends (local filesystem, memory, S3, GCS).
//!
//! Blobs are written under a sharded key derived from the versioned hash, and
//! that key doubles as the blob URI, so [`BlobStorage::blob_uri`] is pure.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use tracing::{debug, info};

use common::blob::VersionedHash;
use common::storage::{BlobStorage, StorageError, StorageName};

const HEALTH_CHECK_KEY: &str = ".health";

/// [`BlobStorage`] over any `object_store` implementation.
#[derive(Debug, Clone)]
pub struct ObjectStorage {
    name: StorageName,
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl ObjectStorage {
    /// Wrap an already-built object store.
    pub fn new(name: StorageName, store: Arc<dyn ObjectStore>, prefix: Option<String>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/').to_string())
            .filter(|p| !p.is_empty());
        Self {
            name,
            store,
            prefix,
        }
    }

    /// Objects stored as files under `path`, created if missing.
    pub fn new_local(path: &Path, prefix: Option<String>) -> Result<Self, StorageError> {
        std::fs::create_dir_all(path)
            .map_err(|e| StorageError::backend(StorageName::FileSystem, e))?;
        let store = LocalFileSystem::new_with_prefix(path)
            .map_err(|e| StorageError::backend(StorageName::FileSystem, e))?;
        info!(path = %path.display(), "file system storage initialized");
        Ok(Self::new(StorageName::FileSystem, Arc::new(store), prefix))
    }

    /// Process-local storage. Data is lost when the last clone is dropped.
    pub fn new_memory() -> Self {
        Self::new(StorageName::Memory, Arc::new(InMemory::new()), None)
    }

    /// S3 or an S3-compatible endpoint such as MinIO.
    #[cfg(feature = "s3")]
    pub fn new_s3(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        bucket: &str,
        region: Option<&str>,
        prefix: Option<String>,
    ) -> Result<Self, StorageError> {
        let store = object_store::aws::AmazonS3Builder::new()
            .with_endpoint(endpoint)
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key)
            .with_bucket_name(bucket)
            .with_region(region.unwrap_or("us-east-1"))
            .with_allow_http(true)
            .build()
            .map_err(|e| StorageError::backend(StorageName::S3, e))?;
        info!(endpoint, bucket, "s3 storage initialized");
        Ok(Self::new(StorageName::S3, Arc::new(store), prefix))
    }

    /// Google Cloud Storage. Credentials come from `service_account_path` or
    /// the environment.
    #[cfg(feature = "gcs")]
    pub fn new_google(
        bucket: &str,
        service_account_path: Option<&Path>,
        prefix: Option<String>,
    ) -> Result<Self, StorageError> {
        let mut builder =
            object_store::gcp::GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
        if let Some(path) = service_account_path {
            builder = builder.with_service_account_path(path.to_string_lossy());
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::backend(StorageName::Google, e))?;
        info!(bucket, "google storage initialized");
        Ok(Self::new(StorageName::Google, Arc::new(store), prefix))
    }

    /// `<prefix>/<h[2..4]>/<h[4..6]>/<h[6..8]>/<h>.bin` with `h` the hash hex
    /// without `0x`. `h[0..2]` is the constant version byte, so sharding
    /// starts after it.
    pub fn key(&self, hash: &VersionedHash) -> String {
        let h = hash.to_hex();
        let key = format!("{}/{}/{}/{}.bin", &h[2..4], &h[4..6], &h[6..8], h);
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key,
        }
    }

    fn parse_uri(&self, uri: &str) -> Result<ObjectPath, StorageError> {
        ObjectPath::parse(uri).map_err(|_| StorageError::InvalidUri(uri.to_string()))
    }

    fn map_err(&self, uri: &str, e: object_store::Error) -> StorageError {
        match e {
            object_store::Error::NotFound { .. } => StorageError::NotFound(uri.to_string()),
            other => StorageError::backend(self.name, other),
        }
    }
}

#[async_trait]
impl BlobStorage for ObjectStorage {
    fn name(&self) -> StorageName {
        self.name
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let key = match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, HEALTH_CHECK_KEY),
            None => HEALTH_CHECK_KEY.to_string(),
        };
        let path = self.parse_uri(&key)?;
        self.store
            .put(&path, PutPayload::from_static(b"ok"))
            .await
            .map_err(|e| StorageError::Unhealthy {
                storage: self.name,
                reason: e.to_string(),
            })?;
        self.store
            .delete(&path)
            .await
            .map_err(|e| StorageError::Unhealthy {
                storage: self.name,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn get_blob(&self, uri: &str) -> Result<Bytes, StorageError> {
        let path = self.parse_uri(uri)?;
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| self.map_err(uri, e))?;
        result.bytes().await.map_err(|e| self.map_err(uri, e))
    }

    async fn store_blob(&self, hash: &VersionedHash, data: Bytes) -> Result<String, StorageError> {
        let key = self.key(hash);
        let path = self.parse_uri(&key)?;
        let size = data.len();
        self.store
            .put(&path, PutPayload::from(data))
            .await
            .map_err(|e| StorageError::backend(self.name, e))?;
        debug!(storage = %self.name, versioned_hash = %hash, size, key = %key, "blob stored");
        Ok(key)
    }

    async fn remove_blob(&self, uri: &str) -> Result<(), StorageError> {
        let path = self.parse_uri(uri)?;
        match self.store.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(StorageError::backend(self.name, e)),
        }
    }

    fn blob_uri(&self, hash: &VersionedHash) -> Option<String> {
        Some(self.key(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(seed: &[u8]) -> VersionedHash {
        VersionedHash::from_kzg_commitment(seed)
    }

    #[tokio::test]
    async fn test_memory_store_get_remove() {
        let storage = ObjectStorage::new_memory();
        storage.health_check().await.unwrap();

        let h = hash(b"memory");
        let uri = storage
            .store_blob(&h, Bytes::from_static(b"blob bytes"))
            .await
            .unwrap();
        assert_eq!(Some(uri.clone()), storage.blob_uri(&h));
        assert_eq!(
            storage.get_blob(&uri).await.unwrap().as_ref(),
            b"blob bytes"
        );

        storage.remove_blob(&uri).await.unwrap();
        assert!(matches!(
            storage.get_blob(&uri).await,
            Err(StorageError::NotFound(_))
        ));
        // removing twice is fine
        storage.remove_blob(&uri).await.unwrap();
    }

    #[tokio::test]
    async fn test_local_store_writes_sharded_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage =
            ObjectStorage::new_local(temp_dir.path(), Some("mainnet".to_string())).unwrap();
        storage.health_check().await.unwrap();

        let h = hash(b"local");
        let uri = storage
            .store_blob(&h, Bytes::from_static(b"on disk"))
            .await
            .unwrap();

        let hex = h.to_hex();
        assert_eq!(
            uri,
            format!("mainnet/{}/{}/{}/{}.bin", &hex[2..4], &hex[4..6], &hex[6..8], hex)
        );
        assert!(temp_dir.path().join(&uri).exists());

        // idempotent re-store
        let again = storage
            .store_blob(&h, Bytes::from_static(b"on disk"))
            .await
            .unwrap();
        assert_eq!(again, uri);
    }

    #[tokio::test]
    async fn test_invalid_uri() {
        let storage = ObjectStorage::new_memory();
        assert!(matches!(
            storage.get_blob("a//b").await,
            Err(StorageError::InvalidUri(_))
        ));
    }
}
