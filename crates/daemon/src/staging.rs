//! Short-lived local copies of blobs awaiting fan-out.
//!
//! Propagator jobs read the bytes from here instead of carrying them in the
//! job payload, and the finalizer deletes the copy once every storage holds
//! the blob. The staging URI is a pure function of the hash so the
//! reconciler can point resubmitted jobs at an existing copy.

use std::path::Path;

use bytes::Bytes;
use tracing::debug;

use common::blob::{Blob, VersionedHash};
use common::storage::{BlobStorage, StorageError};
use object_store::ObjectStorage;

const STAGING_PREFIX: &str = "staging";

#[derive(Debug, Clone)]
pub struct StagingArea {
    storage: ObjectStorage,
}

impl StagingArea {
    /// Stage on the local disk under `path`.
    pub fn local(path: &Path) -> Result<Self, StorageError> {
        Ok(Self {
            storage: ObjectStorage::new_local(path, Some(STAGING_PREFIX.to_string()))?,
        })
    }

    /// Process-local staging, for tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self {
            storage: ObjectStorage::new_memory(),
        }
    }

    pub fn uri(&self, hash: &VersionedHash) -> String {
        self.storage.key(hash)
    }

    pub async fn stage(&self, blob: &Blob) -> Result<String, StorageError> {
        let uri = self
            .storage
            .store_blob(&blob.versioned_hash, blob.data.clone())
            .await?;
        debug!(versioned_hash = %blob.versioned_hash, uri = %uri, "blob staged");
        Ok(uri)
    }

    pub async fn read(&self, uri: &str) -> Result<Bytes, StorageError> {
        self.storage.get_blob(uri).await
    }

    /// Whether a staged copy of `hash` exists.
    pub async fn contains(&self, hash: &VersionedHash) -> Result<bool, StorageError> {
        match self.storage.get_blob(&self.uri(hash)).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete the staged copy. Missing copies are not an error.
    pub async fn remove(&self, hash: &VersionedHash) -> Result<(), StorageError> {
        self.storage.remove_blob(&self.uri(hash)).await?;
        debug!(versioned_hash = %hash, "staged copy removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stage_read_remove() {
        let temp_dir = tempfile::tempdir().unwrap();
        let staging = StagingArea::local(temp_dir.path()).unwrap();
        let blob = Blob::new(VersionedHash::from_kzg_commitment(b"staged"), &b"bytes"[..]);

        let uri = staging.stage(&blob).await.unwrap();
        assert_eq!(uri, staging.uri(&blob.versioned_hash));
        assert!(uri.starts_with("staging/"));
        assert_eq!(staging.read(&uri).await.unwrap().as_ref(), b"bytes");
        assert!(staging.contains(&blob.versioned_hash).await.unwrap());

        staging.remove(&blob.versioned_hash).await.unwrap();
        assert!(!staging.contains(&blob.versioned_hash).await.unwrap());
        staging.remove(&blob.versioned_hash).await.unwrap();
    }
}
