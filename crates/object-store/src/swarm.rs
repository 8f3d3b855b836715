//! Content-addressed storage on Swarm through a Bee node's HTTP API.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use common::blob::VersionedHash;
use common::storage::{BlobStorage, StorageError, StorageName};

const POSTAGE_BATCH_HEADER: &str = "swarm-postage-batch-id";

#[derive(Debug, Deserialize)]
struct UploadResponse {
    reference: String,
}

#[derive(Debug, Clone)]
pub struct SwarmStorage {
    client: reqwest::Client,
    bee_url: Url,
    postage_batch_id: String,
}

impl SwarmStorage {
    pub fn new(bee_url: Url, postage_batch_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bee_url,
            postage_batch_id: postage_batch_id.into(),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, StorageError> {
        self.bee_url
            .join(path)
            .map_err(|e| StorageError::backend(StorageName::Swarm, e))
    }

    fn error(e: impl Into<anyhow::Error>) -> StorageError {
        StorageError::backend(StorageName::Swarm, e)
    }
}

#[async_trait]
impl BlobStorage for SwarmStorage {
    fn name(&self) -> StorageName {
        StorageName::Swarm
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let response = self
            .client
            .get(self.endpoint("health")?)
            .send()
            .await
            .map_err(|e| StorageError::Unhealthy {
                storage: StorageName::Swarm,
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(StorageError::Unhealthy {
                storage: StorageName::Swarm,
                reason: format!("bee node returned {}", response.status()),
            });
        }
        Ok(())
    }

    async fn get_blob(&self, uri: &str) -> Result<Bytes, StorageError> {
        let response = self
            .client
            .get(self.endpoint(&format!("bytes/{}", uri))?)
            .send()
            .await
            .map_err(Self::error)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(StorageError::NotFound(uri.to_string()));
        }
        let response = response.error_for_status().map_err(Self::error)?;
        response.bytes().await.map_err(Self::error)
    }

    async fn store_blob(&self, hash: &VersionedHash, data: Bytes) -> Result<String, StorageError> {
        let size = data.len();
        let response = self
            .client
            .post(self.endpoint("bytes")?)
            .header(POSTAGE_BATCH_HEADER, &self.postage_batch_id)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(Self::error)?
            .error_for_status()
            .map_err(Self::error)?;

        let upload: UploadResponse = response.json().await.map_err(Self::error)?;
        debug!(versioned_hash = %hash, size, reference = %upload.reference, "blob uploaded to swarm");
        Ok(upload.reference)
    }

    async fn remove_blob(&self, uri: &str) -> Result<(), StorageError> {
        // Swarm chunks expire with their postage batch, there is no delete.
        warn!(reference = %uri, "swarm does not support removal, skipping");
        Ok(())
    }

    fn blob_uri(&self, _hash: &VersionedHash) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(base: &str) -> SwarmStorage {
        SwarmStorage::new(Url::parse(base).unwrap(), "batch")
    }

    #[test]
    fn test_endpoint_joins_bee_api_paths() {
        let swarm = storage("http://localhost:1633/");
        assert_eq!(
            swarm.endpoint("bytes").unwrap().as_str(),
            "http://localhost:1633/bytes"
        );
        assert_eq!(
            swarm.endpoint("bytes/abcd").unwrap().as_str(),
            "http://localhost:1633/bytes/abcd"
        );

        // nested gateway prefix is kept when the base ends with a slash
        let gateway = storage("https://gateway.example/bee/");
        assert_eq!(
            gateway.endpoint("health").unwrap().as_str(),
            "https://gateway.example/bee/health"
        );
    }

    #[tokio::test]
    async fn test_content_addressed_contract() {
        let swarm = storage("http://localhost:1633/");
        let hash = VersionedHash::from_kzg_commitment(b"swarm");

        assert_eq!(swarm.name(), StorageName::Swarm);
        assert_eq!(swarm.blob_uri(&hash), None);
        // removal is a no-op and never touches the node
        swarm.remove_blob("deadbeef").await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_node_is_unhealthy() {
        let swarm = storage("http://127.0.0.1:1/");
        assert!(matches!(
            swarm.health_check().await,
            Err(StorageError::Unhealthy {
                storage: StorageName::Swarm,
                ..
            })
        ));
    }
}
