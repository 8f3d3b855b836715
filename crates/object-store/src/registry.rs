//! Storage registry, built once from configuration and never mutated.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::storage::{BlobStorage, StorageError, StorageName};
use tracing::{info, warn};

use crate::config::StorageConfig;
use crate::object::ObjectStorage;
use crate::sqlite::SqliteStorage;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("storage {0} is configured more than once")]
    Duplicate(StorageName),
    #[error("failed to build storage: {0}")]
    Build(#[from] StorageError),
}

/// Whether this build carries a driver for `name`.
pub fn is_supported(name: StorageName) -> bool {
    match name {
        StorageName::FileSystem | StorageName::Memory | StorageName::Sqlite => true,
        StorageName::S3 => cfg!(feature = "s3"),
        StorageName::Google => cfg!(feature = "gcs"),
        StorageName::Swarm => cfg!(feature = "swarm"),
    }
}

#[derive(Debug, Clone, Default)]
pub struct StorageRegistry {
    storages: BTreeMap<StorageName, Arc<dyn BlobStorage>>,
}

impl StorageRegistry {
    /// Build every configured storage this build supports.
    ///
    /// Storages whose driver was compiled out are skipped with a warning.
    pub async fn from_config(configs: &[StorageConfig]) -> Result<Self, RegistryError> {
        let mut storages: BTreeMap<StorageName, Arc<dyn BlobStorage>> = BTreeMap::new();

        for config in configs {
            let name = config.name();
            if storages.contains_key(&name) {
                return Err(RegistryError::Duplicate(name));
            }
            if !is_supported(name) {
                warn!(storage = %name, "storage configured but not supported by this build, skipping");
                continue;
            }

            let storage = build(config).await?;
            info!(storage = %name, "storage registered");
            storages.insert(name, storage);
        }

        Ok(Self { storages })
    }

    pub fn get(&self, name: StorageName) -> Option<Arc<dyn BlobStorage>> {
        self.storages.get(&name).cloned()
    }

    pub fn names(&self) -> Vec<StorageName> {
        self.storages.keys().copied().collect()
    }

    /// All registered storages, ordered by name.
    pub fn storages(&self) -> Vec<Arc<dyn BlobStorage>> {
        self.storages.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.storages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.is_empty()
    }
}

async fn build(config: &StorageConfig) -> Result<Arc<dyn BlobStorage>, StorageError> {
    let storage: Arc<dyn BlobStorage> = match config {
        StorageConfig::FileSystem { path, prefix } => {
            Arc::new(ObjectStorage::new_local(path, prefix.clone())?)
        }
        StorageConfig::Memory => Arc::new(ObjectStorage::new_memory()),
        StorageConfig::Sqlite { path } => match path {
            Some(path) => Arc::new(SqliteStorage::new(path).await?),
            None => Arc::new(SqliteStorage::in_memory().await?),
        },
        #[cfg(feature = "s3")]
        StorageConfig::S3 {
            endpoint,
            access_key,
            secret_key,
            bucket,
            region,
            prefix,
        } => Arc::new(ObjectStorage::new_s3(
            endpoint,
            access_key,
            secret_key,
            bucket,
            region.as_deref(),
            prefix.clone(),
        )?),
        #[cfg(feature = "gcs")]
        StorageConfig::Google {
            bucket,
            service_account_path,
            prefix,
        } => Arc::new(ObjectStorage::new_google(
            bucket,
            service_account_path.as_deref(),
            prefix.clone(),
        )?),
        #[cfg(feature = "swarm")]
        StorageConfig::Swarm {
            bee_url,
            postage_batch_id,
        } => Arc::new(crate::swarm::SwarmStorage::new(
            bee_url.clone(),
            postage_batch_id.clone(),
        )),
        #[allow(unreachable_patterns)]
        other => {
            return Err(StorageError::Unsupported {
                storage: other.name(),
                operation: "construction",
            })
        }
    };
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_builds_local_backends() {
        let temp_dir = tempfile::tempdir().unwrap();
        let configs = vec![
            StorageConfig::Sqlite { path: None },
            StorageConfig::FileSystem {
                path: temp_dir.path().join("blobs"),
                prefix: None,
            },
            StorageConfig::Memory,
        ];

        let registry = StorageRegistry::from_config(&configs).await.unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.names(),
            vec![StorageName::FileSystem, StorageName::Memory, StorageName::Sqlite]
        );
        let fs = registry.get(StorageName::FileSystem).unwrap();
        assert_eq!(fs.name(), StorageName::FileSystem);
        assert!(registry.get(StorageName::S3).is_none());
    }

    #[tokio::test]
    async fn test_registry_rejects_duplicates() {
        let configs = vec![StorageConfig::Memory, StorageConfig::Memory];
        let err = StorageRegistry::from_config(&configs).await.unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(StorageName::Memory)));
    }

    #[test]
    fn test_local_backends_always_supported() {
        assert!(is_supported(StorageName::FileSystem));
        assert!(is_supported(StorageName::Memory));
        assert!(is_supported(StorageName::Sqlite));
    }
}
