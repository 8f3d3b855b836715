//! The storage capability contract.
//!
//! Every backend (object storage, relational storage, content-addressed
//! P2P storage, ...) is reached exclusively through [`BlobStorage`], and is
//! identified by one of the fixed [`StorageName`] variants.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::sqlite::{SqliteArgumentValue, SqliteTypeInfo, SqliteValueRef};
use sqlx::{Decode, Encode, Sqlite, Type};

use crate::blob::VersionedHash;

/// Closed set of storage backends a blob can be replicated into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageName {
    FileSystem,
    Memory,
    Sqlite,
    S3,
    Google,
    Swarm,
}

impl StorageName {
    pub const ALL: [StorageName; 6] = [
        StorageName::FileSystem,
        StorageName::Memory,
        StorageName::Sqlite,
        StorageName::S3,
        StorageName::Google,
        StorageName::Swarm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageName::FileSystem => "file_system",
            StorageName::Memory => "memory",
            StorageName::Sqlite => "sqlite",
            StorageName::S3 => "s3",
            StorageName::Google => "google",
            StorageName::Swarm => "swarm",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown storage name: {0}")]
pub struct UnknownStorageName(pub String);

impl FromStr for StorageName {
    type Err = UnknownStorageName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| UnknownStorageName(s.to_string()))
    }
}

impl fmt::Display for StorageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Decode<'_, Sqlite> for StorageName {
    fn decode(value: SqliteValueRef<'_>) -> Result<Self, BoxDynError> {
        let s = <String as Decode<Sqlite>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl<'q> Encode<'q, Sqlite> for StorageName {
    fn encode_by_ref(
        &self,
        args: &mut Vec<SqliteArgumentValue<'q>>,
    ) -> Result<IsNull, BoxDynError> {
        args.push(SqliteArgumentValue::Text(self.as_str().into()));
        Ok(IsNull::No)
    }
}

impl Type<Sqlite> for StorageName {
    fn compatible(ty: &SqliteTypeInfo) -> bool {
        <String as Type<Sqlite>>::compatible(ty)
    }

    fn type_info() -> SqliteTypeInfo {
        <String as Type<Sqlite>>::type_info()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("blob not found at {0}")]
    NotFound(String),
    #[error("invalid blob uri: {0}")]
    InvalidUri(String),
    #[error("{storage} does not support {operation}")]
    Unsupported {
        storage: StorageName,
        operation: &'static str,
    },
    #[error("{storage} health check failed: {reason}")]
    Unhealthy { storage: StorageName, reason: String },
    #[error("{storage} backend error: {source}")]
    Backend {
        storage: StorageName,
        #[source]
        source: anyhow::Error,
    },
}

impl StorageError {
    pub fn backend(storage: StorageName, source: impl Into<anyhow::Error>) -> Self {
        Self::Backend {
            storage,
            source: source.into(),
        }
    }
}

/// Capability every storage backend exposes to the propagation engine.
#[async_trait]
pub trait BlobStorage: Send + Sync + fmt::Debug + 'static {
    fn name(&self) -> StorageName;

    /// Fail if the backend cannot currently serve reads and writes.
    async fn health_check(&self) -> Result<(), StorageError>;

    async fn get_blob(&self, uri: &str) -> Result<Bytes, StorageError>;

    /// Persist `data` and return the URI it can be fetched back from.
    ///
    /// Storing the same hash twice must be safe.
    async fn store_blob(&self, hash: &VersionedHash, data: Bytes) -> Result<String, StorageError>;

    async fn remove_blob(&self, uri: &str) -> Result<(), StorageError>;

    /// Canonical URI for `hash`, or `None` when the backend only learns the
    /// address after storing (content-addressed networks).
    fn blob_uri(&self, hash: &VersionedHash) -> Option<String>;
}
