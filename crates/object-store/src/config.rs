//! Storage backend configuration.

use std::path::PathBuf;

use common::storage::StorageName;
use serde::{Deserialize, Serialize};
use url::Url;

/// One configured storage backend, as it appears in `[[storages]]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Objects under a local directory
    FileSystem {
        path: PathBuf,
        #[serde(default)]
        prefix: Option<String>,
    },
    /// Process-local storage, lost on restart
    Memory,
    /// Blob bytes in a SQLite table; in-memory when `path` is unset
    Sqlite {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// S3 or any S3-compatible service (MinIO, R2, ...)
    S3 {
        endpoint: String,
        access_key: String,
        secret_key: String,
        bucket: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        prefix: Option<String>,
    },
    /// Google Cloud Storage
    Google {
        bucket: String,
        #[serde(default)]
        service_account_path: Option<PathBuf>,
        #[serde(default)]
        prefix: Option<String>,
    },
    /// A Swarm Bee node
    Swarm {
        bee_url: Url,
        postage_batch_id: String,
    },
}

impl StorageConfig {
    pub fn name(&self) -> StorageName {
        match self {
            StorageConfig::FileSystem { .. } => StorageName::FileSystem,
            StorageConfig::Memory => StorageName::Memory,
            StorageConfig::Sqlite { .. } => StorageName::Sqlite,
            StorageConfig::S3 { .. } => StorageName::S3,
            StorageConfig::Google { .. } => StorageName::Google,
            StorageConfig::Swarm { .. } => StorageName::Swarm,
        }
    }

    /// Build an S3 config from `s3://access_key:secret_key@host:port/bucket`.
    pub fn from_s3_url(url: &str) -> Result<Self, S3UrlError> {
        let s3 = S3Config::parse(url)?;
        Ok(StorageConfig::S3 {
            endpoint: s3.endpoint,
            access_key: s3.access_key,
            secret_key: s3.secret_key,
            bucket: s3.bucket,
            region: None,
            prefix: None,
        })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum S3UrlError {
    #[error("invalid S3 URL: {0}")]
    Invalid(String),
    #[error("S3 URL must use the s3:// scheme, got {0}://")]
    Scheme(String),
    #[error("S3 URL is missing {0}")]
    Missing(&'static str),
}

/// Connection details parsed out of an `s3://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

impl S3Config {
    pub fn parse(raw: &str) -> Result<Self, S3UrlError> {
        let url = Url::parse(raw).map_err(|e| S3UrlError::Invalid(e.to_string()))?;
        if url.scheme() != "s3" {
            return Err(S3UrlError::Scheme(url.scheme().to_string()));
        }

        let access_key = url.username();
        if access_key.is_empty() {
            return Err(S3UrlError::Missing("access key"));
        }
        let secret_key = url.password().ok_or(S3UrlError::Missing("secret key"))?;
        let host = url.host_str().ok_or(S3UrlError::Missing("host"))?;
        let bucket = url.path().trim_matches('/');
        if bucket.is_empty() {
            return Err(S3UrlError::Missing("bucket"));
        }

        let endpoint = match url.port() {
            Some(port) => format!("http://{}:{}", host, port),
            None => format!("http://{}", host),
        };

        Ok(Self {
            endpoint,
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            bucket: bucket.to_string(),
        })
    }
}
