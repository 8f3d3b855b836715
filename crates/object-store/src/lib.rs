//! Storage backends for blobprop.
//!
//! Every backend implements [`common::storage::BlobStorage`]:
//!
//! - [`ObjectStorage`]: local filesystem, in-memory, S3/MinIO and Google Cloud
//!   Storage through the `object_store` crate
//! - [`SqliteStorage`]: relational storage with blob bytes kept in SQLite
//! - `SwarmStorage`: content-addressed storage through a Bee node (feature `swarm`)
//!
//! Backends are built once from configuration by [`StorageRegistry`].
//!
//! # Example
//!
//! ```rust,no_run
//! use blobprop_object_store::{StorageConfig, StorageRegistry};
//!
//! # async fn example() -> Result<(), blobprop_object_store::RegistryError> {
//! let configs = vec![
//!     StorageConfig::FileSystem {
//!         path: "/var/lib/blobprop/blobs".into(),
//!         prefix: None,
//!     },
//!     StorageConfig::Sqlite { path: None },
//! ];
//! let registry = StorageRegistry::from_config(&configs).await?;
//! assert_eq!(registry.len(), 2);
//! # Ok(())
//! # }
//! ```

mod config;
mod object;
mod registry;
mod sqlite;
#[cfg(feature = "swarm")]
mod swarm;

pub use config::{S3Config, S3UrlError, StorageConfig};
pub use object::ObjectStorage;
pub use registry::{is_supported, RegistryError, StorageRegistry};
pub use sqlite::SqliteStorage;
#[cfg(feature = "swarm")]
pub use swarm::SwarmStorage;
