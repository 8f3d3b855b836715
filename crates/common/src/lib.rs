//! Core types shared by every blobprop crate.
//!
//! - [`blob`]: the blob payload and its EIP-4844 versioned hash
//! - [`storage`]: the closed set of storage names and the
//!   [`BlobStorage`](storage::BlobStorage) capability every backend exposes

pub mod blob;
pub mod storage;
pub mod version;

pub mod prelude {
    pub use crate::blob::{Blob, VersionedHash, VersionedHashError};
    pub use crate::storage::{BlobStorage, StorageError, StorageName};
}
