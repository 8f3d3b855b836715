//! Blob propagation engine: replicates EIP-4844 blobs into every configured
//! storage through durable per-storage queues and repairs blobs left
//! without any copy.

pub mod config;
pub mod database;
pub mod logging;
pub mod propagator;
pub mod queue;
pub mod setup;
pub mod staging;

pub use config::Config;
pub use database::Database;
pub use propagator::{BlobPropagator, PropagatorOptions};
pub use staging::StagingArea;

/// Daemon build info, listing the storage drivers compiled in.
///
/// `common::build_info!` only knows the package, features are read here
/// because they belong to this crate.
pub fn build_info() -> common::version::BuildInfo {
    let mut info = common::build_info!();
    let features: Vec<&str> = [
        ("s3", cfg!(feature = "s3")),
        ("gcs", cfg!(feature = "gcs")),
        ("swarm", cfg!(feature = "swarm")),
    ]
    .into_iter()
    .filter_map(|(name, enabled)| enabled.then_some(name))
    .collect();
    if !features.is_empty() {
        info.build_features = features.join(",");
    }
    info
}
