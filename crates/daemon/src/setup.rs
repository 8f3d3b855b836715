//! Turns a [`Config`] into a running engine.

use tracing::info;

use common::storage::StorageError;
use object_store::{RegistryError, StorageRegistry};

use crate::config::Config;
use crate::database::{Database, DatabaseError};
use crate::propagator::{BlobPropagator, CreationError, PropagatorOptions};
use crate::staging::StagingArea;

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("database setup failed: {0}")]
    Database(#[from] DatabaseError),
    #[error("storage setup failed: {0}")]
    Registry(#[from] RegistryError),
    #[error("staging setup failed: {0}")]
    Staging(#[from] StorageError),
    #[error("failed to create blob propagator: {0}")]
    Creation(#[from] CreationError),
}

pub async fn open_database(config: &Config) -> Result<Database, DatabaseError> {
    match &config.database.path {
        Some(path) => Database::new(path).await,
        None => {
            info!("no database path configured, using an in-memory database");
            Database::in_memory().await
        }
    }
}

pub fn open_staging(config: &Config) -> Result<StagingArea, StorageError> {
    match &config.staging.path {
        Some(path) => StagingArea::local(path),
        None => Ok(StagingArea::in_memory()),
    }
}

/// Open the database and staging area, build every configured storage and
/// create the engine over them.
pub async fn build_propagator(
    config: &Config,
    options: PropagatorOptions,
) -> Result<BlobPropagator, SetupError> {
    let db = open_database(config).await?;
    let staging = open_staging(config)?;
    let registry = StorageRegistry::from_config(&config.storages).await?;

    let propagator = BlobPropagator::create(
        registry.storages(),
        config.primary_storage,
        db,
        staging,
        options,
    )
    .await?;
    Ok(propagator)
}
