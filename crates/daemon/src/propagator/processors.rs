use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use common::storage::BlobStorage;

use crate::database::{Database, StorageReference};
use crate::queue::{Job, Processor};
use crate::staging::StagingArea;

use super::flows::BlobJobData;

/// Copies a staged blob into one storage and records the reference.
#[derive(Debug)]
pub struct StorageProcessor {
    storage: Arc<dyn BlobStorage>,
    staging: StagingArea,
    db: Database,
}

impl StorageProcessor {
    pub fn new(storage: Arc<dyn BlobStorage>, staging: StagingArea, db: Database) -> Self {
        Self {
            storage,
            staging,
            db,
        }
    }
}

#[async_trait]
impl Processor for StorageProcessor {
    async fn process(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
        let data: BlobJobData = job.data_as().context("malformed propagator job")?;
        let storage = self.storage.name();

        let bytes = self
            .staging
            .read(&data.blob_uri)
            .await
            .with_context(|| format!("reading staged copy {}", data.blob_uri))?;
        let data_reference = self.storage.store_blob(&data.versioned_hash, bytes).await?;

        let reference = StorageReference {
            blob_hash: data.versioned_hash,
            storage,
            data_reference,
        };
        self.db.upsert_storage_reference(&reference).await?;

        info!(
            versioned_hash = %reference.blob_hash,
            storage = %storage,
            data_reference = %reference.data_reference,
            "blob propagated"
        );
        Ok(json!({
            "storage": storage,
            "dataReference": reference.data_reference,
        }))
    }
}

/// Removes the staged copy once every propagator of the flow succeeded.
#[derive(Debug)]
pub struct FinalizerProcessor {
    staging: StagingArea,
}

impl FinalizerProcessor {
    pub fn new(staging: StagingArea) -> Self {
        Self { staging }
    }
}

#[async_trait]
impl Processor for FinalizerProcessor {
    async fn process(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
        let data: BlobJobData = job.data_as().context("malformed finalizer job")?;
        self.staging.remove(&data.versioned_hash).await?;

        debug!(versioned_hash = %data.versioned_hash, "blob fully propagated");
        Ok(json!({ "removed": data.blob_uri }))
    }
}
