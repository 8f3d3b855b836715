use std::sync::Arc;

use serde::{Deserialize, Serialize};

use common::blob::VersionedHash;
use common::storage::StorageName;

use crate::queue::{Backoff, FlowJob, JobOptions, NewJob, QueueError};

use super::priority::{build_job_id, HighWaterMark};

pub const FINALIZER_QUEUE: &str = "finalizer";
pub const PROPAGATE_JOB: &str = "propagate";
pub const FINALIZE_JOB: &str = "finalize";

/// Payload shared by propagator and finalizer jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobJobData {
    pub versioned_hash: VersionedHash,
    /// Where the staged copy lives.
    pub blob_uri: String,
}

/// Queue processed by the propagator of `storage`.
pub fn propagator_queue(storage: StorageName) -> &'static str {
    storage.as_str()
}

/// Builds the flow submitted for every blob: one finalizer parent and one
/// propagator child per enabled storage. Used by both the real-time path
/// and the reconciler, so both produce identical flows and job ids.
#[derive(Debug, Clone)]
pub struct FlowBuilder {
    storages: Vec<StorageName>,
    attempts: u32,
    backoff: Backoff,
    high_water_mark: Arc<HighWaterMark>,
}

impl FlowBuilder {
    pub fn new(
        storages: Vec<StorageName>,
        attempts: u32,
        backoff: Backoff,
        high_water_mark: Arc<HighWaterMark>,
    ) -> Self {
        Self {
            storages,
            attempts,
            backoff,
            high_water_mark,
        }
    }

    pub fn storages(&self) -> &[StorageName] {
        &self.storages
    }

    pub fn high_water_mark(&self) -> &HighWaterMark {
        &self.high_water_mark
    }

    /// Build the flow for one blob. Computing its priority may raise the
    /// high-water mark.
    pub fn build(
        &self,
        versioned_hash: &VersionedHash,
        blob_uri: String,
        block_number: Option<u64>,
    ) -> Result<FlowJob, QueueError> {
        let options = JobOptions {
            priority: self.high_water_mark.compute_priority(block_number),
            attempts: self.attempts,
            backoff: self.backoff,
        };
        let data = BlobJobData {
            versioned_hash: versioned_hash.clone(),
            blob_uri,
        };

        let children = self
            .storages
            .iter()
            .map(|storage| {
                let queue = propagator_queue(*storage);
                NewJob::new(
                    build_job_id(queue, versioned_hash),
                    queue,
                    PROPAGATE_JOB,
                    &data,
                    options,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let parent = NewJob::new(
            build_job_id(FINALIZER_QUEUE, versioned_hash),
            FINALIZER_QUEUE,
            FINALIZE_JOB,
            &data,
            options,
        )?;

        Ok(FlowJob { parent, children })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_flow_shape() {
        let builder = FlowBuilder::new(
            vec![StorageName::FileSystem, StorageName::Sqlite],
            3,
            Backoff::exponential(Duration::from_secs(1)),
            Arc::new(HighWaterMark::new(0)),
        );
        let hash = VersionedHash::from_kzg_commitment(b"flow");

        let flow = builder.build(&hash, "staging/x".to_string(), Some(10)).unwrap();
        assert_eq!(flow.parent.id, format!("finalizer:{}", hash));
        assert_eq!(flow.parent.name, FINALIZE_JOB);
        assert_eq!(flow.children.len(), 2);
        assert_eq!(flow.children[0].id, format!("file_system:{}", hash));
        assert_eq!(flow.children[1].queue, "sqlite");
        assert_eq!(flow.children[1].options.attempts, 3);
        assert_eq!(flow.children[1].options.priority, 1);

        let data: BlobJobData = serde_json::from_value(flow.children[0].data.clone()).unwrap();
        assert_eq!(data.versioned_hash, hash);
        assert_eq!(data.blob_uri, "staging/x");
        assert_eq!(builder.high_water_mark().highest(), Some(10));

        // wire shape
        assert!(flow.parent.data.get("versionedHash").is_some());
        assert!(flow.parent.data.get("blobUri").is_some());
    }
}
