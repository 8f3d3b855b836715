//! The blob propagation engine.
//!
//! [`BlobPropagator`] writes each blob to the primary storage right away,
//! stages a copy and submits a flow: one propagator job per enabled storage
//! with a finalizer job as their parent. Every storage has its own queue and
//! worker, the finalizer deletes the staged copy once all of them succeed,
//! and the [`Reconciler`] periodically resubmits flows for blobs that ended
//! up with no storage reference at all.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{join_all, try_join_all};
use tracing::{debug, info, warn};

use common::blob::Blob;
use common::storage::{BlobStorage, StorageName};

use crate::database::{Database, StorageReference};
use crate::queue::{Backoff, FlowProducer, Processor, QueueStore, Worker, WorkerOptions};
use crate::staging::StagingArea;

mod error;
mod flows;
mod priority;
mod processors;
mod reconciler;

pub use error::{BoxError, CloseFailure, CreationError, PropagationError, PropagatorCloseError};
pub use flows::{propagator_queue, BlobJobData, FlowBuilder, FINALIZER_QUEUE};
pub use priority::{
    build_job_id, compute_linear_priority, HighWaterMark, PriorityRange, MAX_PRIORITY,
};
pub use processors::{FinalizerProcessor, StorageProcessor};
pub use reconciler::{
    parse_schedule, tick_job_id, BlobTimestamps, CronTrigger, ReconcileResult, Reconciler,
    ReconcilerError, ReconcilerOptions, RECONCILER_QUEUE,
};

use error::{close_in_phases, close_step};

#[derive(Debug, Clone)]
pub struct PropagatorOptions {
    /// Attempts per job, including the first.
    pub attempts: u32,
    pub backoff: Backoff,
    /// Bottom of the priority scale. Blobs at or below it get `MAX_PRIORITY`.
    pub lowest_block_number: u64,
    pub worker: WorkerOptions,
    /// Spawn workers. Without them the engine only submits flows, for
    /// processes sharing the database with a running daemon.
    pub run_workers: bool,
    /// Cron trigger and worker for the reconciler, when set.
    pub reconciler: Option<ReconcilerOptions>,
    /// Orphans handled per reconciliation pass.
    pub reconcile_batch_size: u32,
}

impl Default for PropagatorOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Backoff::default(),
            lowest_block_number: 0,
            worker: WorkerOptions::default(),
            run_workers: true,
            reconciler: Some(ReconcilerOptions::default()),
            reconcile_batch_size: reconciler::DEFAULT_BATCH_SIZE,
        }
    }
}

/// Queue and worker replicating blobs into one storage.
#[derive(Debug)]
pub struct Propagator {
    storage: Arc<dyn BlobStorage>,
    worker: Option<Worker>,
}

impl Propagator {
    pub fn storage(&self) -> StorageName {
        self.storage.name()
    }

    pub fn queue(&self) -> &'static str {
        propagator_queue(self.storage.name())
    }

    async fn close(&self) -> Result<(), crate::queue::WorkerError> {
        match &self.worker {
            Some(worker) => worker.close().await,
            None => Ok(()),
        }
    }
}

fn spawn_worker(
    options: &PropagatorOptions,
    queue: &QueueStore,
    queue_name: &str,
    processor: Arc<dyn Processor>,
) -> Option<Worker> {
    options
        .run_workers
        .then(|| Worker::spawn(queue.clone(), queue_name, processor, options.worker))
}

#[derive(Debug)]
struct Scheduled {
    worker: Worker,
    trigger: CronTrigger,
}

#[derive(Debug)]
pub struct BlobPropagator {
    db: Database,
    queue: QueueStore,
    primary: Arc<dyn BlobStorage>,
    staging: StagingArea,
    flows: FlowBuilder,
    producer: FlowProducer,
    propagators: Vec<Propagator>,
    finalizer: Option<Worker>,
    reconciler: Reconciler,
    scheduled: Option<Scheduled>,
    closed: AtomicBool,
}

impl BlobPropagator {
    /// Build the engine over every usable storage.
    ///
    /// Storages this build has no driver for are dropped, duplicates keep
    /// their first occurrence, and storages failing their health check are
    /// skipped with a warning. The primary storage must survive all three.
    pub async fn create(
        storages: Vec<Arc<dyn BlobStorage>>,
        primary: StorageName,
        db: Database,
        staging: StagingArea,
        options: PropagatorOptions,
    ) -> Result<Self, CreationError> {
        let schedule = options
            .reconciler
            .as_ref()
            .map(|reconciler| parse_schedule(&reconciler.cron_pattern))
            .transpose()?;

        let mut seen = BTreeSet::new();
        let candidates: Vec<_> = storages
            .into_iter()
            .filter(|storage| {
                let name = storage.name();
                if !object_store::is_supported(name) {
                    warn!(storage = %name, "storage not supported by this build, skipping");
                    return false;
                }
                if !seen.insert(name) {
                    warn!(storage = %name, "storage given more than once, keeping the first");
                    return false;
                }
                true
            })
            .collect();
        if !seen.contains(&primary) {
            return Err(CreationError::PrimaryNotConfigured(primary));
        }

        let checks = join_all(candidates.iter().map(|storage| storage.health_check())).await;
        let mut healthy = Vec::new();
        for (storage, check) in candidates.into_iter().zip(checks) {
            match check {
                Ok(()) => healthy.push(storage),
                Err(source) if storage.name() == primary => {
                    return Err(CreationError::PrimaryUnhealthy {
                        storage: primary,
                        source,
                    });
                }
                Err(e) => warn!(storage = %storage.name(), error = %e, "storage unhealthy, skipping"),
            }
        }
        if healthy.is_empty() {
            return Err(CreationError::NoStorages);
        }
        let primary_storage = healthy
            .iter()
            .find(|storage| storage.name() == primary)
            .cloned()
            .ok_or(CreationError::PrimaryNotConfigured(primary))?;

        let queue = QueueStore::new(db.clone());
        let producer = FlowProducer::new(queue.clone());
        let flows = FlowBuilder::new(
            healthy.iter().map(|storage| storage.name()).collect(),
            options.attempts,
            options.backoff,
            Arc::new(HighWaterMark::new(options.lowest_block_number)),
        );

        let propagators = healthy
            .iter()
            .map(|storage| {
                let processor =
                    StorageProcessor::new(storage.clone(), staging.clone(), db.clone());
                Propagator {
                    storage: storage.clone(),
                    worker: spawn_worker(
                        &options,
                        &queue,
                        propagator_queue(storage.name()),
                        Arc::new(processor),
                    ),
                }
            })
            .collect::<Vec<_>>();
        let finalizer = spawn_worker(
            &options,
            &queue,
            FINALIZER_QUEUE,
            Arc::new(FinalizerProcessor::new(staging.clone())),
        );

        let batch_size = options
            .reconciler
            .as_ref()
            .map(|reconciler| reconciler.batch_size)
            .unwrap_or(options.reconcile_batch_size);
        // Orphans are recovered from the primary first, then any other
        // storage that can locate a blob by hash.
        let sources = std::iter::once(primary_storage.clone())
            .chain(
                healthy
                    .iter()
                    .filter(|storage| storage.name() != primary)
                    .cloned(),
            )
            .collect();
        let reconciler = Reconciler::new(
            db.clone(),
            producer.clone(),
            flows.clone(),
            staging.clone(),
            sources,
            batch_size,
        );
        let scheduled = match schedule {
            Some(schedule) if options.run_workers => {
                let worker_options = WorkerOptions {
                    concurrency: 1,
                    ..options.worker
                };
                Some(Scheduled {
                    worker: Worker::spawn(
                        queue.clone(),
                        RECONCILER_QUEUE,
                        Arc::new(reconciler.clone()),
                        worker_options,
                    ),
                    trigger: CronTrigger::spawn(schedule, producer.clone()),
                })
            }
            _ => None,
        };

        info!(
            storages = ?flows.storages(),
            primary = %primary,
            reconciler = scheduled.is_some(),
            workers = options.run_workers,
            "blob propagator created"
        );

        Ok(Self {
            db,
            queue,
            primary: primary_storage,
            staging,
            flows,
            producer,
            propagators,
            finalizer,
            reconciler,
            scheduled,
            closed: AtomicBool::new(false),
        })
    }

    /// Store `blob` in the primary storage and submit it for propagation to
    /// every enabled storage. Returns once the flow is submitted.
    pub async fn propagate_blob(&self, blob: &Blob) -> Result<(), PropagationError> {
        self.ensure_available()?;

        let blob_uri = self.store_primary_and_stage(blob).await?;
        let flow = self
            .flows
            .build(&blob.versioned_hash, blob_uri, blob.block_number)?;
        let added = self.producer.add(flow).await?;

        debug!(
            versioned_hash = %blob.versioned_hash,
            jobs_added = added.parents + added.children,
            "blob submitted for propagation"
        );
        Ok(())
    }

    /// Bulk variant of [`propagate_blob`](Self::propagate_blob): every flow is
    /// submitted in a single transaction.
    pub async fn propagate_blobs(&self, blobs: &[Blob]) -> Result<(), PropagationError> {
        self.ensure_available()?;
        if blobs.is_empty() {
            return Ok(());
        }

        let uris = try_join_all(blobs.iter().map(|blob| self.store_primary_and_stage(blob))).await?;
        let flows = blobs
            .iter()
            .zip(uris)
            .map(|(blob, uri)| self.flows.build(&blob.versioned_hash, uri, blob.block_number))
            .collect::<Result<Vec<_>, _>>()?;
        let added = self.producer.add_bulk(&flows).await?;

        debug!(
            blobs = blobs.len(),
            jobs_added = added.parents + added.children,
            "blobs submitted for propagation"
        );
        Ok(())
    }

    async fn store_primary_and_stage(&self, blob: &Blob) -> Result<String, PropagationError> {
        let data_reference = self
            .primary
            .store_blob(&blob.versioned_hash, blob.data.clone())
            .await
            .map_err(PropagationError::Primary)?;
        self.db
            .upsert_storage_reference(&StorageReference {
                blob_hash: blob.versioned_hash.clone(),
                storage: self.primary.name(),
                data_reference,
            })
            .await?;

        self.staging
            .stage(blob)
            .await
            .map_err(PropagationError::Staging)
    }

    fn ensure_available(&self) -> Result<(), PropagationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PropagationError::Unavailable("the propagator is closed"));
        }
        if self.propagators.is_empty() {
            return Err(PropagationError::Unavailable("no storage is enabled"));
        }
        Ok(())
    }

    /// Run one reconciliation pass now, outside the schedule.
    pub async fn reconcile(&self) -> Result<ReconcileResult, ReconcilerError> {
        self.reconciler.reconcile().await
    }

    /// Stop every worker, the finalizer and the reconciler, then the flow
    /// producer. Every component is closed even if another fails, and all
    /// failures are returned together. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), PropagatorCloseError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut workers = Vec::new();
        for propagator in &self.propagators {
            workers.push(close_step(
                format!("propagator:{}", propagator.storage()),
                propagator.close(),
            ));
        }
        if let Some(finalizer) = &self.finalizer {
            workers.push(close_step("finalizer", finalizer.close()));
        }
        if let Some(scheduled) = &self.scheduled {
            workers.push(close_step("reconciler trigger", scheduled.trigger.close()));
            workers.push(close_step("reconciler", scheduled.worker.close()));
        }
        let producer = vec![close_step("flow producer", self.producer.close())];

        let result = close_in_phases(vec![workers, producer]).await;
        match &result {
            Ok(()) => info!("blob propagator closed"),
            Err(e) => warn!(error = %e, "blob propagator closed with errors"),
        }
        result
    }

    pub fn propagators(&self) -> &[Propagator] {
        &self.propagators
    }

    /// Enabled storages, in flow order.
    pub fn storages(&self) -> &[StorageName] {
        self.flows.storages()
    }

    pub fn primary(&self) -> StorageName {
        self.primary.name()
    }

    pub fn high_water_mark(&self) -> &HighWaterMark {
        self.flows.high_water_mark()
    }

    pub fn queue(&self) -> &QueueStore {
        &self.queue
    }

    pub fn staging(&self) -> &StagingArea {
        &self.staging
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}
