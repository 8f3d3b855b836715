//! Periodic sweep that resubmits flows for blobs with no storage reference.
//!
//! A cron trigger enqueues one `reconcile` job per scheduled fire time on
//! the reconciler queue. The job id is derived from the fire time, so two
//! processes sharing a database enqueue each tick once. The reconciler
//! worker then runs [`Reconciler::reconcile`].

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use common::blob::Blob;
use common::storage::{BlobStorage, StorageError};

use crate::database::{BlobRecord, Database, DatabaseError};
use crate::queue::{Backoff, FlowJob, FlowProducer, Job, JobOptions, NewJob, Processor, QueueError};
use crate::staging::StagingArea;

use super::flows::FlowBuilder;

pub const RECONCILER_QUEUE: &str = "reconciler";
pub const RECONCILE_JOB: &str = "reconcile";
pub const DEFAULT_CRON_PATTERN: &str = "0 */30 * * * *";
pub const DEFAULT_BATCH_SIZE: u32 = 200;

/// Orphans read back from source storages at once.
const RESTAGE_CONCURRENCY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ReconcilerError {
    #[error("failed to look up orphaned blobs: {0}")]
    Database(#[from] DatabaseError),
    #[error("failed to submit reconciliation flows: {0}")]
    Queue(#[from] QueueError),
    #[error("invalid cron pattern {pattern:?}: {source}")]
    InvalidSchedule {
        pattern: String,
        #[source]
        source: cron::error::Error,
    },
    #[error("reconciler trigger is already closed")]
    TriggerClosed,
    #[error("reconciler trigger crashed: {0}")]
    Trigger(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerOptions {
    /// Six or seven field cron expression, seconds first.
    pub cron_pattern: String,
    pub batch_size: u32,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            cron_pattern: DEFAULT_CRON_PATTERN.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Parse a cron pattern the way the trigger will.
pub fn parse_schedule(pattern: &str) -> Result<cron::Schedule, ReconcilerError> {
    cron::Schedule::from_str(pattern.trim()).map_err(|source| ReconcilerError::InvalidSchedule {
        pattern: pattern.to_string(),
        source,
    })
}

/// Insertion times of the first and last blob a tick resubmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobTimestamps {
    pub first_blob: OffsetDateTime,
    pub last_blob: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileResult {
    /// Number of blob flows submitted.
    pub jobs_created: usize,
    pub blob_timestamps: Option<BlobTimestamps>,
}

impl ReconcileResult {
    pub fn to_json(&self) -> serde_json::Value {
        let mut value = json!({ "jobsCreated": self.jobs_created });
        if let Some(timestamps) = &self.blob_timestamps {
            value["blobTimestamps"] = json!({
                "firstBlob": rfc3339(timestamps.first_blob),
                "lastBlob": rfc3339(timestamps.last_blob),
            });
        }
        value
    }
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

#[derive(Debug, Clone)]
pub struct Reconciler {
    db: Database,
    producer: FlowProducer,
    flows: FlowBuilder,
    staging: StagingArea,
    /// Storages an orphan's bytes are recovered from, tried in order.
    sources: Vec<Arc<dyn BlobStorage>>,
    batch_size: u32,
}

impl Reconciler {
    pub fn new(
        db: Database,
        producer: FlowProducer,
        flows: FlowBuilder,
        staging: StagingArea,
        sources: Vec<Arc<dyn BlobStorage>>,
        batch_size: u32,
    ) -> Self {
        Self {
            db,
            producer,
            flows,
            staging,
            sources,
            batch_size,
        }
    }

    /// Resubmit flows for up to `batch_size` orphaned blobs, oldest first.
    ///
    /// Each orphan is staged again from the first source storage still
    /// holding its bytes. Orphans with no recoverable copy are skipped and do
    /// not count against the batch. Flows still in progress are left alone
    /// by the queue, so running this while earlier submissions are pending
    /// is harmless.
    pub async fn reconcile(&self) -> Result<ReconcileResult, ReconcilerError> {
        let mut restaged = Vec::new();
        let mut skipped = 0usize;
        let mut offset = 0u32;

        while (restaged.len() as u32) < self.batch_size {
            let wanted = self.batch_size - restaged.len() as u32;
            let page = self.db.find_orphaned_blobs_from(offset, wanted).await?;
            let exhausted = (page.len() as u32) < wanted;
            offset += page.len() as u32;

            let outcomes: Vec<_> = stream::iter(page)
                .map(|blob| async move {
                    let recovered = self.restage(&blob).await;
                    (blob, recovered)
                })
                .buffered(RESTAGE_CONCURRENCY)
                .collect()
                .await;
            for (blob, recovered) in outcomes {
                if recovered {
                    restaged.push(blob);
                } else {
                    skipped += 1;
                }
            }

            if exhausted {
                break;
            }
        }

        let (Some(first), Some(last)) = (restaged.first(), restaged.last()) else {
            debug!(skipped, "no recoverable orphaned blobs");
            return Ok(ReconcileResult::default());
        };
        let blob_timestamps = BlobTimestamps {
            first_blob: first.inserted_at,
            last_blob: last.inserted_at,
        };

        let flows = restaged
            .iter()
            .map(|blob| {
                self.flows.build(
                    &blob.versioned_hash,
                    self.staging.uri(&blob.versioned_hash),
                    blob.block_number,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let added = self.producer.add_bulk(&flows).await?;

        info!(
            orphans = restaged.len(),
            skipped,
            parents_added = added.parents,
            children_added = added.children,
            first_blob = %rfc3339(blob_timestamps.first_blob),
            last_blob = %rfc3339(blob_timestamps.last_blob),
            "reconciliation flows submitted"
        );

        Ok(ReconcileResult {
            jobs_created: flows.len(),
            blob_timestamps: Some(blob_timestamps),
        })
    }

    /// Make sure a staged copy of `blob` exists, copying it back from a
    /// source storage if needed. Returns `false` when no copy was found.
    async fn restage(&self, blob: &BlobRecord) -> bool {
        let hash = &blob.versioned_hash;
        match self.staging.contains(hash).await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => warn!(versioned_hash = %hash, error = %e, "failed to check staging area"),
        }

        for source in &self.sources {
            let Some(uri) = source.blob_uri(hash) else {
                continue;
            };
            let data = match source.get_blob(&uri).await {
                Ok(data) => data,
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => {
                    warn!(versioned_hash = %hash, storage = %source.name(), error = %e, "failed to read orphan");
                    continue;
                }
            };
            return match self.staging.stage(&Blob::new(hash.clone(), data)).await {
                Ok(_) => {
                    debug!(versioned_hash = %hash, storage = %source.name(), "orphan restaged");
                    true
                }
                Err(e) => {
                    warn!(versioned_hash = %hash, error = %e, "failed to restage orphan");
                    false
                }
            };
        }

        warn!(versioned_hash = %hash, "orphaned blob has no recoverable copy, skipping");
        false
    }
}

#[async_trait]
impl Processor for Reconciler {
    async fn process(&self, _job: &Job) -> anyhow::Result<serde_json::Value> {
        let result = self.reconcile().await?;
        Ok(result.to_json())
    }
}

/// Job id of the tick scheduled at `fire_at`.
pub fn tick_job_id(fire_at: DateTime<Utc>) -> String {
    format!("{}:{}", RECONCILER_QUEUE, fire_at.timestamp())
}

/// A single attempt per tick; a failed tick is retried by the next one.
fn tick_job(fire_at: DateTime<Utc>) -> Result<FlowJob, QueueError> {
    let options = JobOptions {
        priority: 1,
        attempts: 1,
        backoff: Backoff::exponential(Duration::ZERO),
    };
    let parent = NewJob::new(
        tick_job_id(fire_at),
        RECONCILER_QUEUE,
        RECONCILE_JOB,
        &json!({ "scheduledAt": fire_at.to_rfc3339() }),
        options,
    )?;
    Ok(FlowJob {
        parent,
        children: Vec::new(),
    })
}

/// Recurring trigger enqueuing reconcile jobs on a cron schedule.
#[derive(Debug)]
pub struct CronTrigger {
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CronTrigger {
    pub fn spawn(schedule: cron::Schedule, producer: FlowProducer) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(
            run_trigger(schedule, producer, shutdown_rx)
                .instrument(info_span!("reconciler_trigger")),
        );
        Self {
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub async fn close(&self) -> Result<(), ReconcilerError> {
        let handle = self
            .handle
            .lock()
            .take()
            .ok_or(ReconcilerError::TriggerClosed)?;
        let _ = self.shutdown_tx.send(true);
        handle.await?;
        Ok(())
    }
}

async fn run_trigger(
    schedule: cron::Schedule,
    producer: FlowProducer,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        let Some(fire_at) = schedule.upcoming(Utc).next() else {
            warn!("cron schedule has no upcoming fire time, trigger stopped");
            break;
        };
        let wait = (fire_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(next_tick = %fire_at, "reconciler tick scheduled");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown_rx.changed() => break,
        }

        let submitted = match tick_job(fire_at) {
            Ok(flow) => producer.add(flow).await,
            Err(e) => Err(e),
        };
        match submitted {
            Ok(added) if added.is_empty() => {
                debug!(tick = %fire_at, "tick already enqueued by another process")
            }
            Ok(_) => debug!(tick = %fire_at, "reconciler tick enqueued"),
            Err(QueueError::Closed) => break,
            Err(e) => warn!(error = %e, "failed to enqueue reconciler tick"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_default_pattern_fires_every_half_hour() {
        let schedule = parse_schedule(DEFAULT_CRON_PATTERN).unwrap();
        let start = Utc.with_ymd_and_hms(2024, 3, 13, 10, 5, 0).unwrap();
        let fires: Vec<_> = schedule.after(&start).take(3).collect();
        assert_eq!(fires[0], Utc.with_ymd_and_hms(2024, 3, 13, 10, 30, 0).unwrap());
        assert_eq!(fires[1], Utc.with_ymd_and_hms(2024, 3, 13, 11, 0, 0).unwrap());
        assert_eq!(fires[2], Utc.with_ymd_and_hms(2024, 3, 13, 11, 30, 0).unwrap());
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(matches!(
            parse_schedule("every half hour"),
            Err(ReconcilerError::InvalidSchedule { .. })
        ));
    }

    #[test]
    fn test_tick_ids_follow_fire_time() {
        let at = Utc.with_ymd_and_hms(2024, 3, 13, 10, 30, 0).unwrap();
        assert_eq!(tick_job_id(at), format!("reconciler:{}", at.timestamp()));
        let flow = tick_job(at).unwrap();
        assert!(flow.children.is_empty());
        assert_eq!(flow.parent.options.attempts, 1);
    }

    #[test]
    fn test_result_json() {
        assert_eq!(
            ReconcileResult::default().to_json(),
            json!({ "jobsCreated": 0 })
        );

        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let result = ReconcileResult {
            jobs_created: 2,
            blob_timestamps: Some(BlobTimestamps {
                first_blob: at,
                last_blob: at,
            }),
        };
        let value = result.to_json();
        assert_eq!(value["jobsCreated"], 2);
        assert_eq!(value["blobTimestamps"]["firstBlob"], "2023-11-14T22:13:20Z");
    }
}
