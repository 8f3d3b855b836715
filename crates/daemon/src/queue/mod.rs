//! Durable job queue with parent/child flows, stored in the engine database.
//!
//! Job ids are caller-chosen and act as deduplication keys: at most one live
//! job exists per id. A flow parent stays in `waiting_children` until all
//! of its children complete, and a child that exhausts its attempts keeps
//! the parent blocked for good.

mod flow;
mod job;
mod store;
mod worker;

pub use flow::{FlowJob, FlowProducer};
pub use job::{Backoff, Job, JobOptions, JobState, NewJob, UnknownJobState};
pub use store::{FlowsAdded, JobCounts, QueueStore};
pub use worker::{Processor, Worker, WorkerError, WorkerOptions};

use crate::database::DatabaseError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Sqlite(#[from] sqlx::Error),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("job {0} is not active")]
    NotActive(String),
    #[error("flow producer is closed")]
    Closed,
}
