//! Polling worker bound to a single queue.
//!
//! The worker claims jobs one at a time, runs up to `concurrency` of them
//! at once and records each outcome back in the [`QueueStore`]. It sleeps
//! until woken by a same-process submission, the next delayed job falling
//! due, or the poll interval elapsing, whichever comes first.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::job::{Job, JobState};
use super::store::QueueStore;

/// Work performed for every job of a queue. The returned value is stored
/// as the job's return value; an error counts as a failed attempt.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, job: &Job) -> anyhow::Result<serde_json::Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// How long `close` waits for in-flight jobs before aborting them.
    pub close_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_secs(1),
            close_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker for queue {0} is already closed")]
    AlreadyClosed(String),
    #[error("worker for queue {queue} did not drain within {timeout:?}")]
    DrainTimeout { queue: String, timeout: Duration },
    #[error("worker for queue {queue} crashed: {source}")]
    Join {
        queue: String,
        #[source]
        source: tokio::task::JoinError,
    },
}

#[derive(Debug)]
pub struct Worker {
    queue: String,
    shutdown_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    close_timeout: Duration,
}

impl Worker {
    /// Start processing `queue` on the current runtime.
    pub fn spawn(
        store: QueueStore,
        queue: impl Into<String>,
        processor: Arc<dyn Processor>,
        options: WorkerOptions,
    ) -> Self {
        let queue = queue.into();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(
            run(store, queue.clone(), processor, options, shutdown_rx)
                .instrument(info_span!("worker", queue = %queue)),
        );

        Self {
            queue,
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
            close_timeout: options.close_timeout,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop claiming jobs and wait for in-flight ones to finish.
    pub async fn close(&self) -> Result<(), WorkerError> {
        let handle = self
            .handle
            .lock()
            .take()
            .ok_or_else(|| WorkerError::AlreadyClosed(self.queue.clone()))?;
        let _ = self.shutdown_tx.send(true);

        let abort = handle.abort_handle();
        match tokio::time::timeout(self.close_timeout, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(WorkerError::Join {
                queue: self.queue.clone(),
                source,
            }),
            Err(_) => {
                abort.abort();
                Err(WorkerError::DrainTimeout {
                    queue: self.queue.clone(),
                    timeout: self.close_timeout,
                })
            }
        }
    }
}

async fn run(
    store: QueueStore,
    queue: String,
    processor: Arc<dyn Processor>,
    options: WorkerOptions,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    match store.recover_stalled(&queue).await {
        Ok(0) => {}
        Ok(recovered) => info!(recovered, "requeued jobs left active by a previous run"),
        Err(e) => warn!(error = %e, "failed to recover stalled jobs"),
    }

    let notify = store.notifier(&queue);
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut in_flight = JoinSet::new();
    debug!(concurrency = options.concurrency, "worker started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        while let Some(result) = in_flight.try_join_next() {
            log_join(result);
        }

        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown_rx.changed() => break,
        };

        let wait = match store.claim_next(&queue).await {
            Ok(Some(job)) => {
                in_flight.spawn(execute(store.clone(), processor.clone(), job, permit));
                continue;
            }
            Ok(None) => match store.next_due_in(&queue).await {
                Ok(Some(due)) => due.min(options.poll_interval),
                Ok(None) => options.poll_interval,
                Err(e) => {
                    warn!(error = %e, "failed to look up next due job");
                    options.poll_interval
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to claim job");
                options.poll_interval
            }
        };
        drop(permit);

        tokio::select! {
            _ = notify.notified() => {}
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown_rx.changed() => break,
        }
    }

    debug!(in_flight = in_flight.len(), "worker draining");
    while let Some(result) = in_flight.join_next().await {
        log_join(result);
    }
    debug!("worker stopped");
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "job task aborted");
    }
}

async fn execute(
    store: QueueStore,
    processor: Arc<dyn Processor>,
    job: Job,
    _permit: OwnedSemaphorePermit,
) {
    let attempt = job.attempts_made + 1;
    let span = info_span!("job", job_id = %job.id, attempt);

    async move {
        let outcome = AssertUnwindSafe(processor.process(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("processor panicked")));

        match outcome {
            Ok(value) => match store.complete(&job, &value).await {
                Ok(()) => debug!("job completed"),
                Err(e) => error!(error = %e, "failed to record job completion"),
            },
            Err(e) => {
                let reason = format!("{:#}", e);
                match store.fail(&job, &reason).await {
                    Ok(JobState::Failed) => error!(
                        error = %reason,
                        attempts = attempt,
                        "job failed permanently"
                    ),
                    Ok(_) => warn!(
                        error = %reason,
                        attempts = attempt,
                        max_attempts = job.max_attempts,
                        "job attempt failed, will retry"
                    ),
                    Err(e) => error!(error = %e, "failed to record job failure"),
                }
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::queue::flow::FlowJob;
    use crate::queue::job::{Backoff, JobOptions, NewJob};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        runs: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Processor for Counting {
        async fn process(&self, job: &Job) -> anyhow::Result<serde_json::Value> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("refusing {}", job.id);
            }
            Ok(json!(job.id))
        }
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            concurrency: 2,
            poll_interval: Duration::from_millis(20),
            close_timeout: Duration::from_secs(5),
        }
    }

    fn job(queue: &str, id: &str) -> NewJob {
        NewJob {
            id: id.to_string(),
            queue: queue.to_string(),
            name: queue.to_string(),
            data: json!({}),
            options: JobOptions {
                priority: 1,
                attempts: 3,
                backoff: Backoff::exponential(Duration::from_millis(5)),
            },
        }
    }

    async fn wait_for_state(store: &QueueStore, id: &str, state: JobState) -> Job {
        for _ in 0..200 {
            if let Some(job) = store.job(id).await.unwrap() {
                if job.state == state {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, state);
    }

    #[tokio::test]
    async fn test_worker_runs_flow_to_completion() {
        let store = QueueStore::new(Database::in_memory().await.unwrap());
        let children = Arc::new(Counting::default());
        let parents = Arc::new(Counting::default());
        let child_worker = Worker::spawn(store.clone(), "child", children.clone(), options());
        let parent_worker = Worker::spawn(store.clone(), "parent", parents.clone(), options());

        store
            .add_flows(&[FlowJob {
                parent: job("parent", "parent:1"),
                children: vec![job("child", "child:1"), job("child", "child:2")],
            }])
            .await
            .unwrap();

        let parent = wait_for_state(&store, "parent:1", JobState::Completed).await;
        assert_eq!(parent.return_value, Some(json!("parent:1")));
        assert_eq!(children.runs.load(Ordering::SeqCst), 2);
        assert_eq!(parents.runs.load(Ordering::SeqCst), 1);

        child_worker.close().await.unwrap();
        parent_worker.close().await.unwrap();
        assert!(matches!(
            child_worker.close().await,
            Err(WorkerError::AlreadyClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_exhausts_attempts() {
        let store = QueueStore::new(Database::in_memory().await.unwrap());
        let failing = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        let worker = Worker::spawn(store.clone(), "child", failing.clone(), options());

        store
            .add_flows(&[FlowJob {
                parent: job("parent", "parent:1"),
                children: vec![job("child", "child:1")],
            }])
            .await
            .unwrap();

        let failed = wait_for_state(&store, "child:1", JobState::Failed).await;
        assert_eq!(failed.attempts_made, 3);
        assert_eq!(failing.runs.load(Ordering::SeqCst), 3);
        assert_eq!(
            store.job("parent:1").await.unwrap().unwrap().state,
            JobState::WaitingChildren
        );

        worker.close().await.unwrap();
    }
}
