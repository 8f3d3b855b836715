use std::fmt;
use std::future::Future;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;

use common::storage::{StorageError, StorageName};

use crate::database::DatabaseError;
use crate::queue::QueueError;

use super::reconciler::ReconcilerError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum CreationError {
    #[error("no usable storage: every configured storage is unsupported or unhealthy")]
    NoStorages,
    #[error("primary storage {0} is not configured or not supported by this build")]
    PrimaryNotConfigured(StorageName),
    #[error("primary storage {storage} is unhealthy: {source}")]
    PrimaryUnhealthy {
        storage: StorageName,
        #[source]
        source: StorageError,
    },
    #[error("failed to set up the reconciler: {0}")]
    Reconciler(#[from] ReconcilerError),
}

#[derive(Debug, thiserror::Error)]
pub enum PropagationError {
    #[error("blob propagator unavailable: {0}")]
    Unavailable(&'static str),
    #[error("failed to write blob to primary storage: {0}")]
    Primary(#[source] StorageError),
    #[error("failed to stage blob: {0}")]
    Staging(#[source] StorageError),
    #[error(transparent)]
    Database(#[from] DatabaseError),
    #[error("failed to submit propagation flow: {0}")]
    Queue(#[from] QueueError),
}

/// One component that failed to shut down.
#[derive(Debug)]
pub struct CloseFailure {
    pub component: String,
    pub cause: BoxError,
}

/// Every failure hit while closing the engine, in close order.
#[derive(Debug)]
pub struct PropagatorCloseError {
    failures: Vec<CloseFailure>,
}

impl PropagatorCloseError {
    pub fn failures(&self) -> &[CloseFailure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<CloseFailure> {
        self.failures
    }
}

impl fmt::Display for PropagatorCloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to close {} component(s)",
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.component, failure.cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for PropagatorCloseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|failure| failure.cause.as_ref() as &(dyn std::error::Error + 'static))
    }
}

pub(crate) type CloseStep<'a> = BoxFuture<'a, Result<(), CloseFailure>>;

pub(crate) fn close_step<'a, F, E>(component: impl Into<String>, close: F) -> CloseStep<'a>
where
    F: Future<Output = Result<(), E>> + Send + 'a,
    E: std::error::Error + Send + Sync + 'static,
{
    let component = component.into();
    async move {
        close.await.map_err(|e| CloseFailure {
            component,
            cause: Box::new(e),
        })
    }
    .boxed()
}

/// Run close steps phase by phase. Steps within a phase run concurrently,
/// and a failure never stops the remaining steps or later phases.
pub(crate) async fn close_in_phases(phases: Vec<Vec<CloseStep<'_>>>) -> Result<(), PropagatorCloseError> {
    let mut failures = Vec::new();
    for phase in phases {
        failures.extend(join_all(phase).await.into_iter().filter_map(Result::err));
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(PropagatorCloseError { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("{0} refused to stop")]
    struct Stuck(&'static str);

    #[tokio::test]
    async fn test_every_failure_is_kept() {
        let producer_closed = AtomicBool::new(false);

        let result = close_in_phases(vec![
            vec![
                close_step("propagator:s3", async { Err(Stuck("s3")) }),
                close_step("propagator:sqlite", async { Ok::<(), Stuck>(()) }),
                close_step("propagator:swarm", async { Err(Stuck("swarm")) }),
                close_step("finalizer", async { Ok::<(), Stuck>(()) }),
            ],
            vec![close_step("flow producer", async {
                producer_closed.store(true, Ordering::SeqCst);
                Ok::<(), Stuck>(())
            })],
        ])
        .await;

        let err = result.unwrap_err();
        assert!(producer_closed.load(Ordering::SeqCst));

        let components: Vec<_> = err.failures().iter().map(|f| f.component.as_str()).collect();
        assert_eq!(components, vec!["propagator:s3", "propagator:swarm"]);
        assert_eq!(err.failures()[1].cause.to_string(), "swarm refused to stop");
        assert!(err.failures()[0].cause.downcast_ref::<Stuck>().is_some());
        assert_eq!(err.source().unwrap().to_string(), "s3 refused to stop");
        assert!(err.to_string().contains("failed to close 2 component(s)"));
    }

    #[tokio::test]
    async fn test_clean_close() {
        let result = close_in_phases(vec![vec![close_step("finalizer", async {
            Ok::<(), Stuck>(())
        })]])
        .await;
        assert!(result.is_ok());
    }
}
