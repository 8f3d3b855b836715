use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::job::NewJob;
use super::store::{FlowsAdded, QueueStore};
use super::QueueError;

/// A parent job gated on a set of children. The parent runs only after
/// every child has completed.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowJob {
    pub parent: NewJob,
    pub children: Vec<NewJob>,
}

/// Submission side of the queue. Cloning shares the open/closed state.
#[derive(Debug, Clone)]
pub struct FlowProducer {
    store: QueueStore,
    closed: Arc<AtomicBool>,
}

impl FlowProducer {
    pub fn new(store: QueueStore) -> Self {
        Self {
            store,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn add(&self, flow: FlowJob) -> Result<FlowsAdded, QueueError> {
        self.add_bulk(std::slice::from_ref(&flow)).await
    }

    /// Submit all flows atomically.
    pub async fn add_bulk(&self, flows: &[FlowJob]) -> Result<FlowsAdded, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        if flows.is_empty() {
            return Ok(FlowsAdded::default());
        }

        let added = self.store.add_flows(flows).await?;
        debug!(
            flows = flows.len(),
            parents = added.parents,
            children = added.children,
            "flows submitted"
        );
        Ok(added)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop accepting submissions. Closing twice is an error so a double
    /// shutdown is visible.
    pub async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        debug!("flow producer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::queue::job::JobOptions;
    use serde_json::json;

    #[tokio::test]
    async fn test_closed_producer_rejects_flows() {
        let store = QueueStore::new(Database::in_memory().await.unwrap());
        let producer = FlowProducer::new(store.clone());

        let parent = NewJob::new("p:1", "p", "p", &json!({}), JobOptions::default()).unwrap();
        let flow = FlowJob {
            parent,
            children: vec![],
        };
        let added = producer.add(flow.clone()).await.unwrap();
        assert_eq!(added.parents, 1);
        // a childless parent is runnable right away
        assert!(store.claim_next("p").await.unwrap().is_some());

        producer.close().await.unwrap();
        assert!(matches!(producer.add(flow).await, Err(QueueError::Closed)));
        assert!(matches!(producer.close().await, Err(QueueError::Closed)));
    }
}
