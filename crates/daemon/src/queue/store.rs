//! SQLite persistence for jobs and flows.
//!
//! Every state transition is a single guarded `UPDATE` (or a short write
//! transaction), so several workers and several processes can share the
//! same table without extra locking.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::Row;
use tokio::sync::Notify;
use tracing::debug;

use crate::database::{now_millis, Database};

use super::flow::FlowJob;
use super::job::{Job, JobState, NewJob};
use super::QueueError;

// Reinserts the row when its previous incarnation is terminal, leaves live
// rows alone. `rows_affected` tells the two apart.
const UPSERT_IF_TERMINAL: &str = r#"
    INSERT INTO jobs (
        id, queue, name, parent_id, data, priority, max_attempts,
        attempts_made, backoff_delay_ms, state, run_at, created_at
    )
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?10)
    ON CONFLICT(id) DO UPDATE SET
        queue = excluded.queue,
        name = excluded.name,
        parent_id = excluded.parent_id,
        data = excluded.data,
        priority = excluded.priority,
        max_attempts = excluded.max_attempts,
        attempts_made = 0,
        backoff_delay_ms = excluded.backoff_delay_ms,
        state = excluded.state,
        run_at = excluded.run_at,
        created_at = excluded.created_at,
        finished_at = NULL,
        failed_reason = NULL,
        return_value = NULL
    WHERE jobs.state IN ('completed', 'failed')
"#;

// Same as above but only a failed row is revived. Used for children of a
// parent that is still live, whose completed work must be kept.
const UPSERT_IF_FAILED: &str = r#"
    INSERT INTO jobs (
        id, queue, name, parent_id, data, priority, max_attempts,
        attempts_made, backoff_delay_ms, state, run_at, created_at
    )
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, ?10, ?10)
    ON CONFLICT(id) DO UPDATE SET
        queue = excluded.queue,
        name = excluded.name,
        parent_id = excluded.parent_id,
        data = excluded.data,
        priority = excluded.priority,
        max_attempts = excluded.max_attempts,
        attempts_made = 0,
        backoff_delay_ms = excluded.backoff_delay_ms,
        state = excluded.state,
        run_at = excluded.run_at,
        created_at = excluded.created_at,
        finished_at = NULL,
        failed_reason = NULL,
        return_value = NULL
    WHERE jobs.state = 'failed'
"#;

/// Number of job rows actually written by a submission. Rows that were
/// already live are skipped and not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowsAdded {
    pub parents: usize,
    pub children: usize,
}

impl FlowsAdded {
    pub fn is_empty(&self) -> bool {
        self.parents == 0 && self.children == 0
    }
}

/// Per-state job counts for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobCounts {
    counts: BTreeMap<JobState, i64>,
}

impl JobCounts {
    pub fn get(&self, state: JobState) -> i64 {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.counts.values().sum()
    }
}

#[derive(Debug, Clone)]
pub struct QueueStore {
    db: Database,
    notifiers: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl QueueStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            notifiers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Wakes workers of `queue` in this process when new work is submitted
    /// or a flow parent is released.
    pub fn notifier(&self, queue: &str) -> Arc<Notify> {
        self.notifiers
            .lock()
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn notify(&self, queue: &str) {
        if let Some(notify) = self.notifiers.lock().get(queue) {
            notify.notify_one();
        }
    }

    /// Submit a batch of flows in one transaction.
    ///
    /// A live parent is left untouched, so resubmitting a flow that is still
    /// in progress is a no-op. A parent whose previous run is terminal (or
    /// that never existed) is (re)created, and all of its children with it.
    pub async fn add_flows(&self, flows: &[FlowJob]) -> Result<FlowsAdded, QueueError> {
        let now = now_millis();
        let mut added = FlowsAdded::default();
        let mut touched = BTreeSet::new();

        let mut tx = self.db.begin().await?;
        for flow in flows {
            let parent_state = if flow.children.is_empty() {
                JobState::Waiting
            } else {
                JobState::WaitingChildren
            };
            let parent_written = insert_job(
                &mut tx,
                UPSERT_IF_TERMINAL,
                &flow.parent,
                None,
                parent_state,
                now,
            )
            .await?;
            if parent_written {
                added.parents += 1;
                if parent_state == JobState::Waiting {
                    touched.insert(flow.parent.queue.clone());
                }
            }

            let child_sql = if parent_written {
                UPSERT_IF_TERMINAL
            } else {
                UPSERT_IF_FAILED
            };
            for child in &flow.children {
                let child_written = insert_job(
                    &mut tx,
                    child_sql,
                    child,
                    Some(&flow.parent.id),
                    JobState::Waiting,
                    now,
                )
                .await?;
                if child_written {
                    added.children += 1;
                    touched.insert(child.queue.clone());
                }
            }
        }
        tx.commit().await?;

        for queue in touched {
            self.notify(&queue);
        }
        Ok(added)
    }

    /// Move the most urgent runnable job of `queue` to `active`.
    pub async fn claim_next(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query(
            r#"
            UPDATE jobs SET state = 'active'
            WHERE state IN ('waiting', 'delayed')
              AND id = (
                SELECT id FROM jobs
                WHERE queue = ?1
                  AND state IN ('waiting', 'delayed')
                  AND run_at <= ?2
                ORDER BY priority ASC, run_at ASC, created_at ASC, id ASC
                LIMIT 1
              )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(now_millis())
        .fetch_optional(&*self.db)
        .await?;

        row.as_ref().map(Job::from_row).transpose()
    }

    /// Time until the next waiting or delayed job of `queue` becomes
    /// runnable. `Some(ZERO)` means one is runnable now.
    pub async fn next_due_in(&self, queue: &str) -> Result<Option<Duration>, QueueError> {
        let row = sqlx::query(
            r#"
            SELECT MIN(run_at) as run_at FROM jobs
            WHERE queue = ?1 AND state IN ('waiting', 'delayed')
            "#,
        )
        .bind(queue)
        .fetch_one(&*self.db)
        .await?;

        let run_at: Option<i64> = row.try_get("run_at")?;
        Ok(run_at.map(|run_at| {
            let wait = (run_at - now_millis()).max(0);
            Duration::from_millis(wait as u64)
        }))
    }

    /// Mark an active job completed and release its flow parent once every
    /// sibling has completed.
    pub async fn complete(
        &self,
        job: &Job,
        return_value: &serde_json::Value,
    ) -> Result<(), QueueError> {
        let now = now_millis();
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed',
                attempts_made = attempts_made + 1,
                finished_at = ?2,
                return_value = ?3
            WHERE id = ?1 AND state = 'active'
            "#,
        )
        .bind(&job.id)
        .bind(now)
        .bind(serde_json::to_string(return_value)?)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotActive(job.id.clone()));
        }

        let mut released = None;
        if let Some(parent_id) = &job.parent_id {
            let row = sqlx::query(
                r#"
                UPDATE jobs SET state = 'waiting', run_at = ?2
                WHERE id = ?1
                  AND state = 'waiting_children'
                  AND NOT EXISTS (
                    SELECT 1 FROM jobs
                    WHERE parent_id = ?1 AND state != 'completed'
                  )
                RETURNING queue
                "#,
            )
            .bind(parent_id)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = row {
                let queue: String = row.try_get("queue")?;
                debug!(job_id = %parent_id, queue = %queue, "flow parent released");
                released = Some(queue);
            }
        }
        tx.commit().await?;

        if let Some(queue) = released {
            self.notify(&queue);
        }
        Ok(())
    }

    /// Record a failed attempt. Returns the state the job moved to:
    /// `Delayed` when attempts remain, `Failed` otherwise.
    pub async fn fail(&self, job: &Job, reason: &str) -> Result<JobState, QueueError> {
        let now = now_millis();
        let attempts_made = job.attempts_made + 1;

        let (state, run_at, finished_at) = if attempts_made < job.max_attempts {
            let delay = job.backoff.delay(attempts_made);
            (JobState::Delayed, now + delay.as_millis() as i64, None)
        } else {
            (JobState::Failed, now, Some(now))
        };

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = ?2,
                attempts_made = ?3,
                run_at = ?4,
                finished_at = ?5,
                failed_reason = ?6
            WHERE id = ?1 AND state = 'active'
            "#,
        )
        .bind(&job.id)
        .bind(state)
        .bind(attempts_made as i64)
        .bind(run_at)
        .bind(finished_at)
        .bind(reason)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotActive(job.id.clone()));
        }

        Ok(state)
    }

    /// Put jobs left `active` by a dead process back in line.
    pub async fn recover_stalled(&self, queue: &str) -> Result<u64, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'waiting', run_at = ?2
            WHERE queue = ?1 AND state = 'active'
            "#,
        )
        .bind(queue)
        .bind(now_millis())
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?;
        row.as_ref().map(Job::from_row).transpose()
    }

    /// Children of a flow parent, ordered by id.
    pub async fn children(&self, parent_id: &str) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE parent_id = ?1 ORDER BY id ASC")
            .bind(parent_id)
            .fetch_all(&*self.db)
            .await?;
        rows.iter().map(Job::from_row).collect()
    }

    /// Jobs of `queue` currently in `state`, ordered by id.
    pub async fn jobs_in_state(&self, queue: &str, state: JobState) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE queue = ?1 AND state = ?2 ORDER BY id ASC")
            .bind(queue)
            .bind(state)
            .fetch_all(&*self.db)
            .await?;
        rows.iter().map(Job::from_row).collect()
    }

    /// Job counts per queue and state.
    pub async fn counts(&self) -> Result<BTreeMap<String, JobCounts>, QueueError> {
        let rows = sqlx::query(
            r#"
            SELECT queue, state, COUNT(*) as count
            FROM jobs
            GROUP BY queue, state
            "#,
        )
        .fetch_all(&*self.db)
        .await?;

        let mut counts: BTreeMap<String, JobCounts> = BTreeMap::new();
        for row in rows {
            let queue: String = row.try_get("queue")?;
            let state: JobState = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            counts.entry(queue).or_default().counts.insert(state, count);
        }
        Ok(counts)
    }
}

async fn insert_job(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    sql: &str,
    job: &NewJob,
    parent_id: Option<&str>,
    state: JobState,
    now: i64,
) -> Result<bool, QueueError> {
    let result = sqlx::query(sql)
        .bind(&job.id)
        .bind(&job.queue)
        .bind(&job.name)
        .bind(parent_id)
        .bind(serde_json::to_string(&job.data)?)
        .bind(job.options.priority as i64)
        .bind(job.options.attempts.max(1) as i64)
        .bind(job.options.backoff.base_delay.as_millis() as i64)
        .bind(state)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::{Backoff, JobOptions};
    use serde_json::json;

    fn options() -> JobOptions {
        JobOptions {
            priority: 1,
            attempts: 2,
            backoff: Backoff::exponential(Duration::ZERO),
        }
    }

    fn flow(hash: &str, queues: &[&str]) -> FlowJob {
        let job = |queue: &str| NewJob {
            id: format!("{}:{}", queue, hash),
            queue: queue.to_string(),
            name: queue.to_string(),
            data: json!({ "hash": hash }),
            options: options(),
        };
        FlowJob {
            parent: job("finalizer"),
            children: queues.iter().map(|q| job(q)).collect(),
        }
    }

    async fn store() -> QueueStore {
        QueueStore::new(Database::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn test_flow_parent_waits_for_children() {
        let store = store().await;
        let added = store.add_flows(&[flow("h1", &["a", "b"])]).await.unwrap();
        assert_eq!(added, FlowsAdded { parents: 1, children: 2 });

        let parent = store.job("finalizer:h1").await.unwrap().unwrap();
        assert_eq!(parent.state, JobState::WaitingChildren);
        assert!(store.claim_next("finalizer").await.unwrap().is_none());

        let a = store.claim_next("a").await.unwrap().unwrap();
        assert_eq!(a.parent_id.as_deref(), Some("finalizer:h1"));
        store.complete(&a, &json!("ref-a")).await.unwrap();
        assert!(store.claim_next("finalizer").await.unwrap().is_none());

        let b = store.claim_next("b").await.unwrap().unwrap();
        store.complete(&b, &json!("ref-b")).await.unwrap();

        let parent = store.claim_next("finalizer").await.unwrap().unwrap();
        assert_eq!(parent.id, "finalizer:h1");

        let a = store.job("a:h1").await.unwrap().unwrap();
        assert_eq!(a.return_value, Some(json!("ref-a")));
    }

    #[tokio::test]
    async fn test_resubmitting_live_flow_is_noop() {
        let store = store().await;
        store.add_flows(&[flow("h1", &["a"])]).await.unwrap();
        let again = store.add_flows(&[flow("h1", &["a"])]).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(store.counts().await.unwrap()["a"].total(), 1);
    }

    #[tokio::test]
    async fn test_fail_retries_then_fails() {
        let store = store().await;
        store.add_flows(&[flow("h1", &["a"])]).await.unwrap();

        let job = store.claim_next("a").await.unwrap().unwrap();
        assert_eq!(store.fail(&job, "boom").await.unwrap(), JobState::Delayed);

        let job = store.claim_next("a").await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 1);
        assert_eq!(store.fail(&job, "boom").await.unwrap(), JobState::Failed);

        let job = store.job("a:h1").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts_made, 2);
        assert_eq!(job.failed_reason.as_deref(), Some("boom"));
        assert!(store.claim_next("a").await.unwrap().is_none());

        // parent stays blocked behind the failed child
        let parent = store.job("finalizer:h1").await.unwrap().unwrap();
        assert_eq!(parent.state, JobState::WaitingChildren);
    }

    #[tokio::test]
    async fn test_resubmission_revives_failed_child_only() {
        let store = store().await;
        store.add_flows(&[flow("h1", &["a", "b"])]).await.unwrap();

        let a = store.claim_next("a").await.unwrap().unwrap();
        store.complete(&a, &json!(null)).await.unwrap();
        for _ in 0..2 {
            let b = store.claim_next("b").await.unwrap().unwrap();
            store.fail(&b, "down").await.unwrap();
        }

        let added = store.add_flows(&[flow("h1", &["a", "b"])]).await.unwrap();
        assert_eq!(added, FlowsAdded { parents: 0, children: 1 });
        assert_eq!(store.job("a:h1").await.unwrap().unwrap().state, JobState::Completed);
        assert_eq!(store.job("b:h1").await.unwrap().unwrap().state, JobState::Waiting);

        let b = store.claim_next("b").await.unwrap().unwrap();
        store.complete(&b, &json!(null)).await.unwrap();
        assert!(store.claim_next("finalizer").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_claim_orders_by_priority() {
        let store = store().await;
        let mut low = flow("low", &["a"]);
        low.children[0].options.priority = 50;
        let mut high = flow("high", &["a"]);
        high.children[0].options.priority = 2;
        store.add_flows(&[low, high]).await.unwrap();

        assert_eq!(store.claim_next("a").await.unwrap().unwrap().id, "a:high");
        assert_eq!(store.claim_next("a").await.unwrap().unwrap().id, "a:low");
    }

    #[tokio::test]
    async fn test_recover_stalled() {
        let store = store().await;
        store.add_flows(&[flow("h1", &["a"])]).await.unwrap();
        let job = store.claim_next("a").await.unwrap().unwrap();
        assert!(store.claim_next("a").await.unwrap().is_none());

        assert_eq!(store.recover_stalled("a").await.unwrap(), 1);
        let again = store.claim_next("a").await.unwrap().unwrap();
        assert_eq!(again.id, job.id);

        // completing twice is rejected
        store.complete(&again, &json!(null)).await.unwrap();
        assert!(matches!(
            store.complete(&again, &json!(null)).await,
            Err(QueueError::NotActive(_))
        ));
    }

    #[tokio::test]
    async fn test_counts_and_children() {
        let store = store().await;
        store
            .add_flows(&[flow("h1", &["a", "b"]), flow("h2", &["a", "b"])])
            .await
            .unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts["a"].get(JobState::Waiting), 2);
        assert_eq!(counts["finalizer"].get(JobState::WaitingChildren), 2);

        let children = store.children("finalizer:h2").await.unwrap();
        let ids: Vec<_> = children.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["a:h2", "b:h2"]);
        assert_eq!(store.next_due_in("a").await.unwrap(), Some(Duration::ZERO));
        assert_eq!(store.next_due_in("nothing").await.unwrap(), None);
    }
}
