//! Priority task queue over a transactional ordered key-value store.
//!
//! Pending tasks sit in an ordered index keyed by `(priority, ready_ts,
//! sequence, task_id)`, so the first claimable entry of an ascending range
//! scan is always the next task to hand out. A claim moves the entry into a
//! lease partition ordered by expiry; ack retires it, nack and lease expiry
//! put it back under a fresh key or dead-letter it. Each of these moves is
//! one store transaction. Correctness under concurrency comes entirely from
//! the store's serializable commit: a losing transaction is retried here, a
//! bounded number of times.
//!
//! The operations are split by concern:
//! - `claim`: dequeue and filtered dequeue
//! - `ack`: ack, nack, lease extension
//! - `monitor`: visibility-timeout sweep
//! - `stats`: counters

mod ack;
mod claim;
pub mod clock;
pub mod filter;
pub mod keys;
mod monitor;
mod stats;
mod store;

pub use clock::Clock;
pub use filter::TaskFilter;
pub use keys::{LeaseKey, QueueKey};

use std::future::Future;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{debug, info};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::kv::{KvStore, KvTxn};
use crate::model::{NewTask, Task, TaskId, TaskState};
use crate::telemetry::metrics;

use store::TaskStore;

const PURGE_BATCH: usize = 256;

/// A named queue bound to a store.
///
/// Cheap to clone when the store is; every handle sees the same queue.
#[derive(Debug, Clone)]
pub struct TaskQueue<S: KvStore> {
    store: S,
    config: QueueConfig,
    clock: Clock,
}

impl<S: KvStore> TaskQueue<S> {
    pub fn new(store: S, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            clock: Clock::System,
        })
    }

    /// Replace the time source. Tests use [`Clock::manual`].
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// A handle on another queue sharing this store and clock.
    pub fn sibling(&self, config: QueueConfig) -> Result<Self> {
        Ok(Self::new(self.store.clone(), config)?.with_clock(self.clock.clone()))
    }

    // -----------------------------------------------------------------------
    // Enqueue
    // -----------------------------------------------------------------------

    /// Add a task that is claimable immediately. Returns its fresh id.
    pub async fn enqueue(
        &self,
        priority: i64,
        payload: impl Into<Vec<u8>>,
        metadata: Option<serde_json::Value>,
    ) -> Result<TaskId> {
        let mut new = NewTask::new(priority, payload);
        new.metadata = metadata;
        Ok(self.submit(new).await?.id)
    }

    /// Add a task built with [`NewTask`], honoring its delay and id.
    ///
    /// A caller-chosen id must be non-empty and not already in the queue.
    pub async fn submit(&self, new: NewTask) -> Result<Task> {
        let started = Instant::now();
        let id = new.id.clone().unwrap_or_default();
        if id.as_str().is_empty() {
            return Err(Error::InvalidTaskId("task id must not be empty".to_string()));
        }
        let task = self
            .retry_conflicts("enqueue", || self.try_submit(&new, &id))
            .await?;

        debug!(
            queue = %self.name(),
            task_id = %task.id,
            priority = task.priority,
            ready_at = task.ready_at,
            sequence = task.sequence,
            "task enqueued"
        );
        self.record_operation("enqueue", started);
        Ok(task)
    }

    async fn try_submit(&self, new: &NewTask, id: &TaskId) -> Result<Task> {
        let now = self.clock.now_ms();
        let mut txn = self.store.begin().await?;
        let mut tasks = TaskStore::new(&mut txn, self.name());

        if tasks.get_by_task_id(id).await?.is_some() {
            return Err(Error::AlreadyExists(id.clone()));
        }

        let task = tasks
            .insert_pending(Task {
                id: id.clone(),
                queue: self.config.name.clone(),
                priority: new.priority,
                payload: new.payload.clone(),
                state: TaskState::Pending,
                ready_at: now.saturating_add(new.delay_ms),
                sequence: 0,
                retries: 0,
                enqueued_at: now,
                claimed_at: None,
                claimed_by: None,
                lease_expires_at: None,
                completed_at: None,
                dead_lettered_at: None,
                metadata: new.metadata.clone(),
            })
            .await?;

        txn.commit().await?;
        Ok(task)
    }

    // -----------------------------------------------------------------------
    // Lookup and retention
    // -----------------------------------------------------------------------

    /// Current record for `id`, in any state, or `None` if unknown or purged.
    pub async fn get(&self, id: &TaskId) -> Result<Option<Task>> {
        let mut txn = self.store.begin().await?;
        let found = TaskStore::new(&mut txn, self.name())
            .get_by_task_id(id)
            .await?;
        txn.rollback().await?;
        Ok(found.map(|stored| stored.task))
    }

    /// Delete every completed and dead-lettered record. Returns how many.
    ///
    /// Live tasks are untouched. Counters are cumulative and keep their
    /// values; their stored history is compacted.
    pub async fn purge(&self) -> Result<usize> {
        let started = Instant::now();
        let (mut cursor, end) = keys::task_range(self.name());
        let mut purged = 0;

        loop {
            let (removed, resume) = self
                .retry_conflicts("purge", || self.purge_batch(&cursor, &end))
                .await?;
            purged += removed;
            match resume {
                Some(next) => cursor = next,
                None => break,
            }
        }

        let (start, end) = keys::counter_range(self.name());
        let compacted = self.store.compact_counters(&start, &end).await?;

        if purged > 0 {
            info!(queue = %self.name(), purged, compacted, "purged retired tasks");
        }
        self.record_operation("purge", started);
        Ok(purged)
    }

    async fn purge_batch(&self, start: &[u8], end: &[u8]) -> Result<(usize, Option<Vec<u8>>)> {
        let mut txn = self.store.begin().await?;
        let result = TaskStore::new(&mut txn, self.name())
            .purge_retired(start, end, PURGE_BATCH)
            .await?;
        txn.commit().await?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Shared plumbing
    // -----------------------------------------------------------------------

    /// Run `attempt` until it succeeds, fails with something other than a
    /// conflict, or has lost `claim_retry_limit` times. The last conflict is
    /// returned as is.
    async fn retry_conflicts<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let limit = self.config.claim_retry_limit.max(1);
        let mut tries = 0u32;
        loop {
            tries += 1;
            match attempt().await {
                Err(e) if e.is_conflict() && tries < limit => {
                    metrics::claim_conflicts().add(
                        1,
                        &[
                            KeyValue::new("queue", self.config.name.clone()),
                            KeyValue::new("operation", operation),
                        ],
                    );
                    debug!(queue = %self.name(), operation, attempt = tries, "transaction conflict, retrying");
                    tokio::time::sleep(Duration::from_millis(u64::from(tries.min(8)))).await;
                }
                other => return other,
            }
        }
    }

    fn record_operation(&self, operation: &'static str, started: Instant) {
        let labels = [
            KeyValue::new("queue", self.config.name.clone()),
            KeyValue::new("operation", operation),
        ];
        metrics::queue_operations().add(1, &labels);
        metrics::operation_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &labels);
    }

    fn record_transition(&self, from: TaskState, to: TaskState) {
        metrics::task_state_transitions().add(
            1,
            &[
                KeyValue::new("queue", self.config.name.clone()),
                KeyValue::new("from", from.to_string()),
                KeyValue::new("to", to.to_string()),
            ],
        );
    }
}

/// Fail unless the task is currently claimed.
fn require_claimed(task: &Task) -> Result<()> {
    if task.state != TaskState::Claimed {
        return Err(Error::InvalidState {
            id: task.id.clone(),
            state: task.state,
        });
    }
    Ok(())
}

/// Ordered-index key of a claimed task, or a corruption error.
fn live_key(id: &TaskId, key: Option<Vec<u8>>) -> Result<Vec<u8>> {
    key.ok_or_else(|| Error::MalformedRecord(format!("live task {id} has no ordered-index entry")))
}
