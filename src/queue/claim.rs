//! Claiming: find the first ready, admissible pending entry and lease it.

use std::time::Instant;

use tracing::{debug, warn};

use super::keys::{self, LeaseKey, QueueKey};
use super::stats::Counter;
use super::store::{TaskStore, decode_task};
use super::{TaskFilter, TaskQueue};
use crate::error::{Error, Result};
use crate::kv::{KvStore, KvTxn, key_successor};
use crate::model::{Task, TaskState};

/// Pending entries fetched per scan round trip.
const SCAN_BATCH: usize = 64;

impl<S: KvStore> TaskQueue<S> {
    /// Claim the most urgent ready task, if any.
    ///
    /// The task moves to `Claimed` with a lease of `visibility_timeout_ms`;
    /// if it is neither acked nor nacked before the lease runs out, a sweep
    /// releases it again.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<Task>> {
        self.dequeue_matching(worker_id, &TaskFilter::AllowAll).await
    }

    /// Like [`dequeue`](Self::dequeue), skipping tasks `filter` rejects.
    ///
    /// Rejected tasks keep their position and stay available to other callers.
    pub async fn dequeue_matching(&self, worker_id: &str, filter: &TaskFilter) -> Result<Option<Task>> {
        if self.config.sweep_on_dequeue {
            self.sweep_expired().await?;
        }

        let started = Instant::now();
        let claimed = self
            .retry_conflicts("dequeue", || self.try_claim(worker_id, filter))
            .await;

        match claimed {
            Ok(Some(task)) => {
                debug!(
                    queue = %self.name(),
                    task_id = %task.id,
                    worker_id,
                    priority = task.priority,
                    lease_expires_at = ?task.lease_expires_at,
                    "task claimed"
                );
                self.record_transition(TaskState::Pending, TaskState::Claimed);
                self.record_operation("dequeue", started);
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) if e.is_conflict() => {
                let attempts = self.config.claim_retry_limit.max(1);
                warn!(queue = %self.name(), worker_id, attempts, "claim contention, giving up");
                Err(Error::ClaimContention { attempts })
            }
            Err(e) => Err(e),
        }
    }

    /// One claim attempt in one transaction.
    async fn try_claim(&self, worker_id: &str, filter: &TaskFilter) -> Result<Option<Task>> {
        let now = self.clock.now_ms();
        let mut txn = self.store.begin().await?;
        let (mut cursor, end) = keys::pending_range(self.name());

        loop {
            let batch = txn.scan_range(&cursor, &end, SCAN_BATCH).await?;

            for (raw_key, value) in &batch {
                let key = QueueKey::decode(raw_key)?;
                if key.ready_ts > now {
                    continue;
                }
                let task = decode_task(value)?;
                if !filter.contains(&key.task_id, task.metadata.as_ref()) {
                    continue;
                }
                let task = self.claim_entry(&mut txn, raw_key, task, worker_id, now).await?;
                txn.commit().await?;
                return Ok(Some(task));
            }

            match batch.last() {
                Some((last, _)) if batch.len() == SCAN_BATCH => cursor = key_successor(last),
                _ => {
                    txn.rollback().await?;
                    return Ok(None);
                }
            }
        }
    }

    async fn claim_entry(
        &self,
        txn: &mut S::Txn,
        pending_key: &[u8],
        mut task: Task,
        worker_id: &str,
        now: u64,
    ) -> Result<Task> {
        task.transition_to(TaskState::Claimed)?;
        let expires_at = now.saturating_add(self.config.visibility_timeout_ms);
        task.claimed_at = Some(now);
        task.claimed_by = Some(worker_id.to_string());
        task.lease_expires_at = Some(expires_at);

        let lease = LeaseKey::new(self.name(), expires_at, task.id.clone()).encode();
        let mut tasks = TaskStore::new(txn, self.name());
        tasks.move_state(pending_key, &task, &lease).await?;
        tasks
            .bump(&[
                (Counter::Pending, -1),
                (Counter::Claimed, 1),
                (Counter::TotalDequeued, 1),
            ])
            .await?;
        Ok(task)
    }
}
