//! Finishing and releasing claimed tasks.

use std::time::Instant;

use tracing::{debug, warn};

use super::keys::LeaseKey;
use super::stats::Counter;
use super::store::{TaskStore, pending_key};
use super::{TaskQueue, live_key, require_claimed};
use crate::error::{Error, Result};
use crate::kv::{KvStore, KvTxn};
use crate::model::{NackOptions, Release, Task, TaskId, TaskState};

impl<S: KvStore> TaskQueue<S> {
    /// Mark a claimed task completed. It will never be delivered again.
    ///
    /// Succeeds even if the lease has run out, as long as no sweep has
    /// released the task yet.
    pub async fn ack(&self, id: &TaskId) -> Result<()> {
        let started = Instant::now();
        self.retry_conflicts("ack", || self.try_ack(id)).await?;
        debug!(queue = %self.name(), task_id = %id, "task acked");
        self.record_transition(TaskState::Claimed, TaskState::Completed);
        self.record_operation("ack", started);
        Ok(())
    }

    async fn try_ack(&self, id: &TaskId) -> Result<()> {
        let now = self.clock.now_ms();
        let mut txn = self.store.begin().await?;
        let mut tasks = TaskStore::new(&mut txn, self.name());

        let stored = tasks
            .get_by_task_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        let mut task = stored.task;
        require_claimed(&task)?;
        let key = live_key(id, stored.key)?;

        task.transition_to(TaskState::Completed)?;
        task.completed_at = Some(now);
        task.lease_expires_at = None;
        tasks.retire(&key, &task).await?;
        tasks
            .bump(&[(Counter::Claimed, -1), (Counter::Completed, 1)])
            .await?;

        txn.commit().await?;
        Ok(())
    }

    /// Give a claimed task back: requeue it, or dead-letter it once its
    /// retries are used up.
    pub async fn nack(&self, id: &TaskId) -> Result<Release> {
        self.nack_with(id, NackOptions::default()).await
    }

    /// [`nack`](Self::nack) with a replacement priority and/or requeue delay.
    pub async fn nack_with(&self, id: &TaskId, opts: NackOptions) -> Result<Release> {
        let started = Instant::now();
        let release = self
            .retry_conflicts("nack", || self.try_nack(id, opts))
            .await?;
        match release {
            Release::Requeued => debug!(queue = %self.name(), task_id = %id, "task requeued"),
            Release::DeadLettered => warn!(queue = %self.name(), task_id = %id, "task dead-lettered"),
        }
        self.record_release(release);
        self.record_operation("nack", started);
        Ok(release)
    }

    async fn try_nack(&self, id: &TaskId, opts: NackOptions) -> Result<Release> {
        let now = self.clock.now_ms();
        let mut txn = self.store.begin().await?;

        let stored = TaskStore::new(&mut txn, self.name())
            .get_by_task_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        require_claimed(&stored.task)?;
        let key = live_key(id, stored.key)?;

        let release = self.release(&mut txn, &key, stored.task, opts, now).await?;
        txn.commit().await?;
        Ok(release)
    }

    /// Push a claimed task's lease out by `additional_ms` from its current
    /// expiry. Returns the new expiry.
    pub async fn extend_visibility(&self, id: &TaskId, additional_ms: u64) -> Result<u64> {
        let started = Instant::now();
        let expires_at = self
            .retry_conflicts("extend", || self.try_extend(id, additional_ms))
            .await?;
        debug!(queue = %self.name(), task_id = %id, expires_at, "lease extended");
        self.record_operation("extend", started);
        Ok(expires_at)
    }

    async fn try_extend(&self, id: &TaskId, additional_ms: u64) -> Result<u64> {
        let now = self.clock.now_ms();
        let mut txn = self.store.begin().await?;
        let mut tasks = TaskStore::new(&mut txn, self.name());

        let stored = tasks
            .get_by_task_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        let mut task = stored.task;
        require_claimed(&task)?;
        let old_key = live_key(id, stored.key)?;

        let expires_at = task
            .lease_expires_at
            .unwrap_or(now)
            .saturating_add(additional_ms);
        task.lease_expires_at = Some(expires_at);
        let new_key = LeaseKey::new(self.name(), expires_at, task.id.clone()).encode();
        tasks.move_state(&old_key, &task, &new_key).await?;

        txn.commit().await?;
        Ok(expires_at)
    }

    /// Release a claimed task inside `txn`. Shared by nack and the sweep.
    ///
    /// With retries left the task is requeued under a fresh sequence, so it
    /// lands behind equal-priority peers. Otherwise it is retired as
    /// dead-lettered and, if a dead-letter queue is configured, copied there.
    pub(crate) async fn release(
        &self,
        txn: &mut S::Txn,
        lease_key: &[u8],
        mut task: Task,
        opts: NackOptions,
        now: u64,
    ) -> Result<Release> {
        task.claimed_at = None;
        task.claimed_by = None;
        task.lease_expires_at = None;

        if task.retries < self.config.max_retries {
            task.transition_to(TaskState::Pending)?;
            task.retries += 1;
            if let Some(priority) = opts.priority {
                task.priority = priority;
            }
            task.ready_at = now.saturating_add(opts.delay_ms.unwrap_or(0));

            let mut tasks = TaskStore::new(&mut *txn, self.name());
            task.sequence = tasks.next_sequence().await?;
            let key = pending_key(&task).encode();
            tasks.move_state(lease_key, &task, &key).await?;
            tasks
                .bump(&[(Counter::Claimed, -1), (Counter::Pending, 1)])
                .await?;
            return Ok(Release::Requeued);
        }

        task.transition_to(TaskState::DeadLettered)?;
        task.dead_lettered_at = Some(now);
        {
            let mut tasks = TaskStore::new(&mut *txn, self.name());
            tasks.retire(lease_key, &task).await?;
            tasks
                .bump(&[(Counter::Claimed, -1), (Counter::DeadLettered, 1)])
                .await?;
        }

        if let Some(dlq) = self.config.dead_letter_queue_name.as_deref() {
            self.forward_to_dead_letter_queue(txn, dlq, &task, now).await?;
        }
        Ok(Release::DeadLettered)
    }

    pub(crate) fn record_release(&self, release: Release) {
        let to = match release {
            Release::Requeued => TaskState::Pending,
            Release::DeadLettered => TaskState::DeadLettered,
        };
        self.record_transition(TaskState::Claimed, to);
    }

    async fn forward_to_dead_letter_queue(
        &self,
        txn: &mut S::Txn,
        dlq: &str,
        task: &Task,
        now: u64,
    ) -> Result<()> {
        let mut tasks = TaskStore::new(txn, dlq);
        if tasks.get_by_task_id(&task.id).await?.is_some() {
            warn!(
                queue = %self.name(),
                dead_letter_queue = dlq,
                task_id = %task.id,
                "dead-letter queue already holds this id, not forwarding"
            );
            return Ok(());
        }

        tasks
            .insert_pending(Task {
                id: task.id.clone(),
                queue: dlq.to_string(),
                priority: task.priority,
                payload: task.payload.clone(),
                state: TaskState::Pending,
                ready_at: now,
                sequence: 0,
                retries: 0,
                enqueued_at: now,
                claimed_at: None,
                claimed_by: None,
                lease_expires_at: None,
                completed_at: None,
                dead_lettered_at: None,
                metadata: task.metadata.clone(),
            })
            .await?;
        debug!(
            queue = %self.name(),
            dead_letter_queue = dlq,
            task_id = %task.id,
            "forwarding to dead-letter queue"
        );
        Ok(())
    }
}
