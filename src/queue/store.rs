//! Ordered index and task-id index for one queue, inside one transaction.
//!
//! The ordered index maps a pending [`QueueKey`](super::keys::QueueKey) or a
//! [`LeaseKey`](super::keys::LeaseKey) to the task record. The task-id index
//! maps an id either to the ordered key it currently lives under, or, once
//! the task is terminal, to the retired record itself. Every method writes
//! both sides through the same transaction, so a commit either moves a task
//! completely or not at all.

use serde::{Deserialize, Serialize};

use super::keys::{self, QueueKey};
use super::stats::Counter;
use crate::error::{Error, Result};
use crate::kv::{KvTxn, key_successor};
use crate::model::{Task, TaskId, TaskState};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum IndexEntry {
    Live { key: Vec<u8> },
    Retired { task: Task },
}

/// A task as found through the task-id index.
#[derive(Debug)]
pub(crate) struct StoredTask {
    /// Ordered-index key; `None` once retired.
    pub key: Option<Vec<u8>>,
    pub task: Task,
}

pub(crate) fn encode_task(task: &Task) -> Result<Vec<u8>> {
    serde_json::to_vec(task).map_err(|e| Error::Other(format!("serialize task {}: {e}", task.id)))
}

pub(crate) fn decode_task(bytes: &[u8]) -> Result<Task> {
    serde_json::from_slice(bytes).map_err(|e| Error::MalformedRecord(format!("task record: {e}")))
}

fn encode_entry(entry: &IndexEntry) -> Result<Vec<u8>> {
    serde_json::to_vec(entry).map_err(|e| Error::Other(format!("serialize index entry: {e}")))
}

fn decode_entry(bytes: &[u8]) -> Result<IndexEntry> {
    serde_json::from_slice(bytes).map_err(|e| Error::MalformedRecord(format!("index entry: {e}")))
}

pub(crate) struct TaskStore<'a, T> {
    txn: &'a mut T,
    queue: &'a str,
}

impl<'a, T: KvTxn> TaskStore<'a, T> {
    pub fn new(txn: &'a mut T, queue: &'a str) -> Self {
        Self { txn, queue }
    }

    /// Write a task under `key` and point the id index at it.
    pub async fn put(&mut self, key: &[u8], task: &Task) -> Result<()> {
        self.txn.put(key, &encode_task(task)?).await?;
        let entry = encode_entry(&IndexEntry::Live { key: key.to_vec() })?;
        self.txn.put(&keys::task_key(self.queue, &task.id), &entry).await?;
        Ok(())
    }

    pub async fn get_by_task_id(&mut self, id: &TaskId) -> Result<Option<StoredTask>> {
        let Some(raw) = self.txn.get(&keys::task_key(self.queue, id)).await? else {
            return Ok(None);
        };
        match decode_entry(&raw)? {
            IndexEntry::Retired { task } => Ok(Some(StoredTask { key: None, task })),
            IndexEntry::Live { key } => {
                let Some(value) = self.txn.get(&key).await? else {
                    return Err(Error::MalformedRecord(format!(
                        "task {id} indexed under a missing ordered key"
                    )));
                };
                let task = decode_task(&value)?;
                Ok(Some(StoredTask {
                    key: Some(key),
                    task,
                }))
            }
        }
    }

    /// Re-key a live task: drop `old_key`, write `new_key`, repoint the id index.
    pub async fn move_state(&mut self, old_key: &[u8], task: &Task, new_key: &[u8]) -> Result<()> {
        if old_key != new_key {
            self.txn.delete(old_key).await?;
        }
        self.put(new_key, task).await
    }

    /// Take a terminal task out of the ordered index and keep it for lookup.
    pub async fn retire(&mut self, old_key: &[u8], task: &Task) -> Result<()> {
        debug_assert!(task.state.is_terminal());
        self.txn.delete(old_key).await?;
        let entry = encode_entry(&IndexEntry::Retired { task: task.clone() })?;
        self.txn.put(&keys::task_key(self.queue, &task.id), &entry).await?;
        Ok(())
    }

    /// Delete a task from both indexes. Returns whether it existed.
    pub async fn remove(&mut self, id: &TaskId) -> Result<bool> {
        let Some(stored) = self.get_by_task_id(id).await? else {
            return Ok(false);
        };
        if let Some(key) = stored.key {
            self.txn.delete(&key).await?;
        }
        self.txn.delete(&keys::task_key(self.queue, id)).await?;
        Ok(true)
    }

    /// Allocate the next sequence number from the queue's counter key.
    pub async fn next_sequence(&mut self) -> Result<u64> {
        let key = keys::sequence_key(self.queue);
        let current = match self.txn.get(&key).await? {
            None => 0,
            Some(raw) => {
                let bytes: [u8; 8] = raw.as_slice().try_into().map_err(|_| {
                    Error::MalformedRecord(format!("sequence counter is {} bytes", raw.len()))
                })?;
                u64::from_be_bytes(bytes)
            }
        };
        let next = current + 1;
        self.txn.put(&key, &next.to_be_bytes()).await?;
        Ok(next)
    }

    /// Stamp a fresh sequence on a pending task and add it to the queue.
    pub async fn insert_pending(&mut self, mut task: Task) -> Result<Task> {
        debug_assert_eq!(task.state, TaskState::Pending);
        task.queue = self.queue.to_string();
        task.sequence = self.next_sequence().await?;
        let key = pending_key(&task).encode();
        self.put(&key, &task).await?;
        self.bump(&[(Counter::Pending, 1), (Counter::TotalEnqueued, 1)])
            .await?;
        Ok(task)
    }

    /// Apply counter deltas in this transaction.
    pub async fn bump(&mut self, deltas: &[(Counter, i64)]) -> Result<()> {
        for (counter, delta) in deltas {
            self.txn
                .add_counter(&keys::counter_key(self.queue, counter.name()), *delta)
                .await?;
        }
        Ok(())
    }

    /// Delete retired records in `[start, end)`, at most `limit` index entries
    /// examined. Returns the number removed and where to resume, if anywhere.
    pub async fn purge_retired(
        &mut self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<(usize, Option<Vec<u8>>)> {
        let batch = self.txn.scan_range(start, end, limit).await?;
        let mut removed = 0;
        for (key, value) in &batch {
            if let IndexEntry::Retired { .. } = decode_entry(value)? {
                let id = keys::task_id_from_key(self.queue, key)?;
                if self.remove(&id).await? {
                    removed += 1;
                }
            }
        }
        let resume = match batch.last() {
            Some((last, _)) if batch.len() == limit => Some(key_successor(last)),
            _ => None,
        };
        Ok((removed, resume))
    }
}

/// Pending-partition key for a task's current priority, ready time and sequence.
pub(crate) fn pending_key(task: &Task) -> QueueKey {
    QueueKey::new(
        task.queue.clone(),
        task.priority,
        task.ready_at,
        task.sequence,
        task.id.clone(),
    )
}
