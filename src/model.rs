//! Core data model.
//!
//! A task is an opaque payload with a priority, a lifecycle state, and the
//! bookkeeping needed to place it in the ordered index: when it becomes
//! ready, its per-queue sequence number, and the lease it is under if claimed.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of work tracked by a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,

    /// Name of the queue that owns this task.
    pub queue: String,

    /// Lower = more urgent. Negative values are allowed.
    pub priority: i64,

    /// Opaque bytes. The queue never interprets them.
    pub payload: Vec<u8>,

    /// Current lifecycle state.
    pub state: TaskState,

    /// Epoch millis before which the task cannot be claimed.
    pub ready_at: u64,

    /// Per-queue tie-breaker, reassigned on every requeue.
    pub sequence: u64,

    /// Number of times the task has been released without an ack.
    pub retries: u32,

    pub enqueued_at: u64,
    pub claimed_at: Option<u64>,
    pub claimed_by: Option<String>,

    /// Epoch millis at which an unacknowledged claim is considered abandoned.
    pub lease_expires_at: Option<u64>,

    pub completed_at: Option<u64>,
    pub dead_lettered_at: Option<u64>,

    /// Caller-supplied attributes, consulted by [`crate::queue::TaskFilter`].
    pub metadata: Option<serde_json::Value>,
}

impl Task {
    /// Move to `to`, rejecting transitions the lifecycle does not allow.
    pub(crate) fn transition_to(&mut self, to: TaskState) -> crate::error::Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(crate::error::Error::InvalidState {
                id: self.id.clone(),
                state: self.state,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// Newtype for task IDs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the pending partition.
    Pending,
    /// Leased to a worker.
    Claimed,
    /// Acknowledged. Terminal.
    Completed,
    /// Retry budget exhausted. Terminal; never redelivered.
    DeadLettered,
}

impl TaskState {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Pending, Claimed)
                | (Claimed, Completed)
                | (Claimed, Pending)
                | (Claimed, DeadLettered)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::DeadLettered)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Claimed => "claimed",
            TaskState::Completed => "completed",
            TaskState::DeadLettered => "dead_lettered",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Advisory counters for one queue. Each field is read independently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub claimed: u64,
    /// Cumulative acks. Not reduced by purge.
    pub completed: u64,
    /// Cumulative dead-letters. Not reduced by purge.
    pub dead_lettered: u64,
    pub total_enqueued: u64,
    pub total_dequeued: u64,
}

// ---------------------------------------------------------------------------
// Builders
// ---------------------------------------------------------------------------

/// Builder for new tasks. The queue's public API for submitting work.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub(crate) priority: i64,
    pub(crate) payload: Vec<u8>,
    pub(crate) metadata: Option<serde_json::Value>,
    pub(crate) delay_ms: u64,
    pub(crate) id: Option<TaskId>,
}

impl NewTask {
    pub fn new(priority: i64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            priority,
            payload: payload.into(),
            metadata: None,
            delay_ms: 0,
            id: None,
        }
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Keep the task invisible to claims for `delay_ms` after enqueue.
    pub fn delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Use a caller-chosen ID instead of a fresh UUID.
    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// How a nacked task re-enters the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NackOptions {
    /// Replace the task's priority on requeue.
    pub priority: Option<i64>,
    /// Delay before the requeued task becomes claimable again.
    pub delay_ms: Option<u64>,
}

impl NackOptions {
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }
}

/// Where a released task ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Requeued,
    DeadLettered,
}

/// Result of one visibility-timeout sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Expired entries left alone because a concurrent transaction won.
    pub skipped: usize,
}

impl SweepReport {
    pub fn reclaimed(&self) -> usize {
        self.requeued + self.dead_lettered
    }
}
