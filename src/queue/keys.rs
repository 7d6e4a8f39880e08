//! Key layout for everything a queue stores.
//!
//! Every key starts with the same queue prefix so distinct queues never share
//! a range:
//!
//! ```text
//! 'Q' | name_len: u32 BE | name | partition | partition-specific suffix
//!
//! pending  'p' | priority ^ 2^63: u64 BE | ready_ts: u64 BE | sequence: u64 BE | task_id
//! lease    'l' | expires_at: u64 BE | task_id
//! task     't' | task_id
//! sequence 's'
//! counter  'c' | counter name
//! ```
//!
//! All integers are fixed-width big-endian so unsigned byte comparison equals
//! numeric comparison. The task id is variable length and always last, so no
//! fixed-width field can be confused with a prefix of it.

use crate::error::{Error, Result};
use crate::kv::prefix_end;
use crate::model::TaskId;

const NAMESPACE: u8 = b'Q';
const PENDING: u8 = b'p';
const LEASE: u8 = b'l';
const TASK: u8 = b't';
const SEQUENCE: u8 = b's';
const COUNTER: u8 = b'c';

const SIGN_BIT: u64 = 1 << 63;

fn queue_prefix(queue: &str, partition: u8) -> Vec<u8> {
    let name = queue.as_bytes();
    let mut key = Vec::with_capacity(6 + name.len() + 24);
    key.push(NAMESPACE);
    key.extend_from_slice(&(name.len() as u32).to_be_bytes());
    key.extend_from_slice(name);
    key.push(partition);
    key
}

/// Map an i64 onto u64 preserving order: `i64::MIN -> 0`, `0 -> 2^63`.
#[inline]
pub fn encode_priority(priority: i64) -> u64 {
    (priority as u64) ^ SIGN_BIT
}

#[inline]
pub fn decode_priority(biased: u64) -> i64 {
    (biased ^ SIGN_BIT) as i64
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Cursor over key bytes that reports truncation as [`Error::MalformedKey`].
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        let Some(end) = end else {
            return Err(Error::MalformedKey(format!(
                "truncated {what} at byte {} of {}",
                self.pos,
                self.bytes.len()
            )));
        };
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn tag(&mut self, expected: u8, what: &str) -> Result<()> {
        let got = self.take(1, what)?[0];
        if got != expected {
            return Err(Error::MalformedKey(format!(
                "bad {what} tag {got:#04x}, expected {expected:#04x}"
            )));
        }
        Ok(())
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4, what)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8, what)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn str(&mut self, n: usize, what: &str) -> Result<&'a str> {
        let bytes = self.take(n, what)?;
        std::str::from_utf8(bytes).map_err(|e| Error::MalformedKey(format!("{what}: {e}")))
    }

    fn rest_str(&mut self, what: &str) -> Result<&'a str> {
        let n = self.bytes.len() - self.pos;
        self.str(n, what)
    }

    /// Read `'Q' | len | name | partition` and return the queue name.
    fn header(&mut self, partition: u8) -> Result<&'a str> {
        self.tag(NAMESPACE, "namespace")?;
        let len = self.u32("queue name length")? as usize;
        let name = self.str(len, "queue name")?;
        self.tag(partition, "partition")?;
        Ok(name)
    }
}

// ---------------------------------------------------------------------------
// Pending partition
// ---------------------------------------------------------------------------

/// Composite key of a pending task. Field order is sort order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub queue_id: String,
    pub priority: i64,
    pub ready_ts: u64,
    pub sequence: u64,
    pub task_id: TaskId,
}

impl QueueKey {
    pub fn new(
        queue_id: impl Into<String>,
        priority: i64,
        ready_ts: u64,
        sequence: u64,
        task_id: impl Into<TaskId>,
    ) -> Self {
        Self {
            queue_id: queue_id.into(),
            priority,
            ready_ts,
            sequence,
            task_id: task_id.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut key = queue_prefix(&self.queue_id, PENDING);
        key.extend_from_slice(&encode_priority(self.priority).to_be_bytes());
        key.extend_from_slice(&self.ready_ts.to_be_bytes());
        key.extend_from_slice(&self.sequence.to_be_bytes());
        key.extend_from_slice(self.task_id.as_str().as_bytes());
        key
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let queue_id = r.header(PENDING)?.to_string();
        let priority = decode_priority(r.u64("priority")?);
        let ready_ts = r.u64("ready_ts")?;
        let sequence = r.u64("sequence")?;
        let task_id = r.rest_str("task id")?;
        if task_id.is_empty() {
            return Err(Error::MalformedKey("empty task id".to_string()));
        }
        Ok(Self {
            queue_id,
            priority,
            ready_ts,
            sequence,
            task_id: TaskId::from(task_id),
        })
    }
}

/// `[start, end)` covering every pending entry of `queue`.
pub fn pending_range(queue: &str) -> (Vec<u8>, Vec<u8>) {
    let start = queue_prefix(queue, PENDING);
    let end = prefix_end(&start);
    (start, end)
}

// ---------------------------------------------------------------------------
// Lease partition
// ---------------------------------------------------------------------------

/// Key of a claimed task, ordered by when its claim expires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseKey {
    pub queue_id: String,
    pub expires_at: u64,
    pub task_id: TaskId,
}

impl LeaseKey {
    pub fn new(queue_id: impl Into<String>, expires_at: u64, task_id: impl Into<TaskId>) -> Self {
        Self {
            queue_id: queue_id.into(),
            expires_at,
            task_id: task_id.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut key = queue_prefix(&self.queue_id, LEASE);
        key.extend_from_slice(&self.expires_at.to_be_bytes());
        key.extend_from_slice(self.task_id.as_str().as_bytes());
        key
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let queue_id = r.header(LEASE)?.to_string();
        let expires_at = r.u64("expires_at")?;
        let task_id = r.rest_str("task id")?;
        if task_id.is_empty() {
            return Err(Error::MalformedKey("empty task id".to_string()));
        }
        Ok(Self {
            queue_id,
            expires_at,
            task_id: TaskId::from(task_id),
        })
    }
}

/// `[start, end)` covering leases of `queue` that expire at or before `now`.
pub fn expired_lease_range(queue: &str, now: u64) -> (Vec<u8>, Vec<u8>) {
    let start = queue_prefix(queue, LEASE);
    let end = match now.checked_add(1) {
        Some(bound) => {
            let mut end = start.clone();
            end.extend_from_slice(&bound.to_be_bytes());
            end
        }
        None => prefix_end(&start),
    };
    (start, end)
}

// ---------------------------------------------------------------------------
// Task-id index, sequence, counters
// ---------------------------------------------------------------------------

pub fn task_key(queue: &str, id: &TaskId) -> Vec<u8> {
    let mut key = queue_prefix(queue, TASK);
    key.extend_from_slice(id.as_str().as_bytes());
    key
}

/// `[start, end)` covering the task-id index of `queue`.
pub fn task_range(queue: &str) -> (Vec<u8>, Vec<u8>) {
    let start = queue_prefix(queue, TASK);
    let end = prefix_end(&start);
    (start, end)
}

/// Task id embedded in a task-id index key.
pub fn task_id_from_key(queue: &str, key: &[u8]) -> Result<TaskId> {
    let mut r = Reader::new(key);
    let name = r.header(TASK)?;
    if name != queue {
        return Err(Error::MalformedKey(format!(
            "task key belongs to queue {name:?}, expected {queue:?}"
        )));
    }
    Ok(TaskId::from(r.rest_str("task id")?))
}

pub fn sequence_key(queue: &str) -> Vec<u8> {
    queue_prefix(queue, SEQUENCE)
}

pub fn counter_key(queue: &str, counter: &str) -> Vec<u8> {
    let mut key = queue_prefix(queue, COUNTER);
    key.extend_from_slice(counter.as_bytes());
    key
}

/// `[start, end)` covering every counter of `queue`.
pub fn counter_range(queue: &str) -> (Vec<u8>, Vec<u8>) {
    let start = queue_prefix(queue, COUNTER);
    let end = prefix_end(&start);
    (start, end)
}
