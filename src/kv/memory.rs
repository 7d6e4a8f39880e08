//! In-process multi-version store.
//!
//! Every committed write gets a commit timestamp. A transaction reads the
//! newest version at or below the timestamp it started at, buffers its own
//! writes, and at commit validates under the global lock that nothing it
//! read, scanned or wrote has a newer version. Passing validation means the
//! transaction is equivalent to running alone at its commit point.
//!
//! Superseded versions and tombstones are reclaimed once no open transaction
//! can still read them. Every commit queues the keys it wrote; whenever a
//! transaction ends, queued keys older than the oldest open snapshot are
//! pruned.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Entry, KvStore, KvTxn, StorageError, key_successor};

#[derive(Debug, Clone)]
struct Version {
    ts: u64,
    /// `None` is a tombstone.
    value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Inner {
    data: BTreeMap<Vec<u8>, Vec<Version>>,
    counters: HashMap<Vec<u8>, i64>,
    /// Timestamp of the last commit.
    clock: u64,
    /// Snapshot timestamp -> number of open transactions reading at it.
    active: BTreeMap<u64, usize>,
    /// `(commit ts, key)` for every committed write not yet pruned, oldest first.
    garbage: VecDeque<(u64, Vec<u8>)>,
}

impl Inner {
    fn visible(versions: &[Version], snapshot: u64) -> Option<&[u8]> {
        versions
            .iter()
            .rev()
            .find(|v| v.ts <= snapshot)
            .and_then(|v| v.value.as_deref())
    }

    fn latest_ts(&self, key: &[u8]) -> Option<u64> {
        self.data.get(key).and_then(|vs| vs.last()).map(|v| v.ts)
    }

    fn oldest_snapshot(&self) -> u64 {
        self.active.keys().next().copied().unwrap_or(self.clock)
    }

    /// Prune every queued key whose write is now below the oldest snapshot.
    fn collect(&mut self) {
        let horizon = self.oldest_snapshot();
        while self.garbage.front().is_some_and(|(ts, _)| *ts <= horizon) {
            let Some((_, key)) = self.garbage.pop_front() else {
                break;
            };
            self.prune(&key, horizon);
        }
    }

    /// Drop versions of `key` no snapshot at or after `horizon` can observe.
    fn prune(&mut self, key: &[u8], horizon: u64) {
        let Some(versions) = self.data.get_mut(key) else {
            return;
        };
        // Keep the newest version at or below the horizon plus everything after it.
        let keep_from = versions
            .iter()
            .rposition(|v| v.ts <= horizon)
            .unwrap_or(0);
        versions.drain(..keep_from);
        // A visible tombstone reads the same as no version at all.
        if versions
            .first()
            .is_some_and(|v| v.value.is_none() && v.ts <= horizon)
        {
            versions.remove(0);
        }
        if versions.is_empty() {
            self.data.remove(key);
        }
    }
}

/// Shared handle to an in-memory store. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-deleted) keys at the latest commit.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        let clock = inner.clock;
        inner
            .data
            .values()
            .filter(|vs| Inner::visible(vs, clock).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Versions held across all keys, tombstones included. Settles back to
    /// [`len`](Self::len) once no transaction is open.
    pub fn stored_versions(&self) -> usize {
        self.inner.lock().data.values().map(Vec::len).sum()
    }
}

impl KvStore for MemoryKv {
    type Txn = MemoryTxn;

    async fn begin(&self) -> Result<MemoryTxn, StorageError> {
        let mut inner = self.inner.lock();
        let snapshot = inner.clock;
        *inner.active.entry(snapshot).or_insert(0) += 1;
        Ok(MemoryTxn {
            inner: Arc::clone(&self.inner),
            snapshot,
            writes: BTreeMap::new(),
            counter_deltas: Vec::new(),
            reads: BTreeSet::new(),
            scans: Vec::new(),
        })
    }

    async fn counter(&self, key: &[u8]) -> Result<i64, StorageError> {
        Ok(self.inner.lock().counters.get(key).copied().unwrap_or(0))
    }
}

/// Transaction over a [`MemoryKv`].
#[derive(Debug)]
pub struct MemoryTxn {
    inner: Arc<Mutex<Inner>>,
    snapshot: u64,
    /// Buffered writes; `None` deletes.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    counter_deltas: Vec<(Vec<u8>, i64)>,
    reads: BTreeSet<Vec<u8>>,
    /// Half-open ranges whose contents this transaction observed.
    scans: Vec<(Vec<u8>, Vec<u8>)>,
}

impl MemoryTxn {
    fn validate(&self, inner: &Inner) -> Result<(), StorageError> {
        let newer = |key: &[u8]| inner.latest_ts(key).is_some_and(|ts| ts > self.snapshot);

        if self.reads.iter().any(|k| newer(k.as_slice()))
            || self.writes.keys().any(|k| newer(k.as_slice()))
        {
            return Err(StorageError::Conflict);
        }

        for (start, end) in &self.scans {
            let changed = inner
                .data
                .range::<[u8], _>((Bound::Included(start.as_slice()), Bound::Excluded(end.as_slice())))
                .any(|(_, vs)| vs.last().is_some_and(|v| v.ts > self.snapshot));
            if changed {
                return Err(StorageError::Conflict);
            }
        }
        Ok(())
    }

    /// Validate and install the buffered writes under the store lock.
    fn apply(&mut self) -> Result<(), StorageError> {
        let inner_handle = Arc::clone(&self.inner);
        let mut inner = inner_handle.lock();
        self.validate(&inner)?;

        inner.clock += 1;
        let ts = inner.clock;
        for (key, value) in std::mem::take(&mut self.writes) {
            inner
                .data
                .entry(key.clone())
                .or_default()
                .push(Version { ts, value });
            inner.garbage.push_back((ts, key));
        }
        for (key, delta) in std::mem::take(&mut self.counter_deltas) {
            let counter = inner.counters.entry(key).or_insert(0);
            *counter = counter.saturating_add(delta);
        }
        Ok(())
    }
}

impl KvTxn for MemoryTxn {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(local) = self.writes.get(key) {
            return Ok(local.clone());
        }
        self.reads.insert(key.to_vec());
        let inner = self.inner.lock();
        Ok(inner
            .data
            .get(key)
            .and_then(|vs| Inner::visible(vs, self.snapshot))
            .map(<[u8]>::to_vec))
    }

    async fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    async fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    async fn scan_range(
        &mut self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<Entry>, StorageError> {
        if limit == 0 || start >= end {
            return Ok(Vec::new());
        }
        let bounds = (Bound::Included(start), Bound::Excluded(end));
        let mut out: Vec<Entry> = Vec::new();
        {
            let inner = self.inner.lock();
            let mut base = inner
                .data
                .range::<[u8], _>(bounds)
                .filter_map(|(k, vs)| Inner::visible(vs, self.snapshot).map(|v| (k.as_slice(), v)))
                .peekable();
            let mut local = self.writes.range::<[u8], _>(bounds).peekable();

            while out.len() < limit {
                let take_local = match (base.peek(), local.peek()) {
                    (None, None) => break,
                    (Some(_), None) => false,
                    (None, Some(_)) => true,
                    (Some((bk, _)), Some((lk, _))) => lk.as_slice() <= *bk,
                };
                if take_local {
                    let Some((lk, lv)) = local.next() else { break };
                    if base.peek().is_some_and(|(bk, _)| *bk == lk.as_slice()) {
                        base.next();
                    }
                    if let Some(v) = lv {
                        out.push((lk.clone(), v.clone()));
                    }
                } else if let Some((bk, bv)) = base.next() {
                    out.push((bk.to_vec(), bv.to_vec()));
                }
            }
        }

        let observed_end = match out.last() {
            Some((last, _)) if out.len() == limit => key_successor(last),
            _ => end.to_vec(),
        };
        self.scans.push((start.to_vec(), observed_end));
        Ok(out)
    }

    async fn add_counter(&mut self, key: &[u8], delta: i64) -> Result<(), StorageError> {
        self.counter_deltas.push((key.to_vec(), delta));
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StorageError> {
        if self.writes.is_empty() && self.counter_deltas.is_empty() {
            return Ok(());
        }
        self.apply()
    }

    async fn rollback(self) -> Result<(), StorageError> {
        Ok(())
    }
}

impl Drop for MemoryTxn {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Some(count) = inner.active.get_mut(&self.snapshot) {
            *count -= 1;
            if *count == 0 {
                inner.active.remove(&self.snapshot);
            }
        }
        inner.collect();
    }
}
