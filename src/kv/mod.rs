//! Transactional ordered key-value interface the queue is built on.
//!
//! The queue needs exactly four things from its store: point reads, blind
//! writes and deletes, ascending range scans, and serializable transactions
//! that fail with [`StorageError::Conflict`] instead of silently interleaving.
//! Counters get a separate commutative merge so that bumping a shared stat
//! never turns two unrelated transitions into a conflict.
//!
//! Two backends ship with the crate: [`MemoryKv`] (in-process MVCC) and
//! [`PgKv`] (Postgres at SERIALIZABLE).

pub mod memory;
pub mod postgres;

pub use memory::MemoryKv;
pub use postgres::PgKv;

use std::future::Future;

use thiserror::Error;

/// A `(key, value)` pair returned by range scans.
pub type Entry = (Vec<u8>, Vec<u8>);

#[derive(Debug, Error)]
pub enum StorageError {
    /// A concurrent transaction committed first; the whole transaction was
    /// rolled back and may be retried.
    #[error("transaction conflict")]
    Conflict,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// A store that hands out serializable transactions.
pub trait KvStore: Clone + Send + Sync + 'static {
    type Txn: KvTxn;

    /// Open a transaction. Reads observe a consistent snapshot.
    fn begin(&self) -> impl Future<Output = Result<Self::Txn, StorageError>> + Send;

    /// Point-in-time value of a counter maintained through
    /// [`KvTxn::add_counter`]. Missing counters read as zero.
    fn counter(&self, key: &[u8]) -> impl Future<Output = Result<i64, StorageError>> + Send;

    /// Fold the stored history of every counter in `[start, end)` into a
    /// single value, leaving each counter's reading unchanged. Returns how
    /// many counters were folded. Stores that keep counters as one value
    /// have nothing to do.
    fn compact_counters(
        &self,
        start: &[u8],
        end: &[u8],
    ) -> impl Future<Output = Result<u64, StorageError>> + Send {
        let _ = (start, end);
        async { Ok(0) }
    }

    /// Read one key in its own transaction.
    fn get(&self, key: &[u8]) -> impl Future<Output = Result<Option<Vec<u8>>, StorageError>> + Send {
        async move {
            let mut txn = self.begin().await?;
            let value = txn.get(key).await?;
            txn.rollback().await?;
            Ok(value)
        }
    }

    /// Write one key in its own transaction.
    fn put(&self, key: &[u8], value: &[u8]) -> impl Future<Output = Result<(), StorageError>> + Send {
        async move {
            let mut txn = self.begin().await?;
            txn.put(key, value).await?;
            txn.commit().await
        }
    }

    /// Delete one key in its own transaction.
    fn delete(&self, key: &[u8]) -> impl Future<Output = Result<(), StorageError>> + Send {
        async move {
            let mut txn = self.begin().await?;
            txn.delete(key).await?;
            txn.commit().await
        }
    }

    /// Scan `[start, end)` in its own transaction.
    fn scan_range(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Entry>, StorageError>> + Send {
        async move {
            let mut txn = self.begin().await?;
            let entries = txn.scan_range(start, end, limit).await?;
            txn.rollback().await?;
            Ok(entries)
        }
    }
}

/// An open transaction. Dropping it without committing rolls it back.
pub trait KvTxn: Send {
    fn get(&mut self, key: &[u8])
    -> impl Future<Output = Result<Option<Vec<u8>>, StorageError>> + Send;

    fn put(&mut self, key: &[u8], value: &[u8])
    -> impl Future<Output = Result<(), StorageError>> + Send;

    fn delete(&mut self, key: &[u8]) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Entries with `start <= key < end` in ascending byte order, at most
    /// `limit` of them. Only the part of the range actually returned counts
    /// toward conflict detection when the result is truncated.
    fn scan_range(
        &mut self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Entry>, StorageError>> + Send;

    /// Add `delta` to a counter. Commutative; never causes a conflict.
    fn add_counter(&mut self, key: &[u8], delta: i64)
    -> impl Future<Output = Result<(), StorageError>> + Send;

    /// Apply every write atomically, or fail with [`StorageError::Conflict`].
    fn commit(self) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn rollback(self) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Smallest key greater than every key starting with `prefix`.
///
/// Returns an empty vector when no such key exists (prefix of all `0xff`).
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return end;
        }
    }
    end
}

/// Smallest key strictly greater than `key`.
pub fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}
