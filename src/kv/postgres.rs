//! Postgres-backed store.
//!
//! Keys and values live in a single `kv` table ordered by `bytea`, which
//! Postgres compares byte-wise. Every transaction runs at SERIALIZABLE so a
//! lost race surfaces as SQLSTATE 40001 and is reported as
//! [`StorageError::Conflict`]. Counters are append-only delta rows, summed on
//! read, so concurrent increments never touch the same row. The rows of a
//! counter are folded back into one by [`KvStore::compact_counters`].

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use super::{Entry, KvStore, KvTxn, StorageError};

/// Database handle. Owns the connection pool; clones share it.
#[derive(Debug, Clone)]
pub struct PgKv {
    pool: PgPool,
}

impl PgKv {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Round-trips a `SELECT 1`.
    pub async fn health_check(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Map serialization failures and deadlocks to a retryable conflict.
fn classify(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(ref db) = err {
        if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) {
            return StorageError::Conflict;
        }
    }
    StorageError::Database(err)
}

impl KvStore for PgKv {
    type Txn = PgTxn;

    async fn begin(&self) -> Result<PgTxn, StorageError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        Ok(PgTxn { tx })
    }

    async fn counter(&self, key: &[u8]) -> Result<i64, StorageError> {
        let row: (i64,) =
            sqlx::query_as("SELECT COALESCE(SUM(delta), 0)::BIGINT FROM kv_counters WHERE key = $1")
                .bind(key)
                .fetch_one(&self.pool)
                .await
                .map_err(classify)?;
        Ok(row.0)
    }

    // One statement at the pool's default isolation. Deltas committed while
    // it runs are outside its snapshot and survive as separate rows.
    async fn compact_counters(&self, start: &[u8], end: &[u8]) -> Result<u64, StorageError> {
        let folded = sqlx::query(
            "WITH folded AS (
                 DELETE FROM kv_counters WHERE key >= $1 AND key < $2 RETURNING key, delta
             )
             INSERT INTO kv_counters (key, delta)
             SELECT key, SUM(delta)::BIGINT FROM folded GROUP BY key",
        )
        .bind(start)
        .bind(end)
        .execute(&self.pool)
        .await
        .map_err(classify)?;
        Ok(folded.rows_affected())
    }
}

/// Transaction over a [`PgKv`]. Dropping it rolls back.
pub struct PgTxn {
    tx: Transaction<'static, Postgres>,
}

impl KvTxn for PgTxn {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(classify)?;
        Ok(row.map(|r| r.0))
    }

    async fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *self.tx)
        .await
        .map_err(classify)?;
        Ok(())
    }

    async fn delete(&mut self, key: &[u8]) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv WHERE key = $1")
            .bind(key)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn scan_range(
        &mut self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<Entry>, StorageError> {
        let rows: Vec<(Vec<u8>, Vec<u8>)> = sqlx::query_as(
            "SELECT key, value FROM kv WHERE key >= $1 AND key < $2 ORDER BY key LIMIT $3",
        )
        .bind(start)
        .bind(end)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(classify)?;
        Ok(rows)
    }

    async fn add_counter(&mut self, key: &[u8], delta: i64) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO kv_counters (key, delta) VALUES ($1, $2)")
            .bind(key)
            .bind(delta)
            .execute(&mut *self.tx)
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn commit(self) -> Result<(), StorageError> {
        self.tx.commit().await.map_err(classify)
    }

    async fn rollback(self) -> Result<(), StorageError> {
        self.tx.rollback().await.map_err(classify)
    }
}
