//! Per-queue counters.
//!
//! Each counter is its own key, bumped through the store's commutative merge
//! inside the transaction that performs the matching transition. Reads are
//! independent point reads; the numbers are advisory.

use tracing::warn;

use super::{TaskQueue, keys};
use crate::error::Result;
use crate::kv::KvStore;
use crate::model::QueueStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Counter {
    Pending,
    Claimed,
    Completed,
    DeadLettered,
    TotalEnqueued,
    TotalDequeued,
}

impl Counter {
    pub fn name(self) -> &'static str {
        match self {
            Counter::Pending => "pending",
            Counter::Claimed => "claimed",
            Counter::Completed => "completed",
            Counter::DeadLettered => "dead_lettered",
            Counter::TotalEnqueued => "total_enqueued",
            Counter::TotalDequeued => "total_dequeued",
        }
    }
}

impl<S: KvStore> TaskQueue<S> {
    /// Current counter values for this queue.
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self.read_counter(Counter::Pending).await?,
            claimed: self.read_counter(Counter::Claimed).await?,
            completed: self.read_counter(Counter::Completed).await?,
            dead_lettered: self.read_counter(Counter::DeadLettered).await?,
            total_enqueued: self.read_counter(Counter::TotalEnqueued).await?,
            total_dequeued: self.read_counter(Counter::TotalDequeued).await?,
        })
    }

    async fn read_counter(&self, counter: Counter) -> Result<u64> {
        let key = keys::counter_key(self.name(), counter.name());
        let value = self.store.counter(&key).await?;
        match u64::try_from(value) {
            Ok(value) => Ok(value),
            Err(_) => {
                warn!(
                    queue = %self.name(),
                    counter = counter.name(),
                    value,
                    "counter is negative, an increment was lost; reporting 0"
                );
                Ok(0)
            }
        }
    }
}
