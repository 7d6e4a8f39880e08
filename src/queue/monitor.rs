//! Visibility-timeout sweep.
//!
//! Expired leases are found by one range scan over the lease partition up to
//! `now`, then each is released in its own transaction. A hit whose task has
//! since been acked, nacked, extended or re-claimed is left alone, and so is
//! one whose transaction loses to a concurrent commit; the next sweep will see
//! it again if it is still expired.

use opentelemetry::KeyValue;
use tracing::{debug, info};

use super::keys::{self, LeaseKey};
use super::store::decode_task;
use super::TaskQueue;
use crate::error::Result;
use crate::kv::{KvStore, KvTxn, key_successor};
use crate::model::{NackOptions, Release, SweepReport, TaskState};
use crate::telemetry::metrics;

const SWEEP_BATCH: usize = 128;

impl<S: KvStore> TaskQueue<S> {
    /// Release every claim whose lease expired at or before now.
    ///
    /// Runs before each dequeue when `sweep_on_dequeue` is set, and from
    /// [`Reaper`](crate::worker::Reaper) on a timer.
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        let now = self.clock.now_ms();
        let (mut cursor, end) = keys::expired_lease_range(self.name(), now);
        let mut report = SweepReport::default();

        loop {
            let batch = self.store.scan_range(&cursor, &end, SWEEP_BATCH).await?;

            for (raw_key, value) in &batch {
                let lease = LeaseKey::decode(raw_key)?;
                let seen = decode_task(value)?;
                match self.expire_lease(raw_key, seen.claimed_at, now).await {
                    Ok(Some(release)) => {
                        self.record_release(release);
                        match release {
                            Release::Requeued => report.requeued += 1,
                            Release::DeadLettered => report.dead_lettered += 1,
                        }
                        debug!(
                            queue = %self.name(),
                            task_id = %lease.task_id,
                            expired_at = lease.expires_at,
                            ?release,
                            "lease expired"
                        );
                    }
                    Ok(None) => report.skipped += 1,
                    Err(e) if e.is_conflict() => {
                        debug!(queue = %self.name(), task_id = %lease.task_id, "sweep lost a race, skipping");
                        report.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }

            match batch.last() {
                Some((last, _)) if batch.len() == SWEEP_BATCH => cursor = key_successor(last),
                _ => break,
            }
        }

        if report.reclaimed() > 0 {
            info!(
                queue = %self.name(),
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                skipped = report.skipped,
                "swept expired leases"
            );
            let queue = KeyValue::new("queue", self.config.name.clone());
            metrics::sweep_reclaimed().add(
                report.requeued as u64,
                &[queue.clone(), KeyValue::new("outcome", "requeued")],
            );
            metrics::sweep_reclaimed().add(
                report.dead_lettered as u64,
                &[queue, KeyValue::new("outcome", "dead_lettered")],
            );
        }
        Ok(report)
    }

    /// Release one expired claim if it is still the claim the scan saw.
    async fn expire_lease(
        &self,
        lease_key: &[u8],
        claimed_at: Option<u64>,
        now: u64,
    ) -> Result<Option<Release>> {
        let mut txn = self.store.begin().await?;
        let Some(value) = txn.get(lease_key).await? else {
            txn.rollback().await?;
            return Ok(None);
        };
        let task = decode_task(&value)?;
        if task.state != TaskState::Claimed || task.claimed_at != claimed_at {
            txn.rollback().await?;
            return Ok(None);
        }

        let release = self
            .release(&mut txn, lease_key, task, NackOptions::default(), now)
            .await?;
        txn.commit().await?;
        Ok(Some(release))
    }
}
