//! Background visibility-timeout sweeper.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::Result;
use crate::kv::KvStore;
use crate::queue::TaskQueue;

/// Calls [`TaskQueue::sweep_expired`] every `interval` until shut down, so
/// abandoned claims come back even when nobody is dequeuing.
pub struct Reaper<S: KvStore> {
    queue: TaskQueue<S>,
    interval: Duration,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
}

impl<S: KvStore> Clone for Reaper<S> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            interval: self.interval,
            shutdown: Arc::clone(&self.shutdown),
            stopping: Arc::clone(&self.stopping),
        }
    }
}

impl<S: KvStore> Reaper<S> {
    pub fn new(queue: TaskQueue<S>, interval: Duration) -> Self {
        Self {
            queue,
            interval,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    pub async fn run(&self) -> Result<()> {
        info!(queue = %self.queue.name(), interval_ms = self.interval.as_millis() as u64, "reaper started");
        while !self.stopping.load(Ordering::SeqCst) {
            if let Err(e) = self.queue.sweep_expired().await {
                error!(queue = %self.queue.name(), "sweep failed: {e}");
            }
            tokio::select! {
                _ = self.shutdown.notified() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!(queue = %self.queue.name(), "reaper stopped");
        Ok(())
    }

    /// Run on the current runtime. Keep a clone to call [`shutdown`](Self::shutdown).
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
