//! The worker loop: claim, handle, ack or nack.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tracing::{Instrument, debug, error, info, warn};

use super::{Outcome, TaskHandler};
use crate::error::{Error, Result};
use crate::kv::KvStore;
use crate::model::{Release, Task, TaskId, TaskState};
use crate::queue::{TaskFilter, TaskQueue};
use crate::telemetry::task::{record_state_transition, start_task_span};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Recorded as `claimed_by` on every task this worker takes.
    pub worker_id: String,
    /// Sleep between polls when the queue has nothing ready.
    pub poll_interval: Duration,
    /// Handlers allowed to run at once.
    pub max_concurrent: usize,
    /// Only claim tasks this filter admits.
    pub filter: TaskFilter,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", TaskId::new()),
            poll_interval: Duration::from_millis(500),
            max_concurrent: 1,
            filter: TaskFilter::AllowAll,
        }
    }
}

/// Polls one queue and feeds claimed tasks to a handler.
pub struct Worker<S: KvStore, H: TaskHandler> {
    queue: TaskQueue<S>,
    handler: Arc<H>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
    stopping: Arc<AtomicBool>,
    in_flight: Arc<AtomicUsize>,
}

impl<S: KvStore, H: TaskHandler> Clone for Worker<S, H> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
            stopping: Arc::clone(&self.stopping),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<S: KvStore, H: TaskHandler> Worker<S, H> {
    pub fn new(queue: TaskQueue<S>, handler: H, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler: Arc::new(handler),
            config,
            shutdown: Arc::new(Notify::new()),
            stopping: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Ask [`run`](Self::run) to stop. In-flight handlers are allowed to finish.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Run until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        info!(
            queue = %self.queue.name(),
            worker_id = %self.config.worker_id,
            max_concurrent = self.config.max_concurrent,
            "worker started"
        );
        let mut handlers = JoinSet::new();

        while !self.stopping.load(Ordering::SeqCst) {
            // Reap finished handlers so the JoinSet does not grow without bound.
            while let Some(joined) = handlers.try_join_next() {
                self.reap(joined);
            }

            let claimed = if self.in_flight() < self.config.max_concurrent.max(1) {
                self.poll_once(&mut handlers).await
            } else {
                Ok(false)
            };

            match claimed {
                Ok(true) => continue,
                Ok(false) => {}
                Err(Error::ClaimContention { attempts }) => {
                    debug!(worker_id = %self.config.worker_id, attempts, "claim contention, backing off");
                }
                Err(e) => error!(worker_id = %self.config.worker_id, "poll error: {e}"),
            }

            tokio::select! {
                _ = self.shutdown.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker_id = %self.config.worker_id, "worker shutting down");
        while let Some(joined) = handlers.join_next().await {
            self.reap(joined);
        }
        Ok(())
    }

    fn reap(&self, joined: std::result::Result<(), JoinError>) {
        match joined {
            Ok(()) => {}
            Err(e) if e.is_panic() => error!(
                worker_id = %self.config.worker_id,
                "handler panicked, its task returns when the lease expires"
            ),
            Err(e) => warn!(worker_id = %self.config.worker_id, "handler task ended early: {e}"),
        }
    }

    /// Claim one task and start its handler. Returns whether a task was claimed.
    async fn poll_once(&self, handlers: &mut JoinSet<()>) -> Result<bool> {
        let Some(task) = self
            .queue
            .dequeue_matching(&self.config.worker_id, &self.config.filter)
            .await?
        else {
            return Ok(false);
        };

        let slot = Slot::take(&self.in_flight);
        let queue = self.queue.clone();
        let handler = Arc::clone(&self.handler);
        let worker_id = self.config.worker_id.clone();

        handlers.spawn(async move {
            let _slot = slot;
            if let Err(e) = process(&queue, handler.as_ref(), task, &worker_id).await {
                error!(worker_id = %worker_id, "task processing error: {e}");
            }
        });
        Ok(true)
    }
}

/// One unit of `max_concurrent`. Released on drop, so a handler that panics
/// gives its slot back while unwinding.
struct Slot(Arc<AtomicUsize>);

impl Slot {
    fn take(in_flight: &Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(in_flight))
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Run the handler for one claimed task and settle the claim.
async fn process<S: KvStore, H: TaskHandler>(
    queue: &TaskQueue<S>,
    handler: &H,
    task: Task,
    worker_id: &str,
) -> Result<()> {
    let id = task.id.clone();
    let span = start_task_span(queue.name(), &id, worker_id);
    record_state_transition(&span, TaskState::Pending, TaskState::Claimed);

    async {
        match handler.handle(task).await {
            Outcome::Ack => {
                queue.ack(&id).await?;
                record_state_transition(&span, TaskState::Claimed, TaskState::Completed);
            }
            Outcome::Nack(opts) => match queue.nack_with(&id, opts).await? {
                Release::Requeued => {
                    record_state_transition(&span, TaskState::Claimed, TaskState::Pending);
                }
                Release::DeadLettered => {
                    warn!(task_id = %id, "handler gave up on task, dead-lettered");
                    record_state_transition(&span, TaskState::Claimed, TaskState::DeadLettered);
                }
            },
        }
        Ok(())
    }
    .instrument(span.clone())
    .await
}
