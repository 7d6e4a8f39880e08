//! Worker runtime: poll a queue, run a handler, settle the claim.

pub mod reaper;
pub mod runner;

pub use reaper::Reaper;
pub use runner::{Worker, WorkerConfig};

use std::future::Future;

use crate::model::{NackOptions, Task};

/// What a handler decided about a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Done; complete the task.
    Ack,
    /// Not done; requeue it (or dead-letter it once retries run out).
    Nack(NackOptions),
}

/// Processes one claimed task.
///
/// Implemented for any `Fn(Task) -> impl Future<Output = Outcome>`.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, task: Task) -> impl Future<Output = Outcome> + Send;
}

impl<F, Fut> TaskHandler for F
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send,
{
    fn handle(&self, task: Task) -> impl Future<Output = Outcome> + Send {
        self(task)
    }
}
