//! Task processing span helpers.

use tracing::Span;

use crate::model::{TaskId, TaskState};

/// Start a span around a worker's handling of one claimed task.
///
/// `task.state` starts empty and is filled in by [`record_state_transition`].
pub fn start_task_span(queue: &str, task_id: &TaskId, worker_id: &str) -> Span {
    tracing::info_span!(
        "task.process",
        "task.queue" = queue,
        "task.id" = %task_id,
        "task.worker" = worker_id,
        "task.state" = tracing::field::Empty,
    )
}

/// Record a state transition on `span` and emit it as an event.
pub fn record_state_transition(span: &Span, from: TaskState, to: TaskState) {
    span.record("task.state", tracing::field::display(to));
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "state_transition");
    });
}
