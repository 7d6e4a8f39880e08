//! Metric instruments for ordq.
//!
//! Instruments come from the globally-registered `MeterProvider`, so they are
//! no-ops until [`super::init_telemetry`] installs an exporter.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("ordq")
}

/// Counter: queue operations.
/// Labels: `queue`, `operation` ("enqueue" | "dequeue" | "ack" | "nack" | "extend" | "purge").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("ordq.queue.operations")
        .with_description("Number of queue operations")
        .build()
}

/// Counter: task state transitions.
/// Labels: `queue`, `from`, `to`.
pub fn task_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("ordq.task.state_transitions")
        .with_description("Number of task state transitions")
        .build()
}

/// Counter: transactions retried after a serializable conflict.
/// Labels: `queue`, `operation`.
pub fn claim_conflicts() -> Counter<u64> {
    meter()
        .u64_counter("ordq.claim.conflicts")
        .with_description("Transactions that lost to a concurrent commit")
        .build()
}

/// Counter: expired leases released by a sweep.
/// Labels: `queue`, `outcome` ("requeued" | "dead_lettered").
pub fn sweep_reclaimed() -> Counter<u64> {
    meter()
        .u64_counter("ordq.sweep.reclaimed")
        .with_description("Expired claims returned to the queue or dead-lettered")
        .build()
}

/// Histogram: operation duration in milliseconds.
/// Labels: `queue`, `operation`.
pub fn operation_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("ordq.operation.duration_ms")
        .with_description("Operation duration in milliseconds")
        .with_unit("ms")
        .build()
}
