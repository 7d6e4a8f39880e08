//! # ordq
//!
//! Priority task queue built on a transactional ordered key-value store.
//!
//! Tasks are ordered by `(priority, ready time, sequence)` purely through key
//! encoding, claimed with serializable transactions, and leased with a
//! visibility timeout after which unacknowledged work is requeued or
//! dead-lettered. Ships an in-memory MVCC store, a Postgres store, a worker
//! runtime, and OpenTelemetry observability.

pub mod config;
pub mod error;
pub mod kv;
pub mod model;
pub mod queue;
pub mod telemetry;
pub mod worker;
