//! Smoke tests against a live OTLP collector with Tempo, Prometheus and Loki
//! behind it (collector on :4317).
//!
//! Run with:
//! ```sh
//! cargo test --test telemetry_smoke_test -- --ignored --nocapture
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use ordq::config::QueueConfig;
use ordq::kv::MemoryKv;
use ordq::model::TaskState;
use ordq::queue::TaskQueue;
use ordq::telemetry::task::{record_state_transition, start_task_span};
use ordq::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};

static TELEMETRY: OnceLock<TelemetryGuard> = OnceLock::new();

fn ensure_telemetry() -> &'static TelemetryGuard {
    TELEMETRY.get_or_init(|| {
        init_telemetry(
            TelemetryConfig::new("ordq-smoke-test")
                .with_endpoint("http://localhost:4317")
                .with_log_level("debug")
                .with_queue("smoke"),
        )
        .expect("failed to init telemetry")
    })
}

async fn flush_and_wait(guard: &TelemetryGuard) {
    guard.force_flush();
    tokio::time::sleep(Duration::from_secs(8)).await;
}

/// Drive one task through the queue so every signal has something in it.
async fn run_one_task() {
    let queue = TaskQueue::new(MemoryKv::new(), QueueConfig::new("smoke")).unwrap();
    let id = queue.enqueue(1, "payload", None).await.unwrap();
    let task = queue.dequeue("smoke-worker").await.unwrap().unwrap();
    assert_eq!(task.id, id);

    let span = start_task_span(queue.name(), &task.id, "smoke-worker");
    let _enter = span.enter();
    record_state_transition(&span, TaskState::Pending, TaskState::Claimed);
    queue.ack(&task.id).await.unwrap();
    record_state_transition(&span, TaskState::Claimed, TaskState::Completed);
    tracing::info!(task_id = %task.id, "smoke task completed");
}

#[test]
#[ignore]
fn smoke_traces() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        run_one_task().await;
        flush_and_wait(guard).await;

        let resp = reqwest::Client::new()
            .get("http://localhost:3200/api/search")
            .query(&[("tags", "service.name=ordq-smoke-test"), ("limit", "5")])
            .send()
            .await
            .expect("failed to query Tempo");
        assert!(resp.status().is_success(), "Tempo query failed: {}", resp.status());

        let body: serde_json::Value = resp.json().await.expect("failed to parse Tempo response");
        let traces = body["traces"].as_array();
        assert!(
            traces.is_some_and(|t| !t.is_empty()),
            "expected traces in Tempo, got: {body}"
        );
    });
}

#[test]
#[ignore]
fn smoke_metrics() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        run_one_task().await;
        flush_and_wait(guard).await;

        let resp = reqwest::Client::new()
            .get("http://localhost:9090/api/v1/query")
            .query(&[("query", "ordq_queue_operations_total")])
            .send()
            .await
            .expect("failed to query Prometheus");
        assert!(resp.status().is_success(), "Prometheus query failed: {}", resp.status());

        let body: serde_json::Value = resp.json().await.expect("failed to parse Prometheus response");
        let results = body["data"]["result"].as_array();
        assert!(
            results.is_some_and(|r| !r.is_empty()),
            "expected metric results in Prometheus, got: {body}"
        );
    });
}

#[test]
#[ignore]
fn smoke_logs() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let guard = ensure_telemetry();
        run_one_task().await;
        tracing::warn!(component = "smoke-test", "smoke test warning log");
        flush_and_wait(guard).await;

        let resp = reqwest::Client::new()
            .get("http://localhost:3100/loki/api/v1/query_range")
            .query(&[
                ("query", r#"{service_name="ordq-smoke-test"}"#),
                ("limit", "10"),
            ])
            .send()
            .await
            .expect("failed to query Loki");
        assert!(resp.status().is_success(), "Loki query failed: {}", resp.status());

        let body: serde_json::Value = resp.json().await.expect("failed to parse Loki response");
        let streams = body["data"]["result"].as_array();
        assert!(
            streams.is_some_and(|s| !s.is_empty()),
            "expected log streams in Loki, got: {body}"
        );
    });
}
