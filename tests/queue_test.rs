//! Queue operations against the in-memory store with a manual clock.

use ordq::config::QueueConfig;
use ordq::error::Error;
use ordq::kv::{KvStore, KvTxn, MemoryKv};
use ordq::model::{NackOptions, NewTask, QueueStats, Release, TaskId, TaskState};
use ordq::queue::{Clock, TaskFilter, TaskQueue, keys};
use serde_json::json;

const T0: u64 = 1_700_000_000_000;

fn test_queue(config: QueueConfig) -> (TaskQueue<MemoryKv>, Clock) {
    let clock = Clock::manual(T0);
    let queue = TaskQueue::new(MemoryKv::new(), config)
        .expect("valid config")
        .with_clock(clock.clone());
    (queue, clock)
}

fn default_queue() -> (TaskQueue<MemoryKv>, Clock) {
    test_queue(QueueConfig::new("jobs"))
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn lower_priority_first_then_fifo() {
    let (queue, _) = default_queue();
    let a = queue.enqueue(5, "A", None).await.unwrap();
    let b = queue.enqueue(1, "B", None).await.unwrap();
    let c = queue.enqueue(5, "C", None).await.unwrap();

    let mut order = Vec::new();
    while let Some(task) = queue.dequeue("w").await.unwrap() {
        queue.ack(&task.id).await.unwrap();
        order.push(task.id);
    }
    assert_eq!(order, vec![b, a, c]);
}

#[tokio::test]
async fn negative_priorities_sort_before_zero() {
    let (queue, _) = default_queue();
    for p in [0, 3, -7, i64::MAX, -1, i64::MIN] {
        queue.enqueue(p, p.to_string(), None).await.unwrap();
    }

    let mut seen = Vec::new();
    while let Some(task) = queue.dequeue("w").await.unwrap() {
        seen.push(task.priority);
    }
    assert_eq!(seen, vec![i64::MIN, -7, -1, 0, 3, i64::MAX]);
}

#[tokio::test]
async fn sequences_increase_per_enqueue() {
    let (queue, _) = default_queue();
    let first = queue.submit(NewTask::new(0, "x")).await.unwrap();
    let second = queue.submit(NewTask::new(0, "y")).await.unwrap();
    assert!(second.sequence > first.sequence);
    assert_eq!(first.state, TaskState::Pending);
    assert_eq!(first.ready_at, T0);
    assert_eq!(first.enqueued_at, T0);
    assert_eq!(first.retries, 0);
}

#[tokio::test]
async fn empty_queue_dequeues_none() {
    let (queue, _) = default_queue();
    assert!(queue.dequeue("w").await.unwrap().is_none());
}

#[tokio::test]
async fn payload_bytes_are_opaque() {
    let (queue, _) = default_queue();
    let payload = vec![0u8, 255, 1, 2, 0, 128];
    let id = queue.enqueue(1, payload.clone(), None).await.unwrap();
    let task = queue.dequeue("w").await.unwrap().unwrap();
    assert_eq!(task.id, id);
    assert_eq!(task.payload, payload);
}

// ---------------------------------------------------------------------------
// Claim / ack
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dequeue_leases_the_task() {
    let (queue, _) = test_queue(QueueConfig::new("jobs").with_visibility_timeout(5_000));
    let id = queue.enqueue(1, "x", None).await.unwrap();

    let task = queue.dequeue("worker-7").await.unwrap().unwrap();
    assert_eq!(task.id, id);
    assert_eq!(task.state, TaskState::Claimed);
    assert_eq!(task.claimed_by.as_deref(), Some("worker-7"));
    assert_eq!(task.claimed_at, Some(T0));
    assert_eq!(task.lease_expires_at, Some(T0 + 5_000));

    // Invisible while claimed.
    assert!(queue.dequeue("other").await.unwrap().is_none());
    assert_eq!(queue.get(&id).await.unwrap().unwrap().state, TaskState::Claimed);
}

#[tokio::test]
async fn ack_completes_for_good() {
    let (queue, clock) = default_queue();
    let id = queue.enqueue(1, "x", None).await.unwrap();
    queue.dequeue("w").await.unwrap().unwrap();

    clock.advance(10);
    queue.ack(&id).await.unwrap();

    let done = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(done.completed_at, Some(T0 + 10));
    assert!(queue.dequeue("w").await.unwrap().is_none());

    let err = queue.ack(&id).await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            state: TaskState::Completed,
            ..
        }
    ));
}

#[tokio::test]
async fn unknown_task_is_not_found() {
    let (queue, _) = default_queue();
    let ghost = TaskId::from("ghost");
    assert!(matches!(queue.ack(&ghost).await, Err(Error::NotFound(_))));
    assert!(matches!(queue.nack(&ghost).await, Err(Error::NotFound(_))));
    assert!(matches!(
        queue.extend_visibility(&ghost, 10).await,
        Err(Error::NotFound(_))
    ));
    assert!(queue.get(&ghost).await.unwrap().is_none());
}

#[tokio::test]
async fn settling_a_pending_task_is_invalid() {
    let (queue, _) = default_queue();
    let id = queue.enqueue(1, "x", None).await.unwrap();

    for err in [
        queue.ack(&id).await.unwrap_err(),
        queue.nack(&id).await.unwrap_err(),
        queue.extend_visibility(&id, 100).await.unwrap_err(),
    ] {
        assert!(matches!(
            err,
            Error::InvalidState {
                state: TaskState::Pending,
                ..
            }
        ));
    }
}

#[tokio::test]
async fn duplicate_ids_are_rejected() {
    let (queue, _) = default_queue();
    queue.submit(NewTask::new(1, "x").id("fixed")).await.unwrap();
    let err = queue.submit(NewTask::new(2, "y").id("fixed")).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(id) if id.as_str() == "fixed"));
}

#[tokio::test]
async fn empty_caller_id_is_rejected_without_wedging_the_queue() {
    let (queue, _) = default_queue();
    let err = queue.submit(NewTask::new(0, "x").id("")).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTaskId(_)));

    let y = queue.enqueue(5, "y", None).await.unwrap();
    assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, y);
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.total_enqueued, 1);
    assert_eq!(stats.pending, 0);
}

// ---------------------------------------------------------------------------
// Nack and retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn two_retries_then_dead_letter() {
    let (queue, _) = test_queue(QueueConfig::new("jobs").with_max_retries(2));
    let id = queue.enqueue(1, "x", None).await.unwrap();

    for expected_retries in 1..=2 {
        let task = queue.dequeue("w").await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(queue.nack(&id).await.unwrap(), Release::Requeued);
        let requeued = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(requeued.state, TaskState::Pending);
        assert_eq!(requeued.retries, expected_retries);
        assert_eq!(requeued.claimed_by, None);
    }

    queue.dequeue("w").await.unwrap().unwrap();
    assert_eq!(queue.nack(&id).await.unwrap(), Release::DeadLettered);

    let dead = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(dead.state, TaskState::DeadLettered);
    assert_eq!(dead.retries, 2);
    assert!(dead.dead_lettered_at.is_some());
    assert!(queue.dequeue("w").await.unwrap().is_none());

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.claimed, 0);
    assert_eq!(stats.total_dequeued, 3);
}

#[tokio::test]
async fn nack_requeues_behind_equal_priority_peers() {
    let (queue, _) = default_queue();
    let a = queue.enqueue(1, "A", None).await.unwrap();
    let b = queue.enqueue(1, "B", None).await.unwrap();

    assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, a);
    queue.nack(&a).await.unwrap();

    assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, b);
    assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, a);
}

#[tokio::test]
async fn nack_with_new_priority_and_delay() {
    let (queue, clock) = default_queue();
    let a = queue.enqueue(5, "A", None).await.unwrap();
    let b = queue.enqueue(3, "B", None).await.unwrap();

    assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, b);
    let opts = NackOptions::default().priority(-10).delay_ms(5_000);
    assert_eq!(queue.nack_with(&b, opts).await.unwrap(), Release::Requeued);

    // B is more urgent now, but not ready yet.
    assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, a);
    assert!(queue.dequeue("w").await.unwrap().is_none());

    clock.advance(5_000);
    let task = queue.dequeue("w").await.unwrap().unwrap();
    assert_eq!(task.id, b);
    assert_eq!(task.priority, -10);
    assert_eq!(task.retries, 1);
}

#[tokio::test]
async fn zero_max_retries_dead_letters_on_first_nack() {
    let (queue, _) = test_queue(QueueConfig::new("jobs").with_max_retries(0));
    let id = queue.enqueue(1, "x", None).await.unwrap();
    queue.dequeue("w").await.unwrap().unwrap();
    assert_eq!(queue.nack(&id).await.unwrap(), Release::DeadLettered);
}

// ---------------------------------------------------------------------------
// Delays, filters, leases
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delayed_task_waits_for_its_ready_time() {
    let (queue, clock) = default_queue();
    let later = queue
        .submit(NewTask::new(0, "later").delay_ms(1_000))
        .await
        .unwrap();
    let now = queue.enqueue(9, "now", None).await.unwrap();

    assert_eq!(later.ready_at, T0 + 1_000);
    assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, now);
    assert!(queue.dequeue("w").await.unwrap().is_none());

    clock.advance(999);
    assert!(queue.dequeue("w").await.unwrap().is_none());
    clock.advance(1);
    assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, later.id);
}

#[tokio::test]
async fn filtered_dequeue_skips_without_claiming() {
    let (queue, _) = default_queue();
    queue.submit(NewTask::new(1, "a").id("alpha-1")).await.unwrap();
    queue
        .submit(NewTask::new(2, "b").id("beta-1").metadata(json!({"kind": "mail"})))
        .await
        .unwrap();
    queue.submit(NewTask::new(3, "c").id("beta-2")).await.unwrap();

    let by_prefix = queue
        .dequeue_matching("w", &TaskFilter::prefix("beta-"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_prefix.id.as_str(), "beta-1");

    let by_ids = queue
        .dequeue_matching("w", &TaskFilter::ids(["beta-2", "missing"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_ids.id.as_str(), "beta-2");

    let wants_mail = TaskFilter::predicate(|_, metadata| {
        metadata.and_then(|m| m.get("kind")).is_some_and(|k| k == "mail")
    });
    assert!(queue.dequeue_matching("w", &wants_mail).await.unwrap().is_none());

    // Skipped tasks kept their place.
    let next = queue.dequeue("w").await.unwrap().unwrap();
    assert_eq!(next.id.as_str(), "alpha-1");
}

#[tokio::test]
async fn extend_visibility_moves_the_deadline() {
    let (queue, clock) = test_queue(QueueConfig::new("jobs").with_visibility_timeout(1_000));
    let id = queue.enqueue(1, "x", None).await.unwrap();
    queue.dequeue("w").await.unwrap().unwrap();

    let expires = queue.extend_visibility(&id, 4_000).await.unwrap();
    assert_eq!(expires, T0 + 5_000);
    assert_eq!(
        queue.get(&id).await.unwrap().unwrap().lease_expires_at,
        Some(T0 + 5_000)
    );

    clock.advance(1_000);
    assert_eq!(queue.sweep_expired().await.unwrap().reclaimed(), 0);
    clock.advance(4_000);
    assert_eq!(queue.sweep_expired().await.unwrap().requeued, 1);
}

// ---------------------------------------------------------------------------
// Dead-letter queue
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dead_lettered_task_is_forwarded() {
    let config = QueueConfig::new("jobs")
        .with_max_retries(0)
        .with_dead_letter_queue("jobs-dlq");
    let (queue, _) = test_queue(config.clone());
    let dlq = queue.sibling(config.dead_letter_config().unwrap()).unwrap();

    let id = queue
        .submit(NewTask::new(4, "boom").metadata(json!({"attempt": 1})))
        .await
        .unwrap()
        .id;
    queue.dequeue("w").await.unwrap().unwrap();
    assert_eq!(queue.nack(&id).await.unwrap(), Release::DeadLettered);

    let original = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(original.state, TaskState::DeadLettered);

    let copy = dlq.dequeue("janitor").await.unwrap().unwrap();
    assert_eq!(copy.id, id);
    assert_eq!(copy.queue, "jobs-dlq");
    assert_eq!(copy.payload, b"boom".to_vec());
    assert_eq!(copy.priority, 4);
    assert_eq!(copy.metadata, Some(json!({"attempt": 1})));
    assert_eq!(copy.retries, 0);

    assert_eq!(dlq.stats().await.unwrap().total_enqueued, 1);
    assert_eq!(queue.stats().await.unwrap().dead_lettered, 1);
}

// ---------------------------------------------------------------------------
// Isolation, stats, purge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queues_sharing_a_store_are_isolated() {
    let (jobs, _) = default_queue();
    let mail = jobs.sibling(QueueConfig::new("mail")).unwrap();

    let id = jobs.enqueue(1, "x", None).await.unwrap();
    assert!(mail.dequeue("w").await.unwrap().is_none());
    assert!(mail.get(&id).await.unwrap().is_none());
    assert_eq!(jobs.dequeue("w").await.unwrap().unwrap().id, id);
}

#[tokio::test]
async fn stats_track_every_transition() {
    let (queue, _) = test_queue(QueueConfig::new("jobs").with_max_retries(0));
    assert_eq!(queue.stats().await.unwrap(), QueueStats::default());

    let a = queue.enqueue(1, "a", None).await.unwrap();
    let b = queue.enqueue(2, "b", None).await.unwrap();
    queue.enqueue(3, "c", None).await.unwrap();

    assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, a);
    assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, b);
    queue.ack(&a).await.unwrap();
    queue.nack(&b).await.unwrap();

    assert_eq!(
        queue.stats().await.unwrap(),
        QueueStats {
            pending: 1,
            claimed: 0,
            completed: 1,
            dead_lettered: 1,
            total_enqueued: 3,
            total_dequeued: 2,
        }
    );
}

#[tokio::test]
async fn negative_counter_reads_as_zero() {
    let (queue, _) = default_queue();
    queue.enqueue(1, "x", None).await.unwrap();

    let mut txn = queue.store().begin().await.unwrap();
    txn.add_counter(&keys::counter_key("jobs", "pending"), -3)
        .await
        .unwrap();
    txn.commit().await.unwrap();

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.total_enqueued, 1);
}

#[tokio::test]
async fn purge_drops_only_retired_records() {
    let (queue, _) = test_queue(QueueConfig::new("jobs").with_max_retries(0));
    let done = queue.enqueue(1, "done", None).await.unwrap();
    let dead = queue.enqueue(2, "dead", None).await.unwrap();
    let live = queue.enqueue(3, "live", None).await.unwrap();

    queue.dequeue("w").await.unwrap().unwrap();
    queue.ack(&done).await.unwrap();
    queue.dequeue("w").await.unwrap().unwrap();
    queue.nack(&dead).await.unwrap();

    assert_eq!(queue.purge().await.unwrap(), 2);
    assert!(queue.get(&done).await.unwrap().is_none());
    assert!(queue.get(&dead).await.unwrap().is_none());
    assert_eq!(queue.get(&live).await.unwrap().unwrap().state, TaskState::Pending);

    // Counters are cumulative.
    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.dead_lettered, 1);

    assert_eq!(queue.purge().await.unwrap(), 0);
    assert_eq!(queue.dequeue("w").await.unwrap().unwrap().id, live);
}

#[tokio::test]
async fn purge_walks_past_one_batch() {
    let (queue, _) = default_queue();
    let mut ids = Vec::new();
    for i in 0..300 {
        ids.push(queue.enqueue(i, "x", None).await.unwrap());
    }
    for _ in 0..300 {
        let task = queue.dequeue("w").await.unwrap().unwrap();
        queue.ack(&task.id).await.unwrap();
    }
    assert_eq!(queue.purge().await.unwrap(), 300);
    assert!(queue.get(&ids[0]).await.unwrap().is_none());
    assert!(queue.get(&ids[299]).await.unwrap().is_none());
}

#[tokio::test]
async fn settled_tasks_leave_no_history_behind() {
    let (queue, _) = default_queue();
    for i in 0..500 {
        queue.enqueue(i % 7, "x", None).await.unwrap();
        let task = queue.dequeue("w").await.unwrap().unwrap();
        queue.ack(&task.id).await.unwrap();
    }
    // Only the retired records and the sequence key are still live.
    let store = queue.store();
    assert_eq!(store.len(), 501);
    assert_eq!(store.stored_versions(), store.len());

    assert_eq!(queue.purge().await.unwrap(), 500);
    assert_eq!(store.len(), 1);
    assert_eq!(store.stored_versions(), 1);
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let err = TaskQueue::new(MemoryKv::new(), QueueConfig::new("")).unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
