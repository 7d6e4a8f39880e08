//! Key layout: ordering and decoding.

use ordq::error::Error;
use ordq::kv::prefix_end;
use ordq::model::TaskId;
use ordq::queue::keys::{
    self, LeaseKey, QueueKey, decode_priority, encode_priority, expired_lease_range, pending_range,
};

// ---------------------------------------------------------------------------
// Priority bias
// ---------------------------------------------------------------------------

#[test]
fn priority_bias_preserves_order() {
    let priorities = [i64::MIN, -1_000, -1, 0, 1, 7, 1_000, i64::MAX];
    let biased: Vec<u64> = priorities.iter().map(|&p| encode_priority(p)).collect();

    assert!(biased.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(encode_priority(i64::MIN), 0);
    assert_eq!(encode_priority(0), 1 << 63);
    for p in priorities {
        assert_eq!(decode_priority(encode_priority(p)), p);
    }
}

// ---------------------------------------------------------------------------
// Pending keys
// ---------------------------------------------------------------------------

#[test]
fn queue_key_decodes_what_it_encodes() {
    let key = QueueKey::new("emails", -42, 1_700_000_000_000, 9, "task-1");
    let decoded = QueueKey::decode(&key.encode()).unwrap();
    assert_eq!(decoded, key);

    let zero = QueueKey::new("q", 0, 0, 0, "t");
    assert_eq!(QueueKey::decode(&zero.encode()).unwrap(), zero);
}

#[test]
fn byte_order_matches_tuple_order() {
    let keys = vec![
        QueueKey::new("q", -5, 100, 1, "z"),
        QueueKey::new("q", -5, 100, 2, "a"),
        QueueKey::new("q", -5, 200, 0, "a"),
        QueueKey::new("q", 0, 0, 0, "a"),
        QueueKey::new("q", 0, 0, 0, "b"),
        QueueKey::new("q", 3, 0, 0, "a"),
        QueueKey::new("q", 3, 0, 256, "a"),
        QueueKey::new("q", i64::MAX, 0, 0, "a"),
    ];

    let mut by_bytes = keys.clone();
    by_bytes.sort_by_key(|k| k.encode());
    let mut by_tuple = keys.clone();
    by_tuple.sort();

    assert_eq!(by_bytes, keys);
    assert_eq!(by_tuple, keys);
}

#[test]
fn pending_range_covers_only_its_queue() {
    let (start, end) = pending_range("alpha");
    let inside = QueueKey::new("alpha", i64::MAX, u64::MAX, u64::MAX, "x").encode();
    let first = QueueKey::new("alpha", i64::MIN, 0, 0, "x").encode();
    let other = QueueKey::new("alphabet", 0, 0, 0, "x").encode();
    let lease = LeaseKey::new("alpha", 0, "x").encode();

    assert!(start <= first && first < end);
    assert!(start <= inside && inside < end);
    assert!(!(start <= other && other < end));
    assert!(!(start <= lease && lease < end));
}

#[test]
fn rejects_malformed_pending_keys() {
    let good = QueueKey::new("q", 1, 2, 3, "task").encode();

    // Truncated inside the fixed-width fields.
    let err = QueueKey::decode(&good[..good.len() - 10]).unwrap_err();
    assert!(matches!(err, Error::MalformedKey(_)));

    // No task id.
    let err = QueueKey::decode(&good[..good.len() - 4]).unwrap_err();
    assert!(matches!(err, Error::MalformedKey(_)));

    // Wrong partition tag.
    let lease = LeaseKey::new("q", 5, "task").encode();
    assert!(matches!(QueueKey::decode(&lease), Err(Error::MalformedKey(_))));

    // Name length pointing past the end.
    let mut bogus = vec![b'Q'];
    bogus.extend_from_slice(&1000u32.to_be_bytes());
    bogus.extend_from_slice(b"q");
    assert!(matches!(QueueKey::decode(&bogus), Err(Error::MalformedKey(_))));

    assert!(matches!(QueueKey::decode(&[]), Err(Error::MalformedKey(_))));
}

// ---------------------------------------------------------------------------
// Lease keys and the rest
// ---------------------------------------------------------------------------

#[test]
fn lease_keys_sort_by_expiry() {
    let early = LeaseKey::new("q", 1_000, "zzz");
    let late = LeaseKey::new("q", 2_000, "aaa");
    assert!(early.encode() < late.encode());
    assert_eq!(LeaseKey::decode(&late.encode()).unwrap(), late);
}

#[test]
fn expired_lease_range_is_inclusive_of_now() {
    let (start, end) = expired_lease_range("q", 1_000);
    let at_now = LeaseKey::new("q", 1_000, "a").encode();
    let before = LeaseKey::new("q", 999, "a").encode();
    let after = LeaseKey::new("q", 1_001, "a").encode();

    assert!(start <= before && before < end);
    assert!(start <= at_now && at_now < end);
    assert!(after >= end);

    let (_, end_max) = expired_lease_range("q", u64::MAX);
    let (lease_start, _) = expired_lease_range("q", 0);
    assert_eq!(end_max, prefix_end(&lease_start));
}

#[test]
fn task_index_key_round_trips_id() {
    let id = TaskId::from("abc-123");
    let key = keys::task_key("q", &id);
    assert_eq!(keys::task_id_from_key("q", &key).unwrap(), id);
    assert!(matches!(
        keys::task_id_from_key("other", &key),
        Err(Error::MalformedKey(_))
    ));
}

#[test]
fn queue_namespaces_are_disjoint() {
    assert_ne!(keys::sequence_key("a"), keys::sequence_key("b"));
    assert_ne!(
        keys::counter_key("a", "pending"),
        keys::counter_key("a", "claimed")
    );
    let (start, end) = keys::task_range("a");
    let foreign = keys::task_key("ab", &TaskId::from("x"));
    assert!(!(start <= foreign && foreign < end));
}
