use proptest::prelude::*;
use serde_json::json;
use vigild::core::telemetry::TelemetryQueue;

const CAP: u64 = 5;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// The queue size never exceeds the configured cap, whatever the
    /// interleaving of enqueue / mark_sent / mark_failed.
    #[test]
    fn queue_size_bounded(ops in prop::collection::vec(0u8..3u8, 1..60)) {
        let dir = tempfile::tempdir().unwrap();
        let queue = TelemetryQueue::open(&dir.path().join("q.db"), CAP).unwrap();

        for (i, op) in ops.iter().enumerate() {
            match op {
                0 => {
                    queue.enqueue(&json!({ "n": i })).unwrap();
                }
                1 => {
                    if let Some(front) = queue.dequeue(1).unwrap().first() {
                        queue.mark_sent(front.id).unwrap();
                    }
                }
                _ => {
                    if let Some(front) = queue.dequeue(1).unwrap().first() {
                        queue.mark_failed(front.id, 3).unwrap();
                    }
                }
            }
            prop_assert!(queue.len() <= CAP);
        }
    }

    /// Dequeue returns entries in insertion order once the cap has evicted
    /// the oldest entries.
    #[test]
    fn queue_is_fifo_under_eviction(count in 1usize..20) {
        let dir = tempfile::tempdir().unwrap();
        let queue = TelemetryQueue::open(&dir.path().join("q.db"), CAP).unwrap();

        let mut ids = Vec::new();
        for i in 0..count {
            ids.push(queue.enqueue(&json!({ "n": i })).unwrap());
        }
        let expected: Vec<i64> = ids
            .iter()
            .copied()
            .skip(count.saturating_sub(CAP as usize))
            .collect();
        let got: Vec<i64> = queue.dequeue(100).unwrap().iter().map(|e| e.id).collect();
        prop_assert_eq!(got, expected);
    }

    /// Retry counts are monotonic until the entry disappears.
    #[test]
    fn retry_count_monotonic(failures in 1u32..6) {
        let dir = tempfile::tempdir().unwrap();
        let queue = TelemetryQueue::open(&dir.path().join("q.db"), CAP).unwrap();
        let id = queue.enqueue(&json!({ "n": 0 })).unwrap();

        let max_retries = 3;
        let mut last_seen = 0;
        for _ in 0..failures {
            let still_queued = queue.mark_failed(id, max_retries).unwrap();
            if !still_queued {
                prop_assert_eq!(queue.len(), 0);
                break;
            }
            let entry = &queue.dequeue(1).unwrap()[0];
            prop_assert!(entry.retry_count > last_seen);
            last_seen = entry.retry_count;
            prop_assert!(entry.retry_count < max_retries);
        }
    }
}
