//! Property-based tests for stats invariants.
//!
//! - Success counters never decrease
//! - Any recorded success resets consecutive failures to zero
//! - healthy ⇔ consecutive failures < max_failures

use blossom_gateway::stats::{Operation, Stats};
use proptest::prelude::*;

fn op_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Upload),
        Just(Operation::Mirror),
        Just(Operation::Delete),
        Just(Operation::List),
    ]
}

proptest! {
    /// Model-based check over arbitrary success/failure sequences.
    #[test]
    fn prop_stats_model(
        events in prop::collection::vec((any::<bool>(), op_strategy()), 1..300),
        max_failures in 1u32..6,
    ) {
        let stats = Stats::new(max_failures);
        let url = "https://peer.example";

        let mut model_consecutive = 0u32;
        let mut model_success_total = 0u64;
        let mut prev_success_total = 0u64;

        for (success, op) in events {
            if success {
                stats.record_success(url, op);
                model_consecutive = 0;
                model_success_total += 1;
            } else {
                stats.record_failure(url, op);
                model_consecutive += 1;
            }

            let snapshot = stats.snapshot();
            let server = &snapshot[url];
            prop_assert_eq!(server.consecutive_failures, model_consecutive);
            prop_assert_eq!(server.is_healthy, model_consecutive < max_failures);

            let success_total = server.uploads_success
                + server.mirrors_success
                + server.deletes_success
                + server.lists_success;
            prop_assert_eq!(success_total, model_success_total);
            prop_assert!(success_total >= prev_success_total);
            prev_success_total = success_total;
        }
    }

    /// total_failures accumulates across operations and never resets.
    #[test]
    fn prop_total_failures_cumulative(failures in 0usize..50, successes in 0usize..50) {
        let stats = Stats::new(1_000_000);
        let url = "https://peer.example";
        for _ in 0..failures {
            stats.record_failure(url, Operation::Upload);
        }
        for _ in 0..successes {
            stats.record_success(url, Operation::Upload);
        }
        prop_assert_eq!(stats.total_failures(url), failures as u64);
    }
}
