//! Property-based tests for selection strategies.
//!
//! - round_robin advances by exactly one per pick
//! - priority returns the first candidate with the minimum priority
//! - health_based always lands in the argmin-failures subset

use blossom_gateway::select::{Selector, Strategy};
use blossom_gateway::stats::{Operation, Stats};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

proptest! {
    /// round_robin visits indices in order, one step per call.
    #[test]
    fn prop_round_robin_steps(len in 1usize..10, picks in 1usize..30) {
        let selector = Selector::new(HashMap::new(), None);
        let candidates: Vec<String> =
            (0..len).map(|i| format!("https://peer{i}.example")).collect();
        for i in 0..picks {
            let picked = selector.pick(Strategy::RoundRobin, &candidates).unwrap();
            prop_assert_eq!(picked, i % len);
        }
    }

    /// priority returns the minimum, ties broken by input order.
    #[test]
    fn prop_priority_returns_minimum(priorities in prop::collection::vec(-10i32..10, 1..10)) {
        let candidates: Vec<String> = (0..priorities.len())
            .map(|i| format!("https://peer{i}.example"))
            .collect();
        let map: HashMap<String, i32> = candidates
            .iter()
            .cloned()
            .zip(priorities.iter().copied())
            .collect();
        let selector = Selector::new(map, None);

        let picked = selector.pick(Strategy::Priority, &candidates).unwrap();
        let min = *priorities.iter().min().unwrap();
        prop_assert_eq!(priorities[picked], min);
        let first_min = priorities.iter().position(|&p| p == min).unwrap();
        prop_assert_eq!(picked, first_min);
    }

    /// health_based only ever picks candidates with the fewest cumulative failures.
    #[test]
    fn prop_health_based_argmin(failure_counts in prop::collection::vec(0u64..5, 1..8)) {
        let stats = Arc::new(Stats::new(1_000_000));
        let candidates: Vec<String> = (0..failure_counts.len())
            .map(|i| format!("https://peer{i}.example"))
            .collect();
        for (url, &count) in candidates.iter().zip(&failure_counts) {
            for _ in 0..count {
                stats.record_failure(url, Operation::Upload);
            }
        }

        let selector = Selector::new(HashMap::new(), Some(stats));
        let picked = selector.pick(Strategy::HealthBased, &candidates).unwrap();
        let min = *failure_counts.iter().min().unwrap();
        prop_assert_eq!(failure_counts[picked], min);
    }

    /// random never leaves the candidate bounds.
    #[test]
    fn prop_random_in_bounds(len in 1usize..10) {
        let selector = Selector::new(HashMap::new(), None);
        let candidates: Vec<String> = (0..len).map(|i| format!("p{i}")).collect();
        let picked = selector.pick(Strategy::Random, &candidates).unwrap();
        prop_assert!(picked < len);
    }
}
