//! Property-based tests for quorum aggregation.
//!
//! With >= N successes the verdict is Ok and never QuorumFailed; otherwise
//! the verdict carries min(status across failing peers), defaulting to 500
//! when no failing peer produced a status.

use crate::strategies::*;
use blossom_gateway::error::GatewayError;
use blossom_gateway::upstream::{Fanout, UploadOutcome};
use proptest::prelude::*;

fn outcome_strategy() -> impl Strategy<Value = UploadOutcome> {
    (
        any::<bool>(),
        prop::option::of(failure_status_strategy()),
        server_url_strategy(),
    )
        .prop_map(|(success, status, server_url)| {
            if success {
                UploadOutcome {
                    server_url,
                    success: true,
                    status: 0,
                    body: Default::default(),
                    error: None,
                }
            } else {
                UploadOutcome {
                    server_url,
                    success: false,
                    // None models a transport-level failure with no status
                    status: status.unwrap_or(0),
                    body: Default::default(),
                    error: Some("failed".to_string()),
                }
            }
        })
}

proptest! {
    #[test]
    fn prop_quorum_determinism(
        outcomes in prop::collection::vec(outcome_strategy(), 0..10),
        required in 1usize..5,
    ) {
        let fanout = Fanout { outcomes };
        let successes = fanout.outcomes.iter().filter(|o| o.success).count();

        match fanout.quorum(required) {
            Ok(()) => prop_assert!(successes >= required),
            Err(GatewayError::QuorumFailed { succeeded, status, .. }) => {
                prop_assert!(successes < required);
                prop_assert_eq!(succeeded, successes);
                let min = fanout
                    .outcomes
                    .iter()
                    .filter(|o| !o.success && o.status > 0)
                    .map(|o| o.status)
                    .min();
                prop_assert_eq!(status.as_u16(), min.unwrap_or(500));
            }
            Err(other) => prop_assert!(false, "unexpected error {:?}", other),
        }
    }
}
