//! Peer selection strategies.
//!
//! Strategies are pure rules over a candidate set; the only mutable state is
//! the round-robin counter, serialised under its own lock. One counter is
//! shared by every pick: upload representatives, download redirects, and the
//! inner rotation of `health_based` all advance it.

use crate::stats::Stats;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

/// Closed set of selection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    RoundRobin,
    Random,
    /// Lowest configured priority wins, ties broken by input order
    Priority,
    /// Fewest cumulative failures, round-robin within the tie group
    HealthBased,
    /// Response URLs are built from the gateway's own base URL; as a
    /// download redirect strategy this behaves like round_robin
    Local,
}

impl Strategy {
    /// Parse a configured strategy name. Unknown names fall back to
    /// round_robin with a warning.
    pub fn parse(name: &str) -> Self {
        match name {
            "round_robin" => Strategy::RoundRobin,
            "random" => Strategy::Random,
            "priority" => Strategy::Priority,
            "health_based" => Strategy::HealthBased,
            "local" => Strategy::Local,
            other => {
                warn!(strategy = other, "Unknown strategy, using round_robin");
                Strategy::RoundRobin
            }
        }
    }
}

/// Stateful picker over candidate server lists.
pub struct Selector {
    round_robin: Mutex<u64>,
    /// Configured priority per official URL (for `priority`)
    priorities: HashMap<String, i32>,
    /// Failure source for `health_based`; without one the strategy falls
    /// back to round_robin
    stats: Option<Arc<Stats>>,
}

impl Selector {
    pub fn new(priorities: HashMap<String, i32>, stats: Option<Arc<Stats>>) -> Self {
        Self {
            round_robin: Mutex::new(0),
            priorities,
            stats,
        }
    }

    fn next_round_robin(&self, len: usize) -> usize {
        let mut counter = self.round_robin.lock();
        let index = (*counter % len as u64) as usize;
        *counter += 1;
        index
    }

    /// Pick one candidate index according to `strategy`.
    /// Returns None only for an empty candidate list.
    pub fn pick<S: AsRef<str>>(&self, strategy: Strategy, candidates: &[S]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        let index = match strategy {
            Strategy::RoundRobin | Strategy::Local => self.next_round_robin(candidates.len()),
            Strategy::Random => rand::rng().random_range(0..candidates.len()),
            Strategy::Priority => {
                (0..candidates.len()).min_by_key(|&i| {
                    self.priorities
                        .get(candidates[i].as_ref())
                        .copied()
                        .unwrap_or(i32::MAX)
                })?
            }
            Strategy::HealthBased => match &self.stats {
                None => self.next_round_robin(candidates.len()),
                Some(stats) => {
                    let failures: Vec<u64> = candidates
                        .iter()
                        .map(|c| stats.total_failures(c.as_ref()))
                        .collect();
                    let min = *failures.iter().min()?;
                    let group: Vec<usize> = (0..candidates.len())
                        .filter(|&i| failures[i] == min)
                        .collect();
                    group[self.next_round_robin(group.len())]
                }
            },
        };

        Some(index)
    }
}
