//! Fan-out reverse proxy for the Blossom content-addressed blob-storage
//! protocol used by Nostr.
//!
//! One client-facing HTTP endpoint multiplexes uploads, mirror requests,
//! lookups, and deletions across a configured fleet of upstream Blossom
//! servers, providing redundancy (every blob on at least N backends), read
//! load distribution via redirects, and a unified catalog view. Blobs are
//! addressed by the lowercase hex SHA-256 digest of their content.
//!
//! # Module Map
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`client`] | One HTTP client per upstream server |
//! | [`auth`] | Nostr signed-event authorization (kind 24242) |
//! | [`cache`] | TTL+LRU digest→servers cache |
//! | [`stats`] | Per-server counters and health tracking |
//! | [`select`] | Selection strategies over candidate sets |
//! | [`upstream`] | Fan-out orchestration: upload, mirror, preflight, discovery, list merge, delete |
//! | [`handlers`] | HTTP surface binding routes to manager operations |
//! | [`health`] | Readiness verdict for `/health` |
//! | [`config`] | YAML configuration with env overrides |
//! | [`metrics`] | Prometheus metrics for `/metrics` |

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod homepage;
pub mod metrics;
pub mod select;
pub mod state;
pub mod stats;
pub mod upstream;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds. Returns 0 when the system clock reads
/// before the epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
