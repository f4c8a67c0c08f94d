//! Shared application state for HTTP handlers.

use crate::auth::Verifier;
use crate::cache::HashCache;
use crate::config::Config;
use crate::health::HealthReporter;
use crate::metrics::Metrics;
use crate::stats::Stats;
use crate::upstream::Manager;
use std::sync::Arc;

/// Everything a handler needs, constructed once at startup and shared
/// behind an `Arc`. All cross-request state (cache, stats, round-robin
/// counter) lives in the collaborators, never in globals.
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<Manager>,
    pub cache: Arc<HashCache>,
    pub stats: Arc<Stats>,
    pub verifier: Arc<Verifier>,
    pub metrics: Metrics,
    pub health: HealthReporter,
}
