//! Per-peer operation statistics and health tracking.
//!
//! Every fan-out outcome is recorded here, per upstream server and per
//! operation kind. A server transitions to unhealthy exactly when its
//! consecutive failure count reaches `max_failures`, and back to healthy on
//! the next recorded success. `healthy_count` drives the readiness verdict;
//! `total_failures` drives the `health_based` selection strategy.

use crate::now_secs;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

/// Operation kinds tracked per server.
///
/// Downloads are redirect-only: the gateway never observes the transfer, so
/// there is a success counter but no failure signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upload,
    Download,
    Mirror,
    Delete,
    List,
}

/// Counters for a single upstream server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub url: String,

    pub uploads_success: u64,
    pub uploads_failure: u64,
    pub downloads: u64,
    pub mirrors_success: u64,
    pub mirrors_failure: u64,
    pub deletes_success: u64,
    pub deletes_failure: u64,
    pub lists_success: u64,
    pub lists_failure: u64,

    pub consecutive_failures: u32,
    pub is_healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<u64>,
}

impl ServerStats {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            uploads_success: 0,
            uploads_failure: 0,
            downloads: 0,
            mirrors_success: 0,
            mirrors_failure: 0,
            deletes_success: 0,
            deletes_failure: 0,
            lists_success: 0,
            lists_failure: 0,
            consecutive_failures: 0,
            is_healthy: true,
            last_success_time: None,
            last_failure_time: None,
        }
    }

    /// Cumulative failures across every operation kind.
    pub fn total_failures(&self) -> u64 {
        self.uploads_failure + self.mirrors_failure + self.deletes_failure + self.lists_failure
    }
}

/// Tracker for all upstream servers, keyed by official URL.
pub struct Stats {
    servers: RwLock<HashMap<String, ServerStats>>,
    max_failures: u32,
}

impl Stats {
    pub fn new(max_failures: u32) -> Self {
        Self {
            servers: RwLock::new(HashMap::new()),
            max_failures,
        }
    }

    /// Pre-create healthy entries for every configured server so the
    /// readiness signal is correct before any traffic arrives. Existing
    /// entries are left untouched.
    pub fn initialize_servers(&self, urls: &[String]) {
        let mut servers = self.servers.write();
        for url in urls {
            servers
                .entry(url.clone())
                .or_insert_with(|| ServerStats::new(url));
        }
    }

    pub fn record_success(&self, url: &str, op: Operation) {
        let mut servers = self.servers.write();
        let stats = servers
            .entry(url.to_string())
            .or_insert_with(|| ServerStats::new(url));

        stats.last_success_time = Some(now_secs());
        stats.consecutive_failures = 0;
        stats.is_healthy = true;

        match op {
            Operation::Upload => stats.uploads_success += 1,
            Operation::Download => stats.downloads += 1,
            Operation::Mirror => stats.mirrors_success += 1,
            Operation::Delete => stats.deletes_success += 1,
            Operation::List => stats.lists_success += 1,
        }
    }

    pub fn record_failure(&self, url: &str, op: Operation) {
        let mut servers = self.servers.write();
        let stats = servers
            .entry(url.to_string())
            .or_insert_with(|| ServerStats::new(url));

        stats.last_failure_time = Some(now_secs());
        stats.consecutive_failures += 1;
        if stats.consecutive_failures >= self.max_failures {
            stats.is_healthy = false;
        }

        match op {
            Operation::Upload => stats.uploads_failure += 1,
            Operation::Mirror => stats.mirrors_failure += 1,
            Operation::Delete => stats.deletes_failure += 1,
            Operation::List => stats.lists_failure += 1,
            // No failure signal exists for redirects
            Operation::Download => {}
        }
    }

    /// Number of servers currently marked healthy.
    pub fn healthy_count(&self) -> usize {
        self.servers
            .read()
            .values()
            .filter(|s| s.is_healthy)
            .count()
    }

    /// Cumulative failure count for one server (0 if unknown).
    pub fn total_failures(&self, url: &str) -> u64 {
        self.servers
            .read()
            .get(url)
            .map(|s| s.total_failures())
            .unwrap_or(0)
    }

    /// Copy of all server statistics.
    pub fn snapshot(&self) -> HashMap<String, ServerStats> {
        self.servers.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://a.example";

    #[test]
    fn test_success_increments_counter() {
        let stats = Stats::new(5);
        stats.record_success(URL, Operation::Upload);
        stats.record_success(URL, Operation::Upload);
        stats.record_success(URL, Operation::Download);
        let snapshot = stats.snapshot();
        let s = &snapshot[URL];
        assert_eq!(s.uploads_success, 2);
        assert_eq!(s.downloads, 1);
        assert!(s.is_healthy);
        assert!(s.last_success_time.is_some());
    }

    #[test]
    fn test_unhealthy_exactly_at_threshold() {
        let stats = Stats::new(3);
        stats.record_failure(URL, Operation::Upload);
        stats.record_failure(URL, Operation::Upload);
        assert_eq!(stats.healthy_count(), 1);
        stats.record_failure(URL, Operation::Upload);
        assert_eq!(stats.healthy_count(), 0);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot[URL].consecutive_failures, 3);
        assert!(!snapshot[URL].is_healthy);
    }

    #[test]
    fn test_success_resets_consecutive_failures_and_health() {
        let stats = Stats::new(2);
        stats.record_failure(URL, Operation::List);
        stats.record_failure(URL, Operation::List);
        assert_eq!(stats.healthy_count(), 0);
        stats.record_success(URL, Operation::List);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot[URL].consecutive_failures, 0);
        assert!(snapshot[URL].is_healthy);
        assert_eq!(stats.healthy_count(), 1);
    }

    #[test]
    fn test_total_failures_is_cumulative_across_ops() {
        let stats = Stats::new(100);
        stats.record_failure(URL, Operation::Upload);
        stats.record_failure(URL, Operation::Mirror);
        stats.record_failure(URL, Operation::Delete);
        stats.record_failure(URL, Operation::List);
        // A success resets consecutive failures, not cumulative ones
        stats.record_success(URL, Operation::Upload);
        assert_eq!(stats.total_failures(URL), 4);
        assert_eq!(stats.total_failures("https://unknown.example"), 0);
    }

    #[test]
    fn test_download_failure_bumps_health_but_no_counter() {
        let stats = Stats::new(1);
        stats.record_failure(URL, Operation::Download);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot[URL].total_failures(), 0);
        assert!(!snapshot[URL].is_healthy);
    }

    #[test]
    fn test_initialize_servers_starts_healthy_without_overwrite() {
        let stats = Stats::new(1);
        stats.record_failure(URL, Operation::Upload);
        stats.initialize_servers(&[URL.to_string(), "https://b.example".to_string()]);
        assert_eq!(stats.healthy_count(), 1);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot[URL].uploads_failure, 1);
        assert!(snapshot["https://b.example"].is_healthy);
    }
}
