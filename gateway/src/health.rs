//! Readiness reporting.
//!
//! The verdict combines three independent checks: enough healthy upstream
//! servers, process-resident memory under its limit, and active fan-out
//! tasks under their limit. `GET /health` answers 200 when all three pass
//! and 503 otherwise, with the per-check and per-server breakdown in the
//! body.

use crate::config::ServerConfig;
use crate::stats::Stats;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// One bounded resource check.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceCheck {
    pub current: u64,
    pub max: u64,
    pub healthy: bool,
}

/// Health of one upstream server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
}

/// Full readiness verdict, serialised as the /health response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub healthy_count: usize,
    pub min_upload_servers: usize,
    pub memory: ResourceCheck,
    pub tasks: ResourceCheck,
    pub servers: HashMap<String, ServerHealth>,
}

/// Aggregates peer health and process-level bounds into one verdict.
pub struct HealthReporter {
    stats: Arc<Stats>,
    min_upload_servers: usize,
    max_memory_bytes: u64,
    max_tasks: usize,
}

impl HealthReporter {
    pub fn new(stats: Arc<Stats>, config: &ServerConfig) -> Self {
        Self {
            stats,
            min_upload_servers: config.min_upload_servers,
            max_memory_bytes: config.max_memory_bytes,
            max_tasks: config.max_tasks,
        }
    }

    /// Build the verdict from the current process state.
    pub fn report(&self, active_tasks: usize) -> HealthReport {
        // Physical (resident) memory; 0 when the platform offers no reading
        let memory_bytes = memory_stats::memory_stats()
            .map(|usage| usage.physical_mem as u64)
            .unwrap_or(0);
        self.evaluate(memory_bytes, active_tasks)
    }

    fn evaluate(&self, memory_bytes: u64, active_tasks: usize) -> HealthReport {
        let healthy_count = self.stats.healthy_count();
        let servers_healthy = healthy_count >= self.min_upload_servers;
        let memory_healthy = memory_bytes < self.max_memory_bytes;
        let tasks_healthy = active_tasks < self.max_tasks;

        let servers = self
            .stats
            .snapshot()
            .into_iter()
            .map(|(url, stats)| {
                (
                    url,
                    ServerHealth {
                        healthy: stats.is_healthy,
                        consecutive_failures: stats.consecutive_failures,
                    },
                )
            })
            .collect();

        HealthReport {
            healthy: servers_healthy && memory_healthy && tasks_healthy,
            healthy_count,
            min_upload_servers: self.min_upload_servers,
            memory: ResourceCheck {
                current: memory_bytes,
                max: self.max_memory_bytes,
                healthy: memory_healthy,
            },
            tasks: ResourceCheck {
                current: active_tasks as u64,
                max: self.max_tasks as u64,
                healthy: tasks_healthy,
            },
            servers,
        }
    }
}
