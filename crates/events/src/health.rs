//! Worker liveness events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness classification derived from consecutive probe failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// Some probes failed, below the restart threshold
    Degraded,
    /// `max_retries` consecutive probes failed
    Unresponsive,
    /// The worker reported a fatal condition
    Failed,
}

impl HealthStatus {
    /// Whether this status asks the supervisor to restart the worker.
    pub fn requires_restart(self) -> bool {
        matches!(self, HealthStatus::Unresponsive | HealthStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unresponsive => "unresponsive",
            HealthStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource usage reported by the worker process.
///
/// Fields are optional because not every platform exposes them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ProcessMetrics {
    /// Resident set size in bytes.
    pub memory_rss_bytes: Option<u64>,
    /// User + system CPU time consumed so far.
    pub cpu_time_ms: Option<u64>,
    /// Time since the worker started.
    pub uptime_ms: Option<u64>,
    /// Probe round-trip latency measured by the supervisor.
    pub latency_ms: Option<u64>,
}

/// One heartbeat status change, as seen by external health subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthEvent {
    pub status: HealthStatus,
    pub previous: HealthStatus,
    pub metrics: ProcessMetrics,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
}

impl HealthEvent {
    pub fn restart_required(&self) -> bool {
        self.status.requires_restart()
    }
}
