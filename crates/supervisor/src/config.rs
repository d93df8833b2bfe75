//! Supervisor, heartbeat and dispatcher settings.

use std::time::Duration;

use jobforge_core::{RetryPolicy, WorkerId};

/// Heartbeat probing. `timeout` should stay below `interval`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failures that mark the worker unresponsive
    pub max_retries: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    /// Delay before restart number `n` is `restart_policy.delay_for_attempt(n)`
    pub restart_policy: RetryPolicy,
    /// Default timeout for requests sent to the worker
    pub request_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            restart_policy: RetryPolicy::fixed(Duration::from_secs(2)),
            request_timeout: Duration::from_secs(30),
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    pub queue: String,
    /// Lease holder identity used for claims
    pub worker_id: WorkerId,
    pub lease_duration: Duration,
    /// Sleep between claims when the queue is empty
    pub poll_interval: Duration,
    /// Timeout of one `execute` request
    pub execute_timeout: Duration,
    /// How far a claimed job is pushed back when the worker is down
    pub unavailable_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue: "default".to_string(),
            worker_id: WorkerId::generate("dispatcher"),
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            execute_timeout: Duration::from_secs(30),
            unavailable_delay: Duration::from_secs(1),
        }
    }
}
