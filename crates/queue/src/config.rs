//! Queue and sweeper settings.

use std::time::Duration;

use jobforge_core::RetryPolicy;

/// Queue engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Lease granted on claim (and on each extension)
    pub lease_duration: Duration,
    /// Backoff applied to failed attempts
    pub retry: RetryPolicy,
    /// How often `QueueClient::wait_for` re-reads the store
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            retry: RetryPolicy::exponential(Duration::from_secs(1), Duration::from_secs(60)),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Maintenance sweeper settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweeperConfig {
    pub interval: Duration,
    /// Max stalled jobs recovered per queue per run
    pub stalled_limit: usize,
    /// Terminal jobs older than this are purged
    pub purge_grace: Duration,
    /// Max jobs purged per queue per run
    pub purge_limit: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            stalled_limit: 10,
            purge_grace: Duration::from_secs(24 * 60 * 60),
            purge_limit: 100,
        }
    }
}
