//! Environment-driven configuration.
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | unset → in-memory store |
//! | `JOBFORGE_QUEUES` | `default` (comma separated) |
//! | `JOBFORGE_WORKER_BIN` | `jobforge-worker` |
//! | `JOBFORGE_LEASE_MS` | 30000 |
//! | `JOBFORGE_RETRY_BASE_MS` / `JOBFORGE_RETRY_MAX_MS` | 1000 / 60000 |
//! | `JOBFORGE_POLL_INTERVAL_MS` | 1000 |
//! | `JOBFORGE_SWEEP_INTERVAL_MS` | 15000 |
//! | `JOBFORGE_STALLED_LIMIT` / `JOBFORGE_PURGE_LIMIT` | 10 / 100 |
//! | `JOBFORGE_PURGE_GRACE_MS` | 86400000 |
//! | `JOBFORGE_MAX_RESTARTS` | 5 |
//! | `JOBFORGE_RESTART_DELAY_MS` | 2000 |
//! | `JOBFORGE_REQUEST_TIMEOUT_MS` | 30000 |
//! | `JOBFORGE_HEARTBEAT_INTERVAL_MS` / `_TIMEOUT_MS` / `_MAX_RETRIES` | 5000 / 2000 / 3 |

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use jobforge_core::RetryPolicy;
use jobforge_queue::{QueueConfig, SweeperConfig};
use jobforge_supervisor::{HeartbeatConfig, SupervisorConfig};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?} as a number")]
    InvalidNumber { var: &'static str, value: String },

    #[error("{var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Postgres connection string; `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub queues: Vec<String>,
    pub worker_program: PathBuf,
    pub queue: QueueConfig,
    pub sweeper: SweeperConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            queues: vec!["default".to_string()],
            worker_program: PathBuf::from("jobforge-worker"),
            queue: QueueConfig::default(),
            sweeper: SweeperConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset or blank variables
    /// keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = RuntimeConfig::default();

        let queues = match get("JOBFORGE_QUEUES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .collect(),
            None => defaults.queues,
        };
        if queues.is_empty() {
            return Err(ConfigError::Invalid {
                var: "JOBFORGE_QUEUES",
                reason: "at least one queue name is required".to_string(),
            });
        }

        let queue = QueueConfig {
            lease_duration: millis(&get, "JOBFORGE_LEASE_MS", defaults.queue.lease_duration)?,
            retry: RetryPolicy::exponential(
                millis(&get, "JOBFORGE_RETRY_BASE_MS", defaults.queue.retry.base_delay)?,
                millis(&get, "JOBFORGE_RETRY_MAX_MS", defaults.queue.retry.max_delay)?,
            ),
            poll_interval: millis(&get, "JOBFORGE_POLL_INTERVAL_MS", defaults.queue.poll_interval)?,
        };

        let sweeper = SweeperConfig {
            interval: millis(&get, "JOBFORGE_SWEEP_INTERVAL_MS", defaults.sweeper.interval)?,
            stalled_limit: number(&get, "JOBFORGE_STALLED_LIMIT", defaults.sweeper.stalled_limit)?,
            purge_grace: millis(&get, "JOBFORGE_PURGE_GRACE_MS", defaults.sweeper.purge_grace)?,
            purge_limit: number(&get, "JOBFORGE_PURGE_LIMIT", defaults.sweeper.purge_limit)?,
        };

        let heartbeat = HeartbeatConfig {
            interval: millis(
                &get,
                "JOBFORGE_HEARTBEAT_INTERVAL_MS",
                defaults.supervisor.heartbeat.interval,
            )?,
            timeout: millis(
                &get,
                "JOBFORGE_HEARTBEAT_TIMEOUT_MS",
                defaults.supervisor.heartbeat.timeout,
            )?,
            max_retries: number(
                &get,
                "JOBFORGE_HEARTBEAT_MAX_RETRIES",
                defaults.supervisor.heartbeat.max_retries,
            )?,
        };

        let supervisor = SupervisorConfig {
            max_restarts: number(&get, "JOBFORGE_MAX_RESTARTS", defaults.supervisor.max_restarts)?,
            restart_policy: RetryPolicy::fixed(millis(
                &get,
                "JOBFORGE_RESTART_DELAY_MS",
                defaults.supervisor.restart_policy.base_delay,
            )?),
            request_timeout: millis(
                &get,
                "JOBFORGE_REQUEST_TIMEOUT_MS",
                defaults.supervisor.request_timeout,
            )?,
            heartbeat,
        };

        let config = Self {
            database_url: get("DATABASE_URL"),
            queues,
            worker_program: get("JOBFORGE_WORKER_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.worker_program),
            queue,
            sweeper,
            supervisor,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.lease_duration.is_zero() {
            return Err(ConfigError::Invalid {
                var: "JOBFORGE_LEASE_MS",
                reason: "lease duration must be positive".to_string(),
            });
        }
        if self.queue.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "JOBFORGE_POLL_INTERVAL_MS",
                reason: "poll interval must be positive".to_string(),
            });
        }
        if self.sweeper.interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: "JOBFORGE_SWEEP_INTERVAL_MS",
                reason: "sweep interval must be positive".to_string(),
            });
        }
        if self.queue.retry.base_delay > self.queue.retry.max_delay {
            return Err(ConfigError::Invalid {
                var: "JOBFORGE_RETRY_BASE_MS",
                reason: "base retry delay exceeds the maximum".to_string(),
            });
        }
        let heartbeat = &self.supervisor.heartbeat;
        if heartbeat.timeout >= heartbeat.interval {
            return Err(ConfigError::Invalid {
                var: "JOBFORGE_HEARTBEAT_TIMEOUT_MS",
                reason: "heartbeat timeout must be shorter than the interval".to_string(),
            });
        }
        if heartbeat.max_retries == 0 {
            return Err(ConfigError::Invalid {
                var: "JOBFORGE_HEARTBEAT_MAX_RETRIES",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn number<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
    }
}

fn millis(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    number(get, var, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<RuntimeConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RuntimeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.supervisor.max_restarts, 5);
        assert_eq!(config.sweeper.purge_grace, Duration::from_secs(86_400));
    }

    #[test]
    fn overrides_are_applied() {
        let config = from_pairs(&[
            ("DATABASE_URL", "postgres://localhost/jobs"),
            ("JOBFORGE_QUEUES", "email, reports ,"),
            ("JOBFORGE_LEASE_MS", "5000"),
            ("JOBFORGE_MAX_RESTARTS", "2"),
            ("JOBFORGE_RESTART_DELAY_MS", "250"),
            ("JOBFORGE_HEARTBEAT_MAX_RETRIES", "5"),
        ])
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/jobs"));
        assert_eq!(config.queues, vec!["email", "reports"]);
        assert_eq!(config.queue.lease_duration, Duration::from_secs(5));
        assert_eq!(config.supervisor.max_restarts, 2);
        assert_eq!(
            config.supervisor.restart_policy.delay_for_attempt(3),
            Duration::from_millis(250)
        );
        assert_eq!(config.supervisor.heartbeat.max_retries, 5);
    }

    #[test]
    fn blank_values_keep_defaults() {
        let config = from_pairs(&[("DATABASE_URL", "  "), ("JOBFORGE_LEASE_MS", "")]).unwrap();
        assert!(config.database_url.is_none());
        assert_eq!(config.queue.lease_duration, Duration::from_secs(30));
    }

    #[test]
    fn bad_numbers_are_reported_with_the_variable() {
        let err = from_pairs(&[("JOBFORGE_PURGE_LIMIT", "lots")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidNumber {
                var: "JOBFORGE_PURGE_LIMIT",
                value: "lots".to_string(),
            }
        );
    }

    #[test]
    fn heartbeat_timeout_must_be_below_interval() {
        let err = from_pairs(&[
            ("JOBFORGE_HEARTBEAT_INTERVAL_MS", "1000"),
            ("JOBFORGE_HEARTBEAT_TIMEOUT_MS", "1000"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: "JOBFORGE_HEARTBEAT_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        for var in ["JOBFORGE_SWEEP_INTERVAL_MS", "JOBFORGE_POLL_INTERVAL_MS"] {
            let err = from_pairs(&[(var, "0")]).unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid { var: v, .. } if v == var),
                "{var}: {err:?}"
            );
        }
    }

    #[test]
    fn empty_queue_list_is_rejected() {
        assert!(from_pairs(&[("JOBFORGE_QUEUES", " , ")]).is_err());
    }
}
