//! Worker liveness probing.
//!
//! [`HeartbeatTracker`] turns probe outcomes into [`HealthStatus`] changes;
//! [`HeartbeatMonitor`] drives it on an interval against a [`LivenessProbe`].
//! Only status changes are emitted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use jobforge_events::{HealthEvent, HealthStatus, ProcessMetrics};

use crate::config::HeartbeatConfig;
use crate::error::SupervisorError;

/// Something that can be asked "are you alive?".
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, timeout: Duration) -> Result<ProcessMetrics, SupervisorError>;
}

/// Consecutive-failure bookkeeping.
#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    max_retries: u32,
    status: HealthStatus,
    consecutive_failures: u32,
    last_success_at: Option<DateTime<Utc>>,
    metrics: ProcessMetrics,
}

impl HeartbeatTracker {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries: max_retries.max(1),
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_success_at: None,
            metrics: ProcessMetrics::default(),
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn classify(&self) -> HealthStatus {
        match self.consecutive_failures {
            0 => HealthStatus::Healthy,
            n if n >= self.max_retries => HealthStatus::Unresponsive,
            _ => HealthStatus::Degraded,
        }
    }

    pub fn record_success(
        &mut self,
        metrics: ProcessMetrics,
        now: DateTime<Utc>,
    ) -> Option<HealthEvent> {
        self.consecutive_failures = 0;
        self.last_success_at = Some(now);
        self.metrics = metrics;
        self.transition(self.classify(), now, None)
    }

    pub fn record_failure(&mut self, message: String, now: DateTime<Utc>) -> Option<HealthEvent> {
        self.consecutive_failures += 1;
        self.transition(self.classify(), now, Some(message))
    }

    /// A worker-reported fatal condition; bypasses the retry counter.
    pub fn record_fatal(&mut self, message: String, now: DateTime<Utc>) -> Option<HealthEvent> {
        self.transition(HealthStatus::Failed, now, Some(message))
    }

    fn transition(
        &mut self,
        next: HealthStatus,
        now: DateTime<Utc>,
        message: Option<String>,
    ) -> Option<HealthEvent> {
        if next == self.status {
            return None;
        }
        let previous = std::mem::replace(&mut self.status, next);
        Some(HealthEvent {
            status: next,
            previous,
            metrics: self.metrics,
            consecutive_failures: self.consecutive_failures,
            last_success_at: self.last_success_at,
            timestamp: now,
            message,
        })
    }
}

/// Periodic prober for one worker process.
pub struct HeartbeatMonitor {
    probe: Arc<dyn LivenessProbe>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(probe: Arc<dyn LivenessProbe>, config: HeartbeatConfig) -> Self {
        Self { probe, config }
    }

    /// Start probing; status changes go to `sink`. The first probe runs
    /// immediately.
    pub fn spawn(self, sink: mpsc::UnboundedSender<HealthEvent>) -> HeartbeatHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<String>();

        let join = tokio::spawn(async move {
            let mut tracker = HeartbeatTracker::new(self.config.max_retries);
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                let event = tokio::select! {
                    _ = signal.notified() => break,
                    Some(message) = fatal_rx.recv() => {
                        warn!(message = %message, "worker reported a fatal condition");
                        tracker.record_fatal(message, Utc::now())
                    }
                    _ = interval.tick() => {
                        let started = Instant::now();
                        match self.probe.probe(self.config.timeout).await {
                            Ok(mut metrics) => {
                                metrics.latency_ms = Some(started.elapsed().as_millis() as u64);
                                tracker.record_success(metrics, Utc::now())
                            }
                            Err(e) => {
                                debug!(error = %e, failures = tracker.consecutive_failures() + 1, "heartbeat probe failed");
                                tracker.record_failure(e.to_string(), Utc::now())
                            }
                        }
                    }
                };

                if let Some(event) = event
                    && sink.send(event).is_err()
                {
                    break;
                }
            }
        });

        HeartbeatHandle {
            shutdown,
            fatal: fatal_tx,
            join: Some(join),
        }
    }
}

/// Handle to a running monitor. Dropping it aborts the monitor.
#[derive(Debug)]
pub struct HeartbeatHandle {
    shutdown: Arc<Notify>,
    fatal: mpsc::UnboundedSender<String>,
    join: Option<JoinHandle<()>>,
}

impl HeartbeatHandle {
    /// Forward a worker-reported fatal condition to the monitor.
    pub fn report_fatal(&self, message: impl Into<String>) {
        let _ = self.fatal.send(message.into());
    }

    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take()
            && let Err(e) = join.await
        {
            error!(error = %e, "heartbeat monitor task failed");
        }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn failures_escalate_and_success_recovers() {
        let now = Utc::now();
        let mut tracker = HeartbeatTracker::new(3);

        let degraded = tracker.record_failure("timeout".into(), now).unwrap();
        assert_eq!(degraded.status, HealthStatus::Degraded);
        assert_eq!(degraded.previous, HealthStatus::Healthy);
        // Still degraded: no event.
        assert!(tracker.record_failure("timeout".into(), now).is_none());

        let unresponsive = tracker.record_failure("timeout".into(), now).unwrap();
        assert_eq!(unresponsive.status, HealthStatus::Unresponsive);
        assert_eq!(unresponsive.consecutive_failures, 3);
        assert!(unresponsive.restart_required());

        let healthy = tracker
            .record_success(ProcessMetrics::default(), now)
            .unwrap();
        assert_eq!(healthy.status, HealthStatus::Healthy);
        assert_eq!(healthy.consecutive_failures, 0);
        assert_eq!(healthy.last_success_at, Some(now));
    }

    #[test]
    fn fatal_skips_the_retry_ladder() {
        let mut tracker = HeartbeatTracker::new(3);
        let event = tracker.record_fatal("out of memory".into(), Utc::now()).unwrap();
        assert_eq!(event.status, HealthStatus::Failed);
        assert_eq!(event.message.as_deref(), Some("out of memory"));
        assert!(event.restart_required());
    }

    #[test]
    fn steady_success_is_silent() {
        let mut tracker = HeartbeatTracker::new(3);
        assert!(tracker.record_success(ProcessMetrics::default(), Utc::now()).is_none());
    }

    struct ScriptedProbe {
        outcomes: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl LivenessProbe for ScriptedProbe {
        async fn probe(&self, timeout: Duration) -> Result<ProcessMetrics, SupervisorError> {
            let ok = self.outcomes.lock().unwrap().pop().unwrap_or(true);
            if ok {
                Ok(ProcessMetrics::default())
            } else {
                Err(SupervisorError::Timeout { after: timeout })
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_emits_unresponsive_after_max_retries() {
        // Popped from the back: fail, fail.
        let probe = Arc::new(ScriptedProbe {
            outcomes: Mutex::new(vec![false, false]),
        });
        let config = HeartbeatConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(50),
            max_retries: 2,
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = HeartbeatMonitor::new(probe, config).spawn(tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.status, HealthStatus::Degraded);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.status, HealthStatus::Unresponsive);
        let third = rx.recv().await.unwrap();
        assert_eq!(third.status, HealthStatus::Healthy);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn reported_fatal_is_emitted() {
        let probe = Arc::new(ScriptedProbe {
            outcomes: Mutex::new(Vec::new()),
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = HeartbeatMonitor::new(probe, HeartbeatConfig::default()).spawn(tx);

        handle.report_fatal("disk full");
        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, HealthStatus::Failed);
        handle.shutdown().await;
    }
}
