//! Periodic stalled-job recovery and cleanup of finished jobs.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobforge_core::clock::before;
use jobforge_core::{FailureOutcome, Job, QueueResult};
use jobforge_events::QueueEvent;

use crate::config::SweeperConfig;
use crate::engine::{QueueEngine, failure_event};

/// What one sweep of one queue did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Stalled jobs requeued for another attempt
    pub recovered: usize,
    /// Stalled jobs finalized as failed
    pub failed: usize,
    /// Stalled writes rejected because the lease changed after the scan
    pub races_lost: usize,
    /// Terminal jobs deleted
    pub purged: u64,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

enum Recovery {
    Requeued,
    Failed,
    RaceLost,
}

/// Maintenance sweeper over a queue engine.
#[derive(Debug, Clone)]
pub struct MaintenanceSweeper {
    engine: Arc<QueueEngine>,
    config: SweeperConfig,
}

impl MaintenanceSweeper {
    pub fn new(engine: Arc<QueueEngine>, config: SweeperConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Recover stalled jobs of `queue`, then purge its expired terminal jobs.
    pub async fn sweep_once(&self, queue: &str) -> QueueResult<SweepReport> {
        let mut report = SweepReport::default();

        let now = self.engine.now();
        let stalled = self
            .engine
            .store()
            .find_stalled(queue, now, self.config.stalled_limit)
            .await?;

        for job in stalled {
            match self.recover(job).await? {
                Recovery::Requeued => report.recovered += 1,
                Recovery::Failed => report.failed += 1,
                Recovery::RaceLost => report.races_lost += 1,
            }
        }

        report.purged = self.purge(queue).await?;
        Ok(report)
    }

    /// Recover one stalled job, guarded by the lease observed at scan time.
    async fn recover(&self, mut job: Job) -> QueueResult<Recovery> {
        let Some(lease) = job.lease.clone() else {
            return Ok(Recovery::RaceLost);
        };

        let now = self.engine.now();
        let outcome = job.recover_stalled(&self.engine.config().retry, now)?;
        let failure = job.error.clone();

        match self
            .engine
            .store()
            .save_stalled(&job, lease.token, lease.lock_until)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_lost_lease() => {
                warn!(
                    job_id = %job.id,
                    queue = %job.queue_name,
                    worker_id = %lease.worker_id,
                    "stalled job changed during sweep; leaving it to its lease holder"
                );
                return Ok(Recovery::RaceLost);
            }
            Err(e) => return Err(e),
        }

        warn!(
            job_id = %job.id,
            queue = %job.queue_name,
            worker_id = %lease.worker_id,
            lock_until = %lease.lock_until,
            attempts = job.attempts,
            "recovered stalled job"
        );
        self.engine.publish(QueueEvent::Stalled {
            queue: job.queue_name.clone(),
            job_id: job.id,
            worker_id: lease.worker_id,
        });
        if let Some(failure) = failure {
            self.engine.publish(failure_event(&job, failure, outcome));
        }

        Ok(match outcome {
            FailureOutcome::Retrying { .. } => Recovery::Requeued,
            FailureOutcome::Exhausted => Recovery::Failed,
        })
    }

    async fn purge(&self, queue: &str) -> QueueResult<u64> {
        let cutoff = before(self.engine.now(), self.config.purge_grace);
        let purged = self
            .engine
            .store()
            .purge_finished(queue, cutoff, self.config.purge_limit)
            .await?;

        if purged > 0 {
            debug!(queue = %queue, purged, "purged finished jobs");
            self.engine.publish(QueueEvent::Cleaned {
                queue: queue.to_string(),
                count: purged,
            });
        }
        Ok(purged)
    }

    /// Run `sweep_once` for every queue each `interval` until shut down.
    /// A zero interval falls back to the default one.
    pub fn spawn(self, queues: Vec<String>) -> SweeperHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let period = if self.config.interval.is_zero() {
            let fallback = SweeperConfig::default().interval;
            warn!(interval_ms = fallback.as_millis() as u64, "sweep interval is zero; using the default");
            fallback
        } else {
            self.config.interval
        };

        let join = tokio::spawn(async move {
            info!(queues = ?queues, interval_ms = period.as_millis() as u64, "maintenance sweeper started");

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = signal.notified() => {
                        info!("maintenance sweeper received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        for queue in &queues {
                            match self.sweep_once(queue).await {
                                Ok(report) if !report.is_empty() => {
                                    info!(
                                        queue = %queue,
                                        recovered = report.recovered,
                                        failed = report.failed,
                                        races_lost = report.races_lost,
                                        purged = report.purged,
                                        "sweep finished"
                                    );
                                }
                                Ok(_) => {}
                                Err(e) => error!(queue = %queue, error = %e, "sweep failed"),
                            }
                        }
                    }
                }
            }

            info!("maintenance sweeper stopped");
        });

        SweeperHandle {
            shutdown,
            join: Some(join),
        }
    }
}

/// Handle to a running sweeper task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the task to stop.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take()
            && let Err(e) = join.await
        {
            error!(error = %e, "maintenance sweeper task failed");
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use jobforge_core::{JobOptions, JobStatus, ManualClock, WorkerId};
    use jobforge_events::InMemoryEventBus;
    use jobforge_store::InMemoryJobStore;
    use serde_json::json;

    use crate::config::QueueConfig;

    fn setup() -> (Arc<QueueEngine>, Arc<ManualClock>, MaintenanceSweeper) {
        let clock = Arc::new(ManualClock::default());
        let engine = Arc::new(QueueEngine::new(
            InMemoryJobStore::arc(),
            Arc::new(InMemoryEventBus::new()),
            clock.clone(),
            QueueConfig::default(),
        ));
        let sweeper = MaintenanceSweeper::new(engine.clone(), SweeperConfig::default());
        (engine, clock, sweeper)
    }

    #[tokio::test]
    async fn expired_lease_with_attempts_left_is_requeued() {
        let (engine, clock, sweeper) = setup();
        let id = engine
            .enqueue("q", "x", json!(null), JobOptions::default().with_max_attempts(2))
            .await
            .unwrap();
        engine
            .claim("q", &WorkerId::from("w1"), Duration::from_secs(30))
            .await
            .unwrap();

        assert!(sweeper.sweep_once("q").await.unwrap().is_empty());

        clock.advance(Duration::from_secs(31));
        let report = sweeper.sweep_once("q").await.unwrap();
        assert_eq!(report.recovered, 1);

        let job = engine.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        assert!(job.lease.is_none());
        assert_eq!(job.error.map(|e| e.kind), Some(jobforge_core::FailureKind::Stalled));
    }

    #[tokio::test]
    async fn expired_lease_without_attempts_left_fails() {
        let (engine, clock, sweeper) = setup();
        let id = engine
            .enqueue("q", "x", json!(null), JobOptions::default())
            .await
            .unwrap();
        engine
            .claim("q", &WorkerId::from("w1"), Duration::from_secs(30))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(31));
        let report = sweeper.sweep_once("q").await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(
            engine.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Failed
        );
    }

    #[tokio::test]
    async fn old_finished_jobs_are_purged() {
        let (engine, clock, sweeper) = setup();
        let id = engine
            .enqueue("q", "x", json!(null), JobOptions::default())
            .await
            .unwrap();
        let claimed = engine
            .claim("q", &WorkerId::from("w1"), Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        engine.complete(id, claimed.token, json!("ok")).await.unwrap();

        assert_eq!(sweeper.sweep_once("q").await.unwrap().purged, 0);
        clock.advance(Duration::from_secs(24 * 60 * 60 + 1));
        assert_eq!(sweeper.sweep_once("q").await.unwrap().purged, 1);
        assert!(engine.get_job(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_interval_still_recovers_stalled_jobs() {
        let (engine, clock, _) = setup();
        let id = engine
            .enqueue("q", "x", json!(null), JobOptions::default().with_max_attempts(2))
            .await
            .unwrap();
        engine
            .claim("q", &WorkerId::from("w1"), Duration::from_secs(30))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(31));

        let config = SweeperConfig {
            interval: Duration::ZERO,
            ..SweeperConfig::default()
        };
        let handle = MaintenanceSweeper::new(engine.clone(), config).spawn(vec!["q".to_string()]);

        tokio::time::timeout(Duration::from_secs(1), async {
            while engine.get_job(id).await.unwrap().unwrap().status == JobStatus::Active {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            engine.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Delayed
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn spawned_sweeper_shuts_down() {
        let (_, _, sweeper) = setup();
        let handle = sweeper.spawn(vec!["q".to_string()]);
        tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
            .await
            .unwrap();
    }
}
