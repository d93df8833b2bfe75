//! Bridges the queue to the supervised worker: claim, execute, finalize.

use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobforge_core::clock::after;
use jobforge_core::{JobFailure, QueueResult};
use jobforge_protocol::ExecuteJob;
use jobforge_queue::{ClaimedJob, Finalized, QueueEngine};

use crate::config::DispatcherConfig;
use crate::error::SupervisorError;
use crate::supervisor::WorkerSupervisor;

/// Runs claimed jobs one at a time in the supervised worker.
///
/// While a job executes its lease is extended every `lease_duration / 2` and
/// worker progress is forwarded to the queue. The reply maps to:
///
/// | worker outcome      | queue operation                      |
/// |---------------------|--------------------------------------|
/// | `Executed`          | `complete`                           |
/// | handler error       | `fail` with `FailureKind::Execution` |
/// | request timeout     | `fail` with `FailureKind::Timeout`; the worker is sent `cancel` |
/// | crash mid-request   | `fail` with `FailureKind::WorkerCrash` |
/// | worker not running  | `delay`, attempt not consumed        |
#[derive(Debug, Clone)]
pub struct JobDispatcher {
    engine: Arc<QueueEngine>,
    supervisor: Arc<WorkerSupervisor>,
    config: DispatcherConfig,
}

impl JobDispatcher {
    pub fn new(
        engine: Arc<QueueEngine>,
        supervisor: Arc<WorkerSupervisor>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            engine,
            supervisor,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Claim and run at most one job. Returns whether a job was claimed.
    pub async fn dispatch_once(&self) -> QueueResult<bool> {
        let Some(claimed) = self
            .engine
            .claim(
                &self.config.queue,
                &self.config.worker_id,
                self.config.lease_duration,
            )
            .await?
        else {
            return Ok(false);
        };

        self.run(claimed).await?;
        Ok(true)
    }

    async fn run(&self, claimed: ClaimedJob) -> QueueResult<Finalized> {
        let job_id = claimed.id();
        let token = claimed.token;

        if !self.supervisor.is_running() {
            return self.push_back(&claimed, "worker not running").await;
        }

        let mut progress = self.supervisor.subscribe_progress();
        let execution = self
            .supervisor
            .execute(ExecuteJob::from(&claimed.job), self.config.execute_timeout);
        tokio::pin!(execution);

        let extend_every = (self.config.lease_duration / 2).max(std::time::Duration::from_millis(1));
        let mut extend = tokio::time::interval_at(
            tokio::time::Instant::now() + extend_every,
            extend_every,
        );

        let outcome = loop {
            // Progress is drained before the reply so it lands before `complete`.
            tokio::select! {
                biased;
                Some(update) = progress.recv() => {
                    if update.job_id == job_id {
                        self.engine.update_progress(job_id, token, update.progress).await?;
                    }
                }
                outcome = &mut execution => break outcome,
                _ = extend.tick() => {
                    if let Err(e) = self
                        .engine
                        .extend_lock(job_id, &self.config.worker_id, self.config.lease_duration)
                        .await
                    {
                        warn!(job_id = %job_id, error = %e, "failed to extend lease");
                    }
                }
            }
        };

        let finalized = match outcome {
            Ok(result) => self.engine.complete(job_id, token, result).await?,
            Err(SupervisorError::Remote {
                message,
                stacktrace,
            }) => {
                let failure = match stacktrace {
                    Some(trace) => JobFailure::execution(message).with_stacktrace(trace),
                    None => JobFailure::execution(message),
                };
                self.engine.fail(job_id, token, failure).await?
            }
            Err(SupervisorError::Timeout { after }) => {
                self.engine
                    .fail(job_id, token, JobFailure::timeout(after))
                    .await?
            }
            Err(SupervisorError::NotRunning) => {
                self.push_back(&claimed, "worker stopped").await?
            }
            Err(e @ SupervisorError::RestartLimitExceeded { .. }) => {
                self.push_back(&claimed, &e.to_string()).await?
            }
            Err(e) => {
                self.engine
                    .fail(job_id, token, JobFailure::worker_crash(e.to_string()))
                    .await?
            }
        };

        if !finalized.is_applied() {
            warn!(job_id = %job_id, "job result discarded; lease was lost during execution");
        }
        Ok(finalized)
    }

    async fn push_back(&self, claimed: &ClaimedJob, reason: &str) -> QueueResult<Finalized> {
        let until = after(self.engine.now(), self.config.unavailable_delay);
        debug!(job_id = %claimed.id(), reason = %reason, delay_until = %until, "returning job to the queue");
        self.engine.delay(claimed.id(), claimed.token, until).await
    }

    /// Dispatch until shut down. Sleeps `poll_interval` when idle.
    pub fn spawn(self) -> DispatcherHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let join = tokio::spawn(async move {
            info!(queue = %self.config.queue, worker_id = %self.config.worker_id, "job dispatcher started");
            loop {
                let idle = tokio::select! {
                    _ = signal.notified() => break,
                    claimed = self.dispatch_once() => match claimed {
                        Ok(claimed) => !claimed,
                        Err(e) => {
                            error!(queue = %self.config.queue, error = %e, "dispatch failed");
                            true
                        }
                    },
                };
                if idle {
                    tokio::select! {
                        _ = signal.notified() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
            }
            info!("job dispatcher stopped");
        });

        DispatcherHandle {
            shutdown,
            join: Some(join),
        }
    }
}

/// Handle to a running dispatcher task.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: Arc<Notify>,
    join: Option<JoinHandle<()>>,
}

impl DispatcherHandle {
    /// Stop claiming and wait for the loop to exit. A job that is mid-flight
    /// is abandoned to its lease; the sweeper recovers it.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(join) = self.join.take()
            && let Err(e) = join.await
        {
            error!(error = %e, "job dispatcher task failed");
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}
