//! Caller-facing facade bound to one queue.
//!
//! In-process callers get push notifications through `subscribe()`. Callers
//! that may be in another process than the engine use `wait_for`, which polls
//! the store at `QueueConfig::poll_interval` and wakes early on a matching event.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use jobforge_core::{Job, JobCounts, JobFailure, JobId, JobOptions, JobStatus, QueueError, QueueResult};
use jobforge_events::{QueueEvent, Subscription};

use crate::engine::QueueEngine;

/// Default page size for the `get_*` listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Notification delivered to queue clients.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    JobCompleted { job_id: JobId, result: Value },
    JobFailed {
        job_id: JobId,
        attempts: u32,
        error: JobFailure,
    },
    JobProgress { job_id: JobId, progress: Value },
}

impl ClientEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            ClientEvent::JobCompleted { job_id, .. }
            | ClientEvent::JobFailed { job_id, .. }
            | ClientEvent::JobProgress { job_id, .. } => *job_id,
        }
    }

    fn from_queue_event(queue: &str, event: QueueEvent) -> Option<Self> {
        if event.queue() != queue {
            return None;
        }
        match event {
            QueueEvent::Completed { job_id, result, .. } => {
                Some(ClientEvent::JobCompleted { job_id, result })
            }
            QueueEvent::Failed {
                job_id,
                attempts,
                error,
                ..
            } => Some(ClientEvent::JobFailed {
                job_id,
                attempts,
                error,
            }),
            QueueEvent::Progress {
                job_id, progress, ..
            } => Some(ClientEvent::JobProgress { job_id, progress }),
            _ => None,
        }
    }
}

/// Client events for one queue.
#[derive(Debug)]
pub struct ClientSubscription {
    queue: String,
    inner: Subscription<QueueEvent>,
}

impl ClientSubscription {
    /// Next event for this queue; `None` once the engine is gone.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        loop {
            let event = self.inner.recv().await?;
            if let Some(event) = ClientEvent::from_queue_event(&self.queue, event) {
                return Some(event);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueClient {
    engine: Arc<QueueEngine>,
    queue: String,
}

impl QueueClient {
    pub fn new(engine: Arc<QueueEngine>, queue: impl Into<String>) -> Self {
        Self {
            engine,
            queue: queue.into(),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Enqueue a job named `name`.
    pub async fn add(&self, name: &str, payload: Value, options: JobOptions) -> QueueResult<JobId> {
        self.engine.enqueue(&self.queue, name, payload, options).await
    }

    pub async fn get_job(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        self.engine.get_job(job_id).await
    }

    pub async fn get_job_counts(&self) -> QueueResult<JobCounts> {
        self.engine.counts(&self.queue).await
    }

    pub async fn get_waiting(&self) -> QueueResult<Vec<Job>> {
        self.get_jobs(JobStatus::Waiting, DEFAULT_LIST_LIMIT).await
    }

    pub async fn get_completed(&self) -> QueueResult<Vec<Job>> {
        self.get_jobs(JobStatus::Completed, DEFAULT_LIST_LIMIT).await
    }

    pub async fn get_failed(&self) -> QueueResult<Vec<Job>> {
        self.get_jobs(JobStatus::Failed, DEFAULT_LIST_LIMIT).await
    }

    pub async fn get_jobs(&self, status: JobStatus, limit: usize) -> QueueResult<Vec<Job>> {
        self.engine.list(&self.queue, status, limit).await
    }

    pub fn subscribe(&self) -> ClientSubscription {
        ClientSubscription {
            queue: self.queue.clone(),
            inner: self.engine.subscribe(),
        }
    }

    /// Wait until `job_id` is terminal. `Ok(None)` on timeout.
    pub async fn wait_for(&self, job_id: JobId, timeout: Duration) -> QueueResult<Option<Job>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll_interval = self.engine.config().poll_interval;
        // Subscribe before the first read so no completion slips in between.
        let mut events = self.engine.subscribe();

        loop {
            let job = self
                .engine
                .get_job(job_id)
                .await?
                .ok_or(QueueError::NotFound(job_id))?;
            if job.status.is_terminal() {
                return Ok(Some(job));
            }

            let wake = async {
                loop {
                    match events.recv().await {
                        Some(event) if event.job_id() == Some(job_id) => break,
                        Some(_) => continue,
                        // Bus gone: fall back to polling only.
                        None => std::future::pending::<()>().await,
                    }
                }
            };

            tokio::select! {
                _ = wake => {}
                _ = tokio::time::sleep(poll_interval) => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }
}
