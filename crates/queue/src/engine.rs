//! Claim, finalize and retry logic on top of a `JobStore`.
//!
//! The engine holds no locks of its own: every lease-holder write re-reads the
//! row, applies the transition on the entity and persists it with
//! `save_with_lock`, so a stale token is rejected by the store even if the
//! lease changed hands between the read and the write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use jobforge_core::clock::after;
use jobforge_core::{
    Clock, FailureOutcome, Job, JobCounts, JobFailure, JobId, JobOptions, JobStatus, LockToken,
    QueueError, QueueResult, WorkerId,
};
use jobforge_events::{EventBus, InMemoryEventBus, QueueEvent, Subscription};
use jobforge_store::JobStore;

use crate::config::QueueConfig;

/// A job claimed by a worker together with the lease token it must present.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: Job,
    pub token: LockToken,
}

impl ClaimedJob {
    pub fn id(&self) -> JobId {
        self.job.id
    }
}

/// Outcome of a lease-holder write.
#[derive(Debug, Clone, PartialEq)]
pub enum Finalized {
    /// The write was applied; the job as stored.
    Applied(Job),
    /// The lease was gone (expired and reclaimed); the write was discarded.
    LeaseLost,
}

impl Finalized {
    pub fn is_applied(&self) -> bool {
        matches!(self, Finalized::Applied(_))
    }

    pub fn job(&self) -> Option<&Job> {
        match self {
            Finalized::Applied(job) => Some(job),
            Finalized::LeaseLost => None,
        }
    }
}

/// Queue engine. Cheap to share behind an `Arc`; safe for concurrent callers.
#[derive(Debug)]
pub struct QueueEngine {
    store: Arc<dyn JobStore>,
    events: Arc<InMemoryEventBus<QueueEvent>>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl QueueEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        events: Arc<InMemoryEventBus<QueueEvent>>,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            events,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn subscribe(&self) -> Subscription<QueueEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: QueueEvent) {
        if let Err(e) = self.events.publish(event) {
            warn!(error = ?e, "failed to publish queue event");
        }
    }

    /// Create a job. Validation errors surface here, synchronously.
    pub async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        options: JobOptions,
    ) -> QueueResult<JobId> {
        let job = Job::new(queue, name, payload, &options, self.now())?;
        self.store.insert(&job).await?;

        debug!(job_id = %job.id, queue = %queue, name = %name, status = %job.status, "job enqueued");
        self.publish(QueueEvent::Added {
            queue: job.queue_name.clone(),
            job_id: job.id,
            name: job.name.clone(),
        });
        Ok(job.id)
    }

    /// Claim the next eligible job of `queue`. `None` when nothing is due.
    pub async fn claim(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> QueueResult<Option<ClaimedJob>> {
        let Some((job, token)) = self
            .store
            .claim_next(queue, worker_id, lease, self.now())
            .await?
        else {
            return Ok(None);
        };

        debug!(job_id = %job.id, queue = %queue, worker_id = %worker_id, attempt = job.attempts, "job claimed");
        self.publish(QueueEvent::Active {
            queue: job.queue_name.clone(),
            job_id: job.id,
            worker_id: worker_id.clone(),
            attempt: job.attempts,
        });
        Ok(Some(ClaimedJob { job, token }))
    }

    /// Active → Completed.
    pub async fn complete(
        &self,
        job_id: JobId,
        token: LockToken,
        result: Value,
    ) -> QueueResult<Finalized> {
        self.with_lease(job_id, token, "complete", |job, now| {
            job.complete(result.clone(), now)?;
            info!(job_id = %job.id, queue = %job.queue_name, attempts = job.attempts, "job completed");
            Ok(Some(QueueEvent::Completed {
                queue: job.queue_name.clone(),
                job_id: job.id,
                result,
            }))
        })
        .await
    }

    /// Record a failed attempt: Delayed with backoff, or Failed once
    /// attempts are exhausted. The failure is kept on the row either way.
    pub async fn fail(
        &self,
        job_id: JobId,
        token: LockToken,
        failure: JobFailure,
    ) -> QueueResult<Finalized> {
        let retry = self.config.retry.clone();
        self.with_lease(job_id, token, "fail", |job, now| {
            let outcome = job.fail_attempt(failure.clone(), &retry, now)?;
            Ok(Some(failure_event(job, failure, outcome)))
        })
        .await
    }

    /// Active → Delayed at the lease holder's request. Does not consume the attempt.
    pub async fn delay(
        &self,
        job_id: JobId,
        token: LockToken,
        until: DateTime<Utc>,
    ) -> QueueResult<Finalized> {
        self.with_lease(job_id, token, "delay", |job, now| {
            job.delay(until, now)?;
            debug!(job_id = %job.id, delay_until = %until, "job delayed by worker");
            Ok(Some(QueueEvent::Delayed {
                queue: job.queue_name.clone(),
                job_id: job.id,
                delay_until: until,
            }))
        })
        .await
    }

    /// Active → WaitingChildren.
    pub async fn wait_for_children(&self, job_id: JobId, token: LockToken) -> QueueResult<Finalized> {
        self.with_lease(job_id, token, "wait_for_children", |job, now| {
            job.wait_for_children(now)?;
            Ok(Some(QueueEvent::WaitingChildren {
                queue: job.queue_name.clone(),
                job_id: job.id,
            }))
        })
        .await
    }

    /// Store progress reported by the lease holder.
    pub async fn update_progress(
        &self,
        job_id: JobId,
        token: LockToken,
        progress: Value,
    ) -> QueueResult<Finalized> {
        self.with_lease(job_id, token, "update_progress", |job, now| {
            job.update_progress(progress.clone(), now)?;
            Ok(Some(QueueEvent::Progress {
                queue: job.queue_name.clone(),
                job_id: job.id,
                progress,
            }))
        })
        .await
    }

    /// Extend the lease of `worker_id` on `job_id` to `now + lease`.
    ///
    /// `LockMismatch` when the worker no longer holds the job.
    pub async fn extend_lock(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        lease: Duration,
    ) -> QueueResult<DateTime<Utc>> {
        let now = self.now();
        let lock_until = after(now, lease);
        self.store.extend_lock(job_id, worker_id, lock_until, now).await?;
        debug!(job_id = %job_id, worker_id = %worker_id, lock_until = %lock_until, "lease extended");
        Ok(lock_until)
    }

    /// WaitingChildren → Waiting, once its children resolved.
    pub async fn resume_parent(&self, job_id: JobId) -> QueueResult<Job> {
        self.without_lease(job_id, |job, now| job.resume_from_children(now))
            .await
    }

    /// WaitingChildren → Completed.
    pub async fn complete_parent(&self, job_id: JobId, result: Value) -> QueueResult<Job> {
        let job = self
            .without_lease(job_id, |job, now| job.complete_from_children(result.clone(), now))
            .await?;
        self.publish(QueueEvent::Completed {
            queue: job.queue_name.clone(),
            job_id: job.id,
            result,
        });
        Ok(job)
    }

    pub async fn get_job(&self, job_id: JobId) -> QueueResult<Option<Job>> {
        self.store.find_by_id(job_id).await
    }

    pub async fn counts(&self, queue: &str) -> QueueResult<JobCounts> {
        self.store.count_by_status(queue).await
    }

    pub async fn list(&self, queue: &str, status: JobStatus, limit: usize) -> QueueResult<Vec<Job>> {
        self.store.list_by_status(queue, status, limit).await
    }

    /// Apply a lease-holder transition and persist it with `save_with_lock`.
    ///
    /// A lost lease is logged at `warn` and reported as `Finalized::LeaseLost`.
    async fn with_lease<F>(
        &self,
        job_id: JobId,
        token: LockToken,
        operation: &'static str,
        apply: F,
    ) -> QueueResult<Finalized>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> QueueResult<Option<QueueEvent>> + Send,
    {
        let mut job = self
            .store
            .find_by_id(job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))?;

        if job.lock_token() != Some(token) {
            return Ok(self.lease_lost(&job, operation));
        }

        let event = apply(&mut job, self.now())?;
        match self.store.save_with_lock(&job, token).await {
            Ok(()) => {
                if let Some(event) = event {
                    self.publish(event);
                }
                Ok(Finalized::Applied(job))
            }
            Err(e) if e.is_lost_lease() => Ok(self.lease_lost(&job, operation)),
            Err(e) => Err(e),
        }
    }

    async fn without_lease<F>(&self, job_id: JobId, apply: F) -> QueueResult<Job>
    where
        F: FnOnce(&mut Job, DateTime<Utc>) -> QueueResult<()> + Send,
    {
        let mut job = self
            .store
            .find_by_id(job_id)
            .await?
            .ok_or(QueueError::NotFound(job_id))?;
        let expected = job.status;
        apply(&mut job, self.now())?;
        self.store.save_if_status(&job, expected).await?;
        Ok(job)
    }

    fn lease_lost(&self, job: &Job, operation: &str) -> Finalized {
        warn!(
            job_id = %job.id,
            queue = %job.queue_name,
            operation,
            "lease lost; discarding lease holder write"
        );
        self.publish(QueueEvent::LeaseLost {
            queue: job.queue_name.clone(),
            job_id: job.id,
            operation: operation.to_string(),
        });
        Finalized::LeaseLost
    }
}

/// Event and log line for a recorded failure.
pub(crate) fn failure_event(job: &Job, failure: JobFailure, outcome: FailureOutcome) -> QueueEvent {
    match outcome {
        FailureOutcome::Retrying { delay_until } => {
            info!(
                job_id = %job.id,
                queue = %job.queue_name,
                attempts = job.attempts,
                max_attempts = job.max_attempts,
                delay_until = %delay_until,
                error = %failure,
                "job attempt failed; retrying"
            );
            QueueEvent::Retrying {
                queue: job.queue_name.clone(),
                job_id: job.id,
                attempts: job.attempts,
                delay_until,
                error: failure,
            }
        }
        FailureOutcome::Exhausted => {
            warn!(
                job_id = %job.id,
                queue = %job.queue_name,
                attempts = job.attempts,
                error = %failure,
                "job failed; attempts exhausted"
            );
            QueueEvent::Failed {
                queue: job.queue_name.clone(),
                job_id: job.id,
                attempts: job.attempts,
                error: failure,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobforge_core::ManualClock;
    use jobforge_store::InMemoryJobStore;
    use serde_json::json;

    fn engine() -> (Arc<QueueEngine>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let engine = QueueEngine::new(
            InMemoryJobStore::arc(),
            Arc::new(InMemoryEventBus::new()),
            clock.clone(),
            QueueConfig::default(),
        );
        (Arc::new(engine), clock)
    }

    fn worker() -> WorkerId {
        WorkerId::from("w1")
    }

    fn lease() -> Duration {
        Duration::from_secs(30)
    }

    #[tokio::test]
    async fn enqueue_rejects_invalid_options() {
        let (engine, _) = engine();
        let err = engine
            .enqueue("q", "x", json!(null), JobOptions::default().with_max_attempts(0))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
    }

    #[tokio::test]
    async fn enqueue_publishes_added() {
        let (engine, _) = engine();
        let mut events = engine.subscribe();
        let id = engine
            .enqueue("q", "x", json!(null), JobOptions::default())
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            QueueEvent::Added { job_id, .. } => assert_eq!(job_id, id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_token_is_reported_as_lease_lost() {
        let (engine, _) = engine();
        let id = engine
            .enqueue("q", "x", json!(null), JobOptions::default())
            .await
            .unwrap();
        engine.claim("q", &worker(), lease()).await.unwrap().unwrap();

        let before = engine.get_job(id).await.unwrap();
        let outcome = engine
            .complete(id, LockToken::new(), json!("late"))
            .await
            .unwrap();

        assert_eq!(outcome, Finalized::LeaseLost);
        assert_eq!(engine.get_job(id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn progress_is_stored_and_published() {
        let (engine, _) = engine();
        let id = engine
            .enqueue("q", "x", json!(null), JobOptions::default())
            .await
            .unwrap();
        let claimed = engine.claim("q", &worker(), lease()).await.unwrap().unwrap();
        let mut events = engine.subscribe();

        engine
            .update_progress(id, claimed.token, json!({"pct": 50}))
            .await
            .unwrap();

        let job = engine.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.progress, Some(json!({"pct": 50})));
        assert!(matches!(events.recv().await, Some(QueueEvent::Progress { .. })));
    }

    #[tokio::test]
    async fn explicit_delay_keeps_attempt_budget() {
        let (engine, clock) = engine();
        let id = engine
            .enqueue("q", "x", json!(null), JobOptions::default())
            .await
            .unwrap();
        let claimed = engine.claim("q", &worker(), lease()).await.unwrap().unwrap();

        let until = after(clock.now(), Duration::from_secs(5));
        engine.delay(id, claimed.token, until).await.unwrap();

        let job = engine.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Delayed);
        assert_eq!(job.attempts, 0);
        assert!(engine.claim("q", &worker(), lease()).await.unwrap().is_none());

        clock.advance(Duration::from_secs(5));
        let again = engine.claim("q", &worker(), lease()).await.unwrap().unwrap();
        assert_eq!(again.job.attempts, 1);
    }

    #[tokio::test]
    async fn extend_lock_moves_lock_until() {
        let (engine, clock) = engine();
        let id = engine
            .enqueue("q", "x", json!(null), JobOptions::default())
            .await
            .unwrap();
        engine.claim("q", &worker(), lease()).await.unwrap().unwrap();

        clock.advance(Duration::from_secs(20));
        let until = engine.extend_lock(id, &worker(), lease()).await.unwrap();
        assert_eq!(until, after(clock.now(), lease()));

        let err = engine
            .extend_lock(id, &WorkerId::from("other"), lease())
            .await
            .unwrap_err();
        assert!(err.is_lost_lease());
    }

    #[tokio::test]
    async fn parent_waits_for_children_then_resumes() {
        let (engine, _) = engine();
        let parent = engine
            .enqueue("q", "parent", json!(null), JobOptions::default())
            .await
            .unwrap();
        let claimed = engine.claim("q", &worker(), lease()).await.unwrap().unwrap();
        engine
            .enqueue("q", "child", json!(null), JobOptions::default().with_parent(parent))
            .await
            .unwrap();

        engine.wait_for_children(parent, claimed.token).await.unwrap();
        assert_eq!(
            engine.get_job(parent).await.unwrap().unwrap().status,
            JobStatus::WaitingChildren
        );

        // Resuming twice is rejected.
        engine.resume_parent(parent).await.unwrap();
        let err = engine.resume_parent(parent).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn complete_parent_finishes_from_waiting_children() {
        let (engine, _) = engine();
        let parent = engine
            .enqueue("q", "parent", json!(null), JobOptions::default())
            .await
            .unwrap();
        let claimed = engine.claim("q", &worker(), lease()).await.unwrap().unwrap();
        engine.wait_for_children(parent, claimed.token).await.unwrap();

        let job = engine.complete_parent(parent, json!("all done")).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(json!("all done")));
    }

    #[tokio::test]
    async fn finalizing_a_missing_job_is_not_found() {
        let (engine, _) = engine();
        let id = JobId::new();
        let err = engine.complete(id, LockToken::new(), json!(null)).await.unwrap_err();
        assert_eq!(err, QueueError::NotFound(id));
    }
}
