//! Job entity and its state machine.
//!
//! ```text
//! Waiting ──claim──▶ Active ──complete──▶ Completed
//! Delayed ──claim──▶   │ ├──fail (attempts left)──▶ Delayed
//!                      │ ├──fail (exhausted)──────▶ Failed
//!                      │ ├──delay────────────────▶ Delayed
//!                      │ └──wait for children────▶ WaitingChildren ──▶ Waiting | Completed
//! ```
//!
//! Every method takes `now` explicitly so callers control the clock. A
//! rejected transition returns `InvalidStateTransition` and leaves the job
//! untouched.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::after;
use crate::error::{QueueError, QueueResult};
use crate::id::{JobId, LockToken, WorkerId};
use crate::options::JobOptions;
use crate::retry::RetryPolicy;

/// Job lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, claimable once `delay_until` (if any) has passed
    Waiting,
    /// Scheduled for later (initial delay or retry backoff)
    Delayed,
    /// Leased by a worker
    Active,
    /// Parked until its children resolve
    WaitingChildren,
    /// Finished successfully
    Completed,
    /// Finished with attempts exhausted
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Waiting,
        JobStatus::Delayed,
        JobStatus::Active,
        JobStatus::WaitingChildren,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::WaitingChildren => "waiting_children",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| QueueError::validation(format!("unknown job status: {s}")))
    }
}

/// Category of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned an error
    Execution,
    /// The lease expired without the job being finalized
    Stalled,
    /// The worker process died while executing the job
    WorkerCrash,
    /// The worker did not answer within the request timeout
    Timeout,
}

/// Error recorded on a job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub message: String,
    pub stacktrace: Option<String>,
}

impl JobFailure {
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Execution,
            message: message.into(),
            stacktrace: None,
        }
    }

    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }

    /// Synthetic error used when the sweeper reclaims an expired lease.
    pub fn stalled(lease: &Lease) -> Self {
        Self {
            kind: FailureKind::Stalled,
            message: format!(
                "job stalled: lease held by {} expired at {}",
                lease.worker_id,
                lease.lock_until.to_rfc3339()
            ),
            stacktrace: None,
        }
    }

    pub fn worker_crash(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::WorkerCrash,
            message: message.into(),
            stacktrace: None,
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: format!("worker did not respond within {}ms", after.as_millis()),
            stacktrace: None,
        }
    }
}

impl core::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Time-bounded exclusive claim on an active job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: WorkerId,
    pub token: LockToken,
    pub lock_until: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lock_until < now
    }
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Attempts remain; the job is Delayed until the given instant
    Retrying { delay_until: DateTime<Utc> },
    /// Attempts exhausted; the job is terminally Failed
    Exhausted,
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    /// Logical job type, used to route to a handler
    pub name: String,
    /// Opaque payload; typed decoding is the handler's job
    pub payload: Value,
    pub status: JobStatus,
    /// Incremented on each claim
    pub attempts: u32,
    pub max_attempts: u32,
    /// Lower values are claimed first
    pub priority: i32,
    pub delay_until: Option<DateTime<Utc>>,
    /// Present if and only if `status == Active`
    pub lease: Option<Lease>,
    pub progress: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub parent_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the current (or last) attempt
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new job in `Waiting`, or `Delayed` when the options carry a delay.
    pub fn new(
        queue_name: impl Into<String>,
        name: impl Into<String>,
        payload: Value,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> QueueResult<Self> {
        options.validate()?;

        let queue_name = queue_name.into();
        let name = name.into();
        if queue_name.trim().is_empty() {
            return Err(QueueError::validation("queue name must not be empty"));
        }
        if name.trim().is_empty() {
            return Err(QueueError::validation("job name must not be empty"));
        }

        let (status, delay_until) = if options.delay.is_zero() {
            (JobStatus::Waiting, None)
        } else {
            (JobStatus::Delayed, Some(after(now, options.delay)))
        };

        Ok(Self {
            id: options.job_id.unwrap_or_default(),
            queue_name,
            name,
            payload,
            status,
            attempts: 0,
            max_attempts: options.max_attempts,
            priority: options.priority,
            delay_until,
            lease: None,
            progress: None,
            result: None,
            error: None,
            parent_id: options.parent_id,
            created_at: now,
            updated_at: now,
            processed_at: None,
            finished_at: None,
        })
    }

    /// Decode the payload into a concrete type.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> QueueResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| QueueError::validation(format!("payload of job {}: {e}", self.id)))
    }

    pub fn lock_token(&self) -> Option<LockToken> {
        self.lease.as_ref().map(|l| l.token)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Whether `claim` may pick this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        let due = self.delay_until.is_none_or(|at| at <= now);
        match self.status {
            JobStatus::Waiting => due,
            JobStatus::Delayed => self.delay_until.is_some_and(|at| at <= now),
            _ => false,
        }
    }

    fn ensure(&self, allowed: &[JobStatus], to: JobStatus) -> QueueResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(QueueError::invalid_transition(self.id, self.status, to))
        }
    }

    fn release(&mut self, now: DateTime<Utc>) {
        self.lease = None;
        self.updated_at = now;
    }

    /// Waiting/Delayed → Active. Increments `attempts`.
    pub fn activate(
        &mut self,
        worker_id: WorkerId,
        token: LockToken,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.ensure(&[JobStatus::Waiting, JobStatus::Delayed], JobStatus::Active)?;
        if !self.is_claimable(now) {
            return Err(QueueError::invalid_transition(self.id, self.status, JobStatus::Active));
        }

        self.status = JobStatus::Active;
        self.attempts += 1;
        self.delay_until = None;
        self.lease = Some(Lease {
            worker_id,
            token,
            lock_until,
        });
        self.processed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Active → Completed.
    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure(&[JobStatus::Active], JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.finished_at = Some(now);
        self.release(now);
        Ok(())
    }

    /// Record a failed attempt: Active → Delayed (with backoff) or Failed.
    pub fn fail_attempt(
        &mut self,
        failure: JobFailure,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<FailureOutcome> {
        if self.has_attempts_left() {
            self.ensure(&[JobStatus::Active], JobStatus::Delayed)?;
            let delay_until = after(now, policy.delay_for_attempt(self.attempts));
            self.status = JobStatus::Delayed;
            self.delay_until = Some(delay_until);
            self.error = Some(failure);
            self.release(now);
            Ok(FailureOutcome::Retrying { delay_until })
        } else {
            self.ensure(&[JobStatus::Active], JobStatus::Failed)?;
            self.status = JobStatus::Failed;
            self.error = Some(failure);
            self.finished_at = Some(now);
            self.release(now);
            Ok(FailureOutcome::Exhausted)
        }
    }

    /// Active → Delayed on request of the lease holder.
    ///
    /// Yielding is not a failed attempt, so the attempt consumed by the claim
    /// is given back.
    pub fn delay(&mut self, until: DateTime<Utc>, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure(&[JobStatus::Active], JobStatus::Delayed)?;
        self.status = JobStatus::Delayed;
        self.delay_until = Some(until);
        self.attempts = self.attempts.saturating_sub(1);
        self.release(now);
        Ok(())
    }

    /// Active → WaitingChildren.
    pub fn wait_for_children(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure(&[JobStatus::Active], JobStatus::WaitingChildren)?;
        self.status = JobStatus::WaitingChildren;
        self.release(now);
        Ok(())
    }

    /// WaitingChildren → Waiting, so the job is claimed again.
    pub fn resume_from_children(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure(&[JobStatus::WaitingChildren], JobStatus::Waiting)?;
        self.status = JobStatus::Waiting;
        self.delay_until = None;
        // The next claim counts a fresh attempt for the parent's continuation.
        self.attempts = self.attempts.saturating_sub(1);
        self.updated_at = now;
        Ok(())
    }

    /// WaitingChildren → Completed.
    pub fn complete_from_children(&mut self, result: Value, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure(&[JobStatus::WaitingChildren], JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.finished_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Push `lock_until` forward for the current lease holder.
    pub fn extend_lease(
        &mut self,
        worker_id: &WorkerId,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.ensure(&[JobStatus::Active], JobStatus::Active)?;
        match self.lease.as_mut() {
            Some(lease) if &lease.worker_id == worker_id => {
                lease.lock_until = lock_until;
                self.updated_at = now;
                Ok(())
            }
            _ => Err(QueueError::LockMismatch(self.id)),
        }
    }

    /// Record progress reported by the lease holder.
    pub fn update_progress(&mut self, progress: Value, now: DateTime<Utc>) -> QueueResult<()> {
        self.ensure(&[JobStatus::Active], JobStatus::Active)?;
        self.progress = Some(progress);
        self.updated_at = now;
        Ok(())
    }

    /// Recover an Active job whose lease expired.
    pub fn recover_stalled(
        &mut self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> QueueResult<FailureOutcome> {
        let failure = match self.lease.as_ref() {
            Some(lease) if self.status == JobStatus::Active => JobFailure::stalled(lease),
            _ => {
                return Err(QueueError::invalid_transition(
                    self.id,
                    self.status,
                    JobStatus::Delayed,
                ));
            }
        };
        self.fail_attempt(failure, policy, now)
    }
}

/// Number of jobs per status in one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub waiting_children: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn increment(&mut self, status: JobStatus) {
        *self.slot(status) += 1;
    }

    pub fn set(&mut self, status: JobStatus, count: u64) {
        *self.slot(status) = count;
    }

    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Waiting => self.waiting,
            JobStatus::Delayed => self.delayed,
            JobStatus::Active => self.active,
            JobStatus::WaitingChildren => self.waiting_children,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.into_iter().map(|s| self.get(s)).sum()
    }

    fn slot(&mut self, status: JobStatus) -> &mut u64 {
        match status {
            JobStatus::Waiting => &mut self.waiting,
            JobStatus::Delayed => &mut self.delayed,
            JobStatus::Active => &mut self.active,
            JobStatus::WaitingChildren => &mut self.waiting_children,
            JobStatus::Completed => &mut self.completed,
            JobStatus::Failed => &mut self.failed,
        }
    }
}
