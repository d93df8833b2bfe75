//! Queue error model.

use thiserror::Error;

use crate::id::JobId;
use crate::job::JobStatus;

/// Result type used across the queue layers.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// `LockMismatch` is an expected concurrency outcome (the lease expired or was
/// reclaimed by someone else); callers discard their in-flight work instead of
/// escalating it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// A job with the same identifier already exists.
    #[error("job already exists: {0}")]
    DuplicateId(JobId),

    /// The job does not exist (or was purged).
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// The requested transition is not legal from the job's current status.
    #[error("invalid state transition for job {job_id}: {from} -> {to}")]
    InvalidStateTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// The stored lease does not match the caller's lock token.
    #[error("lock mismatch for job {0}: lease expired or held by another worker")]
    LockMismatch(JobId),

    /// Input failed validation (e.g. `max_attempts == 0`).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The backing store failed.
    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn invalid_transition(job_id: JobId, from: JobStatus, to: JobStatus) -> Self {
        Self::InvalidStateTransition { job_id, from, to }
    }

    /// Whether the error is an expected race rather than a fault.
    pub fn is_lost_lease(&self) -> bool {
        matches!(self, Self::LockMismatch(_))
    }
}
