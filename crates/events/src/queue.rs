//! Job lifecycle events published by the queue engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobforge_core::{JobFailure, JobId, WorkerId};

/// A state change of one job (or a batch cleanup).
///
/// Published after the store write succeeded, so subscribers never observe an
/// event for a change that was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    Added {
        queue: String,
        job_id: JobId,
        name: String,
    },
    Active {
        queue: String,
        job_id: JobId,
        worker_id: WorkerId,
        attempt: u32,
    },
    Progress {
        queue: String,
        job_id: JobId,
        progress: Value,
    },
    Completed {
        queue: String,
        job_id: JobId,
        result: Value,
    },
    /// Terminal failure; attempts are exhausted.
    Failed {
        queue: String,
        job_id: JobId,
        attempts: u32,
        error: JobFailure,
    },
    /// A failed attempt was rescheduled with backoff.
    Retrying {
        queue: String,
        job_id: JobId,
        attempts: u32,
        delay_until: DateTime<Utc>,
        error: JobFailure,
    },
    /// The lease holder yielded the job until a later time.
    Delayed {
        queue: String,
        job_id: JobId,
        delay_until: DateTime<Utc>,
    },
    WaitingChildren {
        queue: String,
        job_id: JobId,
    },
    /// The sweeper reclaimed an expired lease.
    Stalled {
        queue: String,
        job_id: JobId,
        worker_id: WorkerId,
    },
    /// A lease holder's write was rejected because its lease was gone.
    LeaseLost {
        queue: String,
        job_id: JobId,
        operation: String,
    },
    Cleaned {
        queue: String,
        count: u64,
    },
}

impl QueueEvent {
    pub fn queue(&self) -> &str {
        match self {
            QueueEvent::Added { queue, .. }
            | QueueEvent::Active { queue, .. }
            | QueueEvent::Progress { queue, .. }
            | QueueEvent::Completed { queue, .. }
            | QueueEvent::Failed { queue, .. }
            | QueueEvent::Retrying { queue, .. }
            | QueueEvent::Delayed { queue, .. }
            | QueueEvent::WaitingChildren { queue, .. }
            | QueueEvent::Stalled { queue, .. }
            | QueueEvent::LeaseLost { queue, .. }
            | QueueEvent::Cleaned { queue, .. } => queue,
        }
    }

    pub fn job_id(&self) -> Option<JobId> {
        match self {
            QueueEvent::Added { job_id, .. }
            | QueueEvent::Active { job_id, .. }
            | QueueEvent::Progress { job_id, .. }
            | QueueEvent::Completed { job_id, .. }
            | QueueEvent::Failed { job_id, .. }
            | QueueEvent::Retrying { job_id, .. }
            | QueueEvent::Delayed { job_id, .. }
            | QueueEvent::WaitingChildren { job_id, .. }
            | QueueEvent::Stalled { job_id, .. }
            | QueueEvent::LeaseLost { job_id, .. } => Some(*job_id),
            QueueEvent::Cleaned { .. } => None,
        }
    }

    /// Stable event name (e.g. `"job.completed"`).
    pub fn event_type(&self) -> &'static str {
        match self {
            QueueEvent::Added { .. } => "job.added",
            QueueEvent::Active { .. } => "job.active",
            QueueEvent::Progress { .. } => "job.progress",
            QueueEvent::Completed { .. } => "job.completed",
            QueueEvent::Failed { .. } => "job.failed",
            QueueEvent::Retrying { .. } => "job.retrying",
            QueueEvent::Delayed { .. } => "job.delayed",
            QueueEvent::WaitingChildren { .. } => "job.waiting_children",
            QueueEvent::Stalled { .. } => "job.stalled",
            QueueEvent::LeaseLost { .. } => "job.lease_lost",
            QueueEvent::Cleaned { .. } => "queue.cleaned",
        }
    }
}
