//! Per-job enqueue options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::id::JobId;

/// Options accepted when enqueuing a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Lower values are claimed first
    pub priority: i32,
    /// Total number of attempts before the job fails for good (>= 1)
    pub max_attempts: u32,
    /// Delay before the job becomes claimable
    pub delay: Duration,
    /// Parent job waiting on this one
    pub parent_id: Option<JobId>,
    /// Caller-supplied identifier (generated when absent)
    pub job_id: Option<JobId>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            max_attempts: 1,
            delay: Duration::ZERO,
            parent_id: None,
            job_id: None,
        }
    }
}

impl JobOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_parent(mut self, parent_id: JobId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        if self.max_attempts == 0 {
            return Err(QueueError::validation("max_attempts must be at least 1"));
        }
        if self.parent_id.is_some() && self.parent_id == self.job_id {
            return Err(QueueError::validation("a job cannot be its own parent"));
        }
        Ok(())
    }
}
