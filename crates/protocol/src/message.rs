//! Message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobforge_core::{Job, JobId};
use jobforge_events::ProcessMetrics;

/// Correlation id of one request, unique per supervisor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl core::fmt::Display for RequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// What the worker needs to run one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteJob {
    pub job_id: JobId,
    pub queue: String,
    pub name: String,
    pub payload: Value,
    /// 1-based attempt number
    pub attempt: u32,
    pub max_attempts: u32,
}

impl From<&Job> for ExecuteJob {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            queue: job.queue_name.clone(),
            name: job.name.clone(),
            payload: job.payload.clone(),
            attempt: job.attempts,
            max_attempts: job.max_attempts,
        }
    }
}

/// Supervisor → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToWorker {
    Request { id: RequestId, body: RequestBody },
    /// Abandon an `execute` the supervisor stopped waiting for. No reply.
    Cancel { id: RequestId },
    /// Finish in-flight work and exit.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestBody {
    /// Heartbeat probe
    Ping,
    Execute { job: ExecuteJob },
}

/// Worker → supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FromWorker {
    Response { id: RequestId, reply: Reply },
    /// Progress reported by a running handler.
    Progress { job_id: JobId, progress: Value },
    /// Unrecoverable worker condition; the supervisor restarts the process.
    Fatal { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Pong { metrics: ProcessMetrics },
    Executed { result: Value },
    Error {
        message: String,
        stacktrace: Option<String>,
    },
}
