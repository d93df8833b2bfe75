//! Supervisor error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the supervisor and to `send_request` callers.
///
/// `Clone` because one crash rejects every in-flight request with the same error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("worker supervisor is already running")]
    AlreadyRunning,

    #[error("worker is not running")]
    NotRunning,

    /// No response within the request timeout.
    #[error("worker request timed out after {}ms", .after.as_millis())]
    Timeout { after: Duration },

    /// The worker process died with the request in flight.
    #[error("worker crashed: {0}")]
    WorkerCrash(String),

    /// The restart budget is spent; the supervisor must be started again by hand.
    #[error("worker restart limit exceeded after {restarts} restarts")]
    RestartLimitExceeded { restarts: u32 },

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("worker io error: {0}")]
    Io(String),

    #[error("worker protocol error: {0}")]
    Protocol(String),

    /// The handler inside the worker reported an error.
    #[error("{message}")]
    Remote {
        message: String,
        stacktrace: Option<String>,
    },
}

impl From<jobforge_protocol::ProtocolError> for SupervisorError {
    fn from(err: jobforge_protocol::ProtocolError) -> Self {
        match err {
            jobforge_protocol::ProtocolError::Io(e) => SupervisorError::Io(e.to_string()),
            other => SupervisorError::Protocol(other.to_string()),
        }
    }
}
