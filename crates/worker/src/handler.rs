//! Job handler contract.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use jobforge_core::JobId;
use jobforge_protocol::{ExecuteJob, FromWorker};

/// A handler failure, reported to the queue as an execution failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub stacktrace: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stacktrace: None,
        }
    }

    pub fn with_stacktrace(mut self, stacktrace: impl Into<String>) -> Self {
        self.stacktrace = Some(stacktrace.into());
        self
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::new(format!("invalid payload: {err}"))
    }
}

/// What a handler sees of the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: ExecuteJob,
    outbox: mpsc::UnboundedSender<FromWorker>,
}

impl JobContext {
    pub(crate) fn new(job: ExecuteJob, outbox: mpsc::UnboundedSender<FromWorker>) -> Self {
        Self { job, outbox }
    }

    pub fn job_id(&self) -> JobId {
        self.job.job_id
    }

    pub fn name(&self) -> &str {
        &self.job.name
    }

    pub fn queue(&self) -> &str {
        &self.job.queue
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.job.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.job.max_attempts
    }

    pub fn payload(&self) -> &Value {
        &self.job.payload
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_value(self.job.payload.clone())?)
    }

    /// Report progress to the supervisor.
    pub fn progress(&self, progress: Value) {
        let _ = self.outbox.send(FromWorker::Progress {
            job_id: self.job.job_id,
            progress,
        });
    }

    /// Tell the supervisor this process is unusable and must be restarted.
    pub fn report_fatal(&self, message: impl Into<String>) {
        let _ = self.outbox.send(FromWorker::Fatal {
            message: message.into(),
        });
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError>;
}

/// Adapter turning an async closure into a [`JobHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F, Fut>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        (self.f)(ctx).await
    }
}
