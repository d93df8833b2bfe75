//! The worker's request loop.
//!
//! Pings are answered inline so heartbeats keep flowing while jobs run;
//! each `execute` runs on its own task. A panicking handler becomes an error
//! reply instead of taking the process down. `cancel` aborts an execution the
//! supervisor gave up on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, warn};

use jobforge_protocol::{
    ExecuteJob, FromWorker, LineReader, LineWriter, ProtocolError, Reply, RequestBody, RequestId,
    ToWorker,
};

use crate::handler::JobContext;
use crate::metrics;
use crate::registry::HandlerRegistry;

#[derive(Debug, Clone)]
pub struct WorkerRuntime {
    registry: Arc<HandlerRegistry>,
    started: Instant,
}

impl WorkerRuntime {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            started: Instant::now(),
        }
    }

    /// Serve requests from `input` until `Shutdown` or end of input, then
    /// wait for in-flight jobs and flush their replies.
    pub async fn run<R, W>(&self, input: R, output: W) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, mut inbox) = mpsc::unbounded_channel::<FromWorker>();
        let writer = tokio::spawn(async move {
            let mut writer = LineWriter::new(output);
            while let Some(message) = inbox.recv().await {
                writer.send(&message).await?;
            }
            Ok::<(), ProtocolError>(())
        });

        let mut reader = LineReader::new(BufReader::new(input));
        let mut in_flight = JoinSet::new();
        let mut running: HashMap<RequestId, AbortHandle> = HashMap::new();
        info!("worker ready");

        loop {
            while in_flight.try_join_next().is_some() {}
            running.retain(|_, handle| !handle.is_finished());

            match reader.next::<ToWorker>().await {
                Ok(Some(ToWorker::Request {
                    id,
                    body: RequestBody::Ping,
                })) => {
                    let _ = outbox.send(FromWorker::Response {
                        id,
                        reply: Reply::Pong {
                            metrics: metrics::sample(self.started),
                        },
                    });
                }
                Ok(Some(ToWorker::Request {
                    id,
                    body: RequestBody::Execute { job },
                })) => {
                    let handle = in_flight.spawn(execute(self.registry.clone(), outbox.clone(), id, job));
                    running.insert(id, handle);
                }
                Ok(Some(ToWorker::Cancel { id })) => match running.remove(&id) {
                    Some(handle) => {
                        warn!(request_id = %id, "cancelling execution");
                        handle.abort();
                    }
                    None => debug!(request_id = %id, "cancel for a request that is not running"),
                },
                Ok(Some(ToWorker::Shutdown)) => {
                    info!("shutdown requested");
                    break;
                }
                Ok(None) => {
                    info!("input closed");
                    break;
                }
                Err(e @ ProtocolError::Decode { .. }) => {
                    warn!(error = %e, "ignoring malformed request");
                }
                Err(e) => return Err(e),
            }
        }

        while in_flight.join_next().await.is_some() {}
        drop(outbox);
        match writer.await {
            Ok(result) => result,
            Err(e) => Err(ProtocolError::Io(std::io::Error::other(e))),
        }
    }
}

async fn execute(
    registry: Arc<HandlerRegistry>,
    outbox: mpsc::UnboundedSender<FromWorker>,
    id: RequestId,
    job: ExecuteJob,
) {
    let job_id = job.job_id;
    let name = job.name.clone();

    let reply = match registry.resolve(&name) {
        None => {
            warn!(job_id = %job_id, name = %name, "no handler registered");
            Reply::Error {
                message: format!("no handler registered for job '{name}'"),
                stacktrace: None,
            }
        }
        Some(handler) => {
            debug!(job_id = %job_id, name = %name, attempt = job.attempt, "executing job");
            let ctx = JobContext::new(job, outbox.clone());
            let task = tokio::spawn(async move { handler.handle(ctx).await });
            let _abort = AbortOnDrop(task.abort_handle());
            match task.await {
                Ok(Ok(result)) => Reply::Executed { result },
                Ok(Err(e)) => Reply::Error {
                    message: e.message,
                    stacktrace: e.stacktrace,
                },
                Err(join) => {
                    error!(job_id = %job_id, name = %name, error = %join, "handler panicked");
                    Reply::Error {
                        message: format!("handler for '{name}' panicked"),
                        stacktrace: Some(join.to_string()),
                    }
                }
            }
        }
    };

    let _ = outbox.send(FromWorker::Response { id, reply });
}

/// Aborts the handler task when the surrounding `execute` is cancelled.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, handler_fn};
    use jobforge_core::JobId;
    use serde_json::{Value, json};
    use tokio::io::{AsyncWriteExt, DuplexStream};

    struct Conn {
        to_worker: LineWriter<DuplexStream>,
        from_worker: LineReader<BufReader<DuplexStream>>,
        task: tokio::task::JoinHandle<Result<(), ProtocolError>>,
    }

    fn serve(registry: HandlerRegistry) -> Conn {
        let (to_worker, worker_in) = tokio::io::duplex(64 * 1024);
        let (worker_out, from_worker) = tokio::io::duplex(64 * 1024);
        let runtime = WorkerRuntime::new(registry);
        let task = tokio::spawn(async move { runtime.run(worker_in, worker_out).await });
        Conn {
            to_worker: LineWriter::new(to_worker),
            from_worker: LineReader::new(BufReader::new(from_worker)),
            task,
        }
    }

    fn execute_request(id: u64, name: &str) -> ToWorker {
        ToWorker::Request {
            id: RequestId(id),
            body: RequestBody::Execute {
                job: ExecuteJob {
                    job_id: JobId::new(),
                    queue: "q".into(),
                    name: name.into(),
                    payload: json!({"n": 2}),
                    attempt: 1,
                    max_attempts: 3,
                },
            },
        }
    }

    /// Sets the flag when dropped, i.e. when the handler future is torn down.
    struct DropFlag(Arc<std::sync::atomic::AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
            .register(
                "double",
                handler_fn(|ctx: JobContext| async move {
                    ctx.progress(json!("halfway"));
                    let n = ctx.payload()["n"].as_i64().unwrap_or(0);
                    Ok::<Value, HandlerError>(json!(n * 2))
                }),
            )
            .register(
                "fail",
                handler_fn(|_ctx: JobContext| async move {
                    Err::<Value, _>(HandlerError::new("bad input").with_stacktrace("at fail"))
                }),
            )
            .register(
                "panic",
                handler_fn(|_ctx: JobContext| async move {
                    if true {
                        panic!("handler bug");
                    }
                    Ok::<Value, HandlerError>(Value::Null)
                }),
            )
    }

    #[tokio::test]
    async fn ping_is_answered_with_metrics() {
        let mut conn = serve(registry());
        conn.to_worker
            .send(&ToWorker::Request {
                id: RequestId(1),
                body: RequestBody::Ping,
            })
            .await
            .unwrap();

        match conn.from_worker.next::<FromWorker>().await.unwrap().unwrap() {
            FromWorker::Response {
                id,
                reply: Reply::Pong { metrics },
            } => {
                assert_eq!(id, RequestId(1));
                assert!(metrics.uptime_ms.is_some());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn execute_reports_progress_then_result() {
        let mut conn = serve(registry());
        conn.to_worker.send(&execute_request(7, "double")).await.unwrap();

        let progress = conn.from_worker.next::<FromWorker>().await.unwrap().unwrap();
        assert!(matches!(progress, FromWorker::Progress { .. }));
        let reply = conn.from_worker.next::<FromWorker>().await.unwrap().unwrap();
        assert_eq!(
            reply,
            FromWorker::Response {
                id: RequestId(7),
                reply: Reply::Executed { result: json!(4) },
            }
        );
    }

    #[tokio::test]
    async fn errors_and_panics_become_error_replies() {
        let mut conn = serve(registry());
        conn.to_worker.send(&execute_request(1, "fail")).await.unwrap();
        let reply = conn.from_worker.next::<FromWorker>().await.unwrap().unwrap();
        assert_eq!(
            reply,
            FromWorker::Response {
                id: RequestId(1),
                reply: Reply::Error {
                    message: "bad input".into(),
                    stacktrace: Some("at fail".into()),
                },
            }
        );

        conn.to_worker.send(&execute_request(2, "panic")).await.unwrap();
        match conn.from_worker.next::<FromWorker>().await.unwrap().unwrap() {
            FromWorker::Response {
                id,
                reply: Reply::Error { message, .. },
            } => {
                assert_eq!(id, RequestId(2));
                assert!(message.contains("panicked"));
            }
            other => panic!("unexpected message {other:?}"),
        }

        conn.to_worker.send(&execute_request(3, "missing")).await.unwrap();
        match conn.from_worker.next::<FromWorker>().await.unwrap().unwrap() {
            FromWorker::Response {
                reply: Reply::Error { message, .. },
                ..
            } => assert!(message.contains("no handler")),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_aborts_a_running_handler() {
        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = dropped.clone();
        let registry = registry().register(
            "block",
            handler_fn(move |_ctx: JobContext| {
                let guard = DropFlag(flag.clone());
                async move {
                    let _guard = guard;
                    std::future::pending::<()>().await;
                    Ok::<Value, HandlerError>(Value::Null)
                }
            }),
        );
        let mut conn = serve(registry);

        conn.to_worker.send(&execute_request(1, "block")).await.unwrap();
        conn.to_worker
            .send(&ToWorker::Cancel { id: RequestId(1) })
            .await
            .unwrap();
        conn.to_worker
            .send(&ToWorker::Request {
                id: RequestId(2),
                body: RequestBody::Ping,
            })
            .await
            .unwrap();

        // The cancelled request gets no reply; the ping does.
        let reply = conn.from_worker.next::<FromWorker>().await.unwrap().unwrap();
        assert!(matches!(reply, FromWorker::Response { id: RequestId(2), .. }));

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while !dropped.load(std::sync::atomic::Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // Shutdown does not wait on the aborted job.
        conn.to_worker.send(&ToWorker::Shutdown).await.unwrap();
        conn.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_ends_the_loop() {
        let mut conn = serve(registry());
        conn.to_worker.send(&ToWorker::Shutdown).await.unwrap();
        conn.task.await.unwrap().unwrap();
        assert!(conn.from_worker.next::<FromWorker>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let mut conn = serve(registry());
        let mut raw = conn.to_worker.into_inner();
        raw.write_all(b"{not json}\n").await.unwrap();
        let mut to_worker = LineWriter::new(raw);
        to_worker
            .send(&ToWorker::Request {
                id: RequestId(9),
                body: RequestBody::Ping,
            })
            .await
            .unwrap();
        let reply = conn.from_worker.next::<FromWorker>().await.unwrap().unwrap();
        assert!(matches!(reply, FromWorker::Response { id: RequestId(9), .. }));
    }
}
