//! In-process fake worker speaking the real line protocol over duplex pipes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{BufReader, DuplexStream};
use tokio::sync::oneshot;

use jobforge_core::RetryPolicy;
use jobforge_events::{ProcessMetrics, Subscription, SupervisorEvent};
use jobforge_core::JobId;
use jobforge_protocol::{
    FromWorker, LineReader, LineWriter, Reply, RequestBody, RequestId, ToWorker,
};
use jobforge_supervisor::{
    ExitInfo, HeartbeatConfig, ProcessSpawner, SupervisorConfig, SupervisorError, WorkerProcess,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answers pings and runs the scripted job names.
    Responsive,
    /// Exits as soon as it starts.
    CrashOnStart,
    /// Reads requests and never answers.
    Silent,
}

/// Spawns fake workers; each spawn takes the next scripted behavior and the
/// last one repeats.
#[derive(Debug)]
pub struct FakeSpawner {
    script: Mutex<Vec<Behavior>>,
    spawned: AtomicU32,
}

impl FakeSpawner {
    pub fn new(behavior: Behavior) -> Self {
        Self::scripted(vec![behavior])
    }

    pub fn scripted(script: Vec<Behavior>) -> Self {
        assert!(!script.is_empty());
        Self {
            script: Mutex::new(script),
            spawned: AtomicU32::new(0),
        }
    }

    pub fn spawned(&self) -> u32 {
        self.spawned.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> Behavior {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.remove(0)
        } else {
            script[0]
        }
    }
}

#[async_trait]
impl ProcessSpawner for FakeSpawner {
    async fn spawn(&self) -> Result<WorkerProcess, SupervisorError> {
        let n = self.spawned.fetch_add(1, Ordering::SeqCst) + 1;
        let behavior = self.next_behavior();

        let (stdin, worker_in) = tokio::io::duplex(64 * 1024);
        let (worker_out, stdout) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let code = tokio::select! {
                code = fake_worker(behavior, worker_in, worker_out) => code,
                _ = kill_rx => None,
            };
            let _ = exit_tx.send(ExitInfo {
                code,
                reason: format!("fake worker exited ({code:?})"),
            });
        });

        Ok(WorkerProcess {
            pid: Some(1000 + n),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            exit: exit_rx,
            kill: kill_tx,
        })
    }
}

/// Job names understood by the fake worker:
/// `echo` returns the payload, `progress` reports 50 then finishes,
/// `hang` never answers (a `cancel` for it is acknowledged with a
/// `"cancelled"` progress update), `crash` exits, `fatal` reports a fatal condition,
/// anything else is a handler error.
async fn fake_worker(
    behavior: Behavior,
    input: DuplexStream,
    output: DuplexStream,
) -> Option<i32> {
    if behavior == Behavior::CrashOnStart {
        return Some(1);
    }

    let mut reader = LineReader::new(BufReader::new(input));
    let mut writer = LineWriter::new(output);
    let mut hanging: HashMap<RequestId, JobId> = HashMap::new();

    loop {
        let (id, body) = match reader.next::<ToWorker>().await {
            Ok(Some(ToWorker::Request { id, body })) => (id, body),
            Ok(Some(ToWorker::Cancel { id })) => {
                if let Some(job_id) = hanging.remove(&id) {
                    writer
                        .send(&FromWorker::Progress {
                            job_id,
                            progress: json!("cancelled"),
                        })
                        .await
                        .ok()?;
                }
                continue;
            }
            Ok(Some(ToWorker::Shutdown)) | Ok(None) | Err(_) => return Some(0),
        };
        if behavior == Behavior::Silent {
            continue;
        }

        let reply = match body {
            RequestBody::Ping => Reply::Pong {
                metrics: ProcessMetrics {
                    memory_rss_bytes: Some(4096),
                    ..ProcessMetrics::default()
                },
            },
            RequestBody::Execute { job } => match job.name.as_str() {
                "echo" => Reply::Executed {
                    result: job.payload,
                },
                "progress" => {
                    writer
                        .send(&FromWorker::Progress {
                            job_id: job.job_id,
                            progress: json!(50),
                        })
                        .await
                        .ok()?;
                    Reply::Executed {
                        result: json!("done"),
                    }
                }
                "hang" => {
                    hanging.insert(id, job.job_id);
                    continue;
                }
                "crash" => return Some(137),
                "fatal" => {
                    writer
                        .send(&FromWorker::Fatal {
                            message: "worker state corrupted".to_string(),
                        })
                        .await
                        .ok()?;
                    continue;
                }
                other => Reply::Error {
                    message: format!("no handler for {other}"),
                    stacktrace: Some("at fake_worker".to_string()),
                },
            },
        };

        if writer.send(&FromWorker::Response { id, reply }).await.is_err() {
            return Some(0);
        }
    }
}

/// Small delays everywhere so scenarios finish quickly.
pub fn fast_config(max_restarts: u32) -> SupervisorConfig {
    SupervisorConfig {
        max_restarts,
        restart_policy: RetryPolicy::fixed(Duration::from_millis(10)),
        request_timeout: Duration::from_secs(1),
        heartbeat: HeartbeatConfig {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(50),
            max_retries: 2,
        },
    }
}

/// Receive supervisor events until `pick` matches one.
pub async fn wait_for_event<T>(
    events: &mut Subscription<SupervisorEvent>,
    mut pick: impl FnMut(&SupervisorEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let event = events.recv().await.expect("supervisor event bus closed");
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    })
    .await
    .expect("timed out waiting for supervisor event")
}
