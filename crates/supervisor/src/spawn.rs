//! Starting worker processes.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::SupervisorError;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub reason: String,
}

/// A live worker: its message pipes plus exit notification and a kill switch.
///
/// Sending on (or dropping) `kill` terminates the process; `exit` fires once
/// it is gone.
pub struct WorkerProcess {
    pub pid: Option<u32>,
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub exit: oneshot::Receiver<ExitInfo>,
    pub kill: oneshot::Sender<()>,
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess").field("pid", &self.pid).finish_non_exhaustive()
    }
}

/// Creates worker processes for the supervisor.
#[async_trait]
pub trait ProcessSpawner: Send + Sync + fmt::Debug {
    async fn spawn(&self) -> Result<WorkerProcess, SupervisorError>;
}

/// Spawns an OS process with piped stdin/stdout and inherited stderr.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl ProcessSpawner for CommandSpawner {
    async fn spawn(&self) -> Result<WorkerProcess, SupervisorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {e}", self.program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SupervisorError::Spawn("worker stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Spawn("worker stdout was not captured".to_string()))?;
        let pid = child.id();

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            // A dropped kill sender also counts as a kill request.
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    debug!(pid = ?pid, "killing worker process");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let info = match status {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    reason: format!("worker exited ({status})"),
                },
                Err(e) => ExitInfo {
                    code: None,
                    reason: format!("failed to reap worker: {e}"),
                },
            };
            let _ = exit_tx.send(info);
        });

        Ok(WorkerProcess {
            pid,
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            exit: exit_rx,
            kill: kill_tx,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn exit_is_reported() {
        let spawner = CommandSpawner::new("sh").arg("-c").arg("exit 3");
        let process = spawner.spawn().await.unwrap();
        let info = tokio::time::timeout(Duration::from_secs(5), process.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.code, Some(3));
    }

    #[tokio::test]
    async fn kill_terminates_the_process() {
        let spawner = CommandSpawner::new("sleep").arg("30");
        let process = spawner.spawn().await.unwrap();
        assert!(process.pid.is_some());
        process.kill.send(()).unwrap();
        let info = tokio::time::timeout(Duration::from_secs(5), process.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.code, None);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let err = CommandSpawner::new("/nonexistent/jobforge-worker")
            .spawn()
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Spawn(_)));
    }
}
