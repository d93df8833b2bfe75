//! Worker process supervision.
//!
//! Lifecycle: `Stopped → Starting → Running`, and on an unexpected exit
//! `Running → Crashed → Restarting → Running` until `max_restarts`
//! consecutive restarts have happened without a healthy heartbeat in between.
//! Past that the supervisor stops and publishes [`SupervisorEvent::Fatal`].

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, instrument, warn};

use jobforge_core::JobId;
use jobforge_events::{
    EventBus, HealthEvent, HealthStatus, InMemoryEventBus, ProcessMetrics, Subscription,
    SupervisorEvent, SupervisorPhase,
};
use jobforge_protocol::{
    ExecuteJob, FromWorker, LineReader, LineWriter, ProtocolError, Reply, RequestBody, ToWorker,
};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::heartbeat::{HeartbeatHandle, HeartbeatMonitor, LivenessProbe};
use crate::pending::PendingRequests;
use crate::spawn::{BoxedReader, BoxedWriter, ExitInfo, ProcessSpawner};

/// Progress reported by a handler running in the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerProgress {
    pub job_id: JobId,
    pub progress: Value,
}

/// Point-in-time view of the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub phase: SupervisorPhase,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub health: HealthStatus,
}

struct ProcessSlot {
    generation: u64,
    pid: Option<u32>,
    outbox: mpsc::UnboundedSender<ToWorker>,
    kill: Option<oneshot::Sender<()>>,
    monitor: Option<HeartbeatHandle>,
}

#[derive(Default)]
struct State {
    phase: SupervisorPhase,
    /// Set by `start`, cleared by `stop` or an exhausted restart budget.
    running: bool,
    /// Bumped by `start`/`stop`; restart loops from an older session give up.
    session: u64,
    /// Bumped per spawned process; callbacks from older processes are ignored.
    generation: u64,
    restart_count: u32,
    stabilized: bool,
    gave_up: bool,
    health: HealthStatus,
    /// Why we killed the current process, if we did.
    kill_reason: Option<String>,
    process: Option<ProcessSlot>,
}

struct Inner {
    spawner: Arc<dyn ProcessSpawner>,
    config: SupervisorConfig,
    state: Mutex<State>,
    pending: Arc<PendingRequests>,
    events: InMemoryEventBus<SupervisorEvent>,
    health: InMemoryEventBus<HealthEvent>,
    progress: InMemoryEventBus<WorkerProgress>,
}

/// Owns at most one worker process at a time.
pub struct WorkerSupervisor {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkerSupervisor")
            .field("spawner", &self.inner.spawner)
            .field("status", &self.status())
            .finish()
    }
}

impl WorkerSupervisor {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, config: SupervisorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                spawner,
                config,
                state: Mutex::new(State::default()),
                pending: PendingRequests::new(),
                events: InMemoryEventBus::new(),
                health: InMemoryEventBus::new(),
                progress: InMemoryEventBus::new(),
            }),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.inner.config
    }

    /// Spawn the worker. Fails with `AlreadyRunning` if one is already
    /// managed (including while a restart is pending).
    #[instrument(skip(self), err)]
    pub async fn start(&self) -> Result<(), SupervisorError> {
        let session = {
            let mut state = self.inner.state();
            if state.running || state.process.is_some() {
                return Err(SupervisorError::AlreadyRunning);
            }
            state.running = true;
            state.session += 1;
            state.restart_count = 0;
            state.gave_up = false;
            state.health = HealthStatus::Healthy;
            self.inner.set_phase(&mut state, SupervisorPhase::Starting);
            state.session
        };

        if let Err(e) = Inner::spawn_process(&self.inner, session).await {
            let mut state = self.inner.state();
            if state.session == session {
                state.running = false;
                self.inner.set_phase(&mut state, SupervisorPhase::Stopped);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Terminate the worker and stop supervising. Idempotent.
    pub async fn stop(&self) {
        let slot = {
            let mut state = self.inner.state();
            state.running = false;
            state.session += 1;
            let slot = state.process.take();
            self.inner.set_phase(&mut state, SupervisorPhase::Stopped);
            slot
        };

        if let Some(mut slot) = slot {
            let _ = slot.outbox.send(ToWorker::Shutdown);
            if let Some(kill) = slot.kill.take() {
                let _ = kill.send(());
            }
            self.inner.pending.reject_all(SupervisorError::NotRunning);
            if let Some(monitor) = slot.monitor.take() {
                monitor.shutdown().await;
            }
            info!(pid = ?slot.pid, "worker process stopped");
        }
    }

    /// Send one request and wait up to `timeout` for its reply.
    pub async fn send_request(
        &self,
        body: RequestBody,
        timeout: Duration,
    ) -> Result<Reply, SupervisorError> {
        self.inner.request(body, timeout).await
    }

    /// Run a job in the worker. Handler errors come back as
    /// [`SupervisorError::Remote`].
    pub async fn execute(
        &self,
        job: ExecuteJob,
        timeout: Duration,
    ) -> Result<Value, SupervisorError> {
        match self.send_request(RequestBody::Execute { job }, timeout).await? {
            Reply::Executed { result } => Ok(result),
            Reply::Error {
                message,
                stacktrace,
            } => Err(SupervisorError::Remote {
                message,
                stacktrace,
            }),
            Reply::Pong { .. } => Err(SupervisorError::Protocol(
                "unexpected pong reply to execute".to_string(),
            )),
        }
    }

    pub async fn ping(&self, timeout: Duration) -> Result<ProcessMetrics, SupervisorError> {
        self.inner.ping(timeout).await
    }

    pub fn is_running(&self) -> bool {
        let state = self.inner.state();
        state.process.is_some() && state.phase == SupervisorPhase::Running
    }

    pub fn status(&self) -> SupervisorStatus {
        let state = self.inner.state();
        SupervisorStatus {
            phase: state.phase,
            pid: state.process.as_ref().and_then(|p| p.pid),
            restart_count: state.restart_count,
            max_restarts: self.inner.config.max_restarts,
            health: state.health,
        }
    }

    pub fn subscribe_events(&self) -> Subscription<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_health(&self) -> Subscription<HealthEvent> {
        self.inner.health.subscribe()
    }

    pub fn subscribe_progress(&self) -> Subscription<WorkerProgress> {
        self.inner.progress.subscribe()
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        let mut state = self.inner.state();
        state.running = false;
        state.session += 1;
        if let Some(mut slot) = state.process.take()
            && let Some(kill) = slot.kill.take()
        {
            let _ = kill.send(());
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_phase(&self, state: &mut State, to: SupervisorPhase) {
        if state.phase == to {
            return;
        }
        let from = std::mem::replace(&mut state.phase, to);
        debug!(%from, %to, "supervisor phase changed");
        self.emit(SupervisorEvent::PhaseChanged { from, to });
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.events.publish(event);
    }

    async fn request(&self, body: RequestBody, timeout: Duration) -> Result<Reply, SupervisorError> {
        // Registered before the outbox is looked up, so a crash from here on
        // rejects this request with `WorkerCrash` instead of leaving it to time out.
        let request = self.pending.register();
        let outbox = {
            let state = self.state();
            match &state.process {
                Some(slot) => slot.outbox.clone(),
                None if state.gave_up => {
                    return Err(SupervisorError::RestartLimitExceeded {
                        restarts: state.restart_count,
                    });
                }
                None => return Err(SupervisorError::NotRunning),
            }
        };

        let id = request.id();
        let cancellable = matches!(body, RequestBody::Execute { .. });
        outbox
            .send(ToWorker::Request { id, body })
            .map_err(|_| SupervisorError::WorkerCrash("worker input closed".to_string()))?;

        let reply = request.wait(timeout).await;
        if cancellable && matches!(reply, Err(SupervisorError::Timeout { .. })) {
            debug!(request_id = %id, "cancelling timed out execution in the worker");
            let _ = outbox.send(ToWorker::Cancel { id });
        }
        reply
    }

    async fn ping(&self, timeout: Duration) -> Result<ProcessMetrics, SupervisorError> {
        match self.request(RequestBody::Ping, timeout).await? {
            Reply::Pong { metrics } => Ok(metrics),
            other => Err(SupervisorError::Protocol(format!(
                "unexpected reply to ping: {other:?}"
            ))),
        }
    }

    async fn spawn_process(inner: &Arc<Inner>, session: u64) -> Result<(), SupervisorError> {
        let process = inner.spawner.spawn().await?;

        let mut state = inner.state();
        if !state.running || state.session != session {
            // Stopped while we were spawning.
            let _ = process.kill.send(());
            return Err(SupervisorError::NotRunning);
        }

        state.generation += 1;
        let generation = state.generation;
        state.stabilized = false;
        state.kill_reason = None;
        state.health = HealthStatus::Healthy;

        let (outbox, inbox) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(process.stdin, inbox));
        tokio::spawn(Inner::read_loop(inner.clone(), generation, process.stdout));
        tokio::spawn(Inner::watch_exit(inner.clone(), generation, process.exit));

        let (health_tx, health_rx) = mpsc::unbounded_channel();
        let probe = Arc::new(GenerationProbe {
            inner: Arc::downgrade(inner),
            generation,
        });
        let monitor = HeartbeatMonitor::new(probe, inner.config.heartbeat.clone()).spawn(health_tx);
        tokio::spawn(Inner::health_loop(inner.clone(), generation, health_rx));

        state.process = Some(ProcessSlot {
            generation,
            pid: process.pid,
            outbox,
            kill: Some(process.kill),
            monitor: Some(monitor),
        });
        inner.set_phase(&mut state, SupervisorPhase::Running);
        inner.emit(SupervisorEvent::Spawned {
            pid: process.pid,
            restart_count: state.restart_count,
        });
        info!(pid = ?process.pid, restart_count = state.restart_count, "worker process spawned");
        Ok(())
    }

    /// Boxed so the exit watcher → restart → spawn cycle has a nameable,
    /// `Send` future type.
    fn spawn_boxed(
        inner: &Arc<Inner>,
        session: u64,
    ) -> Pin<Box<dyn Future<Output = Result<(), SupervisorError>> + Send + '_>> {
        Box::pin(Inner::spawn_process(inner, session))
    }

    fn is_current(state: &State, generation: u64) -> bool {
        state
            .process
            .as_ref()
            .is_some_and(|slot| slot.generation == generation)
    }

    async fn read_loop(inner: Arc<Inner>, generation: u64, stdout: BoxedReader) {
        let mut reader = LineReader::new(BufReader::new(stdout));
        loop {
            match reader.next::<FromWorker>().await {
                Ok(Some(FromWorker::Response { id, reply })) => {
                    if !inner.pending.resolve(id, reply) {
                        debug!(request_id = %id, "dropping reply with no waiting request");
                    }
                }
                Ok(Some(FromWorker::Progress { job_id, progress })) => {
                    let _ = inner.progress.publish(WorkerProgress { job_id, progress });
                }
                Ok(Some(FromWorker::Fatal { message })) => {
                    let state = inner.state();
                    if Inner::is_current(&state, generation)
                        && let Some(monitor) = state.process.as_ref().and_then(|p| p.monitor.as_ref())
                    {
                        monitor.report_fatal(message);
                    }
                }
                Ok(None) => break,
                Err(e @ ProtocolError::Decode { .. }) => {
                    warn!(error = %e, "ignoring malformed worker message");
                }
                Err(e) => {
                    debug!(error = %e, "worker output closed");
                    break;
                }
            }
        }
    }

    async fn health_loop(
        inner: Arc<Inner>,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<HealthEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let _ = inner.health.publish(event.clone());

            let mut state = inner.state();
            if !Inner::is_current(&state, generation) {
                break;
            }
            state.health = event.status;
            if event.restart_required() && state.running {
                let reason = match &event.message {
                    Some(message) => format!("worker {}: {message}", event.status),
                    None => format!("worker {}", event.status),
                };
                warn!(status = %event.status, reason = %reason, "killing worker for restart");
                state.kill_reason = Some(reason);
                if let Some(kill) = state.process.as_mut().and_then(|p| p.kill.take()) {
                    let _ = kill.send(());
                }
            }
        }
    }

    /// First successful heartbeat after a spawn resets the restart budget.
    fn on_probe_success(&self, generation: u64) {
        let mut state = self.state();
        if !Inner::is_current(&state, generation) || state.stabilized {
            return;
        }
        state.stabilized = true;
        if state.restart_count > 0 {
            info!(previous = state.restart_count, "worker stable; restart count reset");
        }
        state.restart_count = 0;
        let pid = state.process.as_ref().and_then(|p| p.pid);
        self.emit(SupervisorEvent::Stabilized { pid });
    }

    async fn watch_exit(inner: Arc<Inner>, generation: u64, exit: oneshot::Receiver<ExitInfo>) {
        let info = exit.await.unwrap_or_else(|_| ExitInfo {
            code: None,
            reason: "worker exit status unavailable".to_string(),
        });
        Inner::on_exit(&inner, generation, info).await;
    }

    async fn on_exit(inner: &Arc<Inner>, generation: u64, info: ExitInfo) {
        let (session, reason, monitor) = {
            let mut state = inner.state();
            if !Inner::is_current(&state, generation) {
                return;
            }
            let Some(mut slot) = state.process.take() else {
                return;
            };
            let reason = state.kill_reason.take().unwrap_or(info.reason);
            if !state.running {
                inner.set_phase(&mut state, SupervisorPhase::Stopped);
            } else {
                inner.set_phase(&mut state, SupervisorPhase::Crashed);
                error!(pid = ?slot.pid, code = ?info.code, reason = %reason, "worker process exited unexpectedly");
            }
            inner.emit(SupervisorEvent::Exited {
                pid: slot.pid,
                code: info.code,
                reason: reason.clone(),
            });
            (state.running.then_some(state.session), reason, slot.monitor.take())
        };

        let rejected = inner
            .pending
            .reject_all(SupervisorError::WorkerCrash(reason));
        if rejected > 0 {
            warn!(rejected, "in-flight worker requests failed by crash");
        }
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
        }

        if let Some(session) = session {
            Inner::restart_loop(inner, session).await;
        }
    }

    async fn restart_loop(inner: &Arc<Inner>, session: u64) {
        loop {
            let delay = {
                let mut state = inner.state();
                if !state.running || state.session != session {
                    return;
                }
                let max_restarts = inner.config.max_restarts;
                if state.restart_count >= max_restarts {
                    state.running = false;
                    state.gave_up = true;
                    inner.set_phase(&mut state, SupervisorPhase::Stopped);
                    error!(
                        restart_count = state.restart_count,
                        max_restarts, "worker restart limit exceeded; supervisor stopped"
                    );
                    inner.emit(SupervisorEvent::Fatal {
                        message: SupervisorError::RestartLimitExceeded {
                            restarts: state.restart_count,
                        }
                        .to_string(),
                        restart_count: state.restart_count,
                    });
                    return;
                }

                state.restart_count += 1;
                let attempt = state.restart_count;
                let delay = inner.config.restart_policy.delay_for_attempt(attempt);
                inner.set_phase(&mut state, SupervisorPhase::Restarting);
                inner.emit(SupervisorEvent::Restarting {
                    attempt,
                    max_restarts,
                    delay_ms: delay.as_millis() as u64,
                });
                warn!(attempt, max_restarts, delay_ms = delay.as_millis() as u64, "restarting worker");
                delay
            };

            tokio::time::sleep(delay).await;

            match Inner::spawn_boxed(inner, session).await {
                Ok(()) => return,
                Err(SupervisorError::NotRunning) => return,
                Err(e) => {
                    error!(error = %e, "worker respawn failed");
                    let mut state = inner.state();
                    if state.session == session {
                        inner.set_phase(&mut state, SupervisorPhase::Crashed);
                    }
                }
            }
        }
    }
}

async fn write_loop(stdin: BoxedWriter, mut inbox: mpsc::UnboundedReceiver<ToWorker>) {
    let mut writer = LineWriter::new(stdin);
    while let Some(message) = inbox.recv().await {
        if let Err(e) = writer.send(&message).await {
            debug!(error = %e, "worker input closed");
            break;
        }
    }
}

/// Heartbeat probe bound to one spawned process.
struct GenerationProbe {
    inner: Weak<Inner>,
    generation: u64,
}

#[async_trait]
impl LivenessProbe for GenerationProbe {
    async fn probe(&self, timeout: Duration) -> Result<ProcessMetrics, SupervisorError> {
        let inner = self.inner.upgrade().ok_or(SupervisorError::NotRunning)?;
        let metrics = inner.ping(timeout).await?;
        inner.on_probe_success(self.generation);
        Ok(metrics)
    }
}
