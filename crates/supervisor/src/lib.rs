//! `jobforge-supervisor` — keeps one isolated worker process alive and feeds
//! it jobs.
//!
//! - [`WorkerSupervisor`]: spawn, request/response, bounded restarts
//! - [`HeartbeatMonitor`]: liveness probing and health classification
//! - [`JobDispatcher`]: claim → execute in the worker → finalize

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod pending;
pub mod spawn;
pub mod supervisor;

pub use config::{DispatcherConfig, HeartbeatConfig, SupervisorConfig};
pub use dispatcher::{DispatcherHandle, JobDispatcher};
pub use error::SupervisorError;
pub use heartbeat::{HeartbeatHandle, HeartbeatMonitor, HeartbeatTracker, LivenessProbe};
pub use pending::{PendingRequest, PendingRequests};
pub use spawn::{CommandSpawner, ExitInfo, ProcessSpawner, WorkerProcess};
pub use supervisor::{SupervisorStatus, WorkerProgress, WorkerSupervisor};
