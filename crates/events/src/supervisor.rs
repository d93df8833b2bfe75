//! Worker process lifecycle events.

use serde::{Deserialize, Serialize};

/// Supervisor lifecycle phase.
///
/// `Stopped → Starting → Running → Crashed → Restarting → Running`, or back to
/// `Stopped` after the restart limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorPhase {
    #[default]
    Stopped,
    Starting,
    Running,
    Crashed,
    Restarting,
}

impl SupervisorPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SupervisorPhase::Stopped => "stopped",
            SupervisorPhase::Starting => "starting",
            SupervisorPhase::Running => "running",
            SupervisorPhase::Crashed => "crashed",
            SupervisorPhase::Restarting => "restarting",
        }
    }
}

impl core::fmt::Display for SupervisorPhase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    PhaseChanged {
        from: SupervisorPhase,
        to: SupervisorPhase,
    },
    Spawned {
        pid: Option<u32>,
        restart_count: u32,
    },
    /// The first probe after a spawn succeeded; the restart counter is reset.
    Stabilized { pid: Option<u32> },
    /// The process went away while it was supposed to be running.
    Exited {
        pid: Option<u32>,
        code: Option<i32>,
        reason: String,
    },
    Restarting {
        attempt: u32,
        max_restarts: u32,
        delay_ms: u64,
    },
    /// The restart limit was hit; the supervisor is stopped for good.
    Fatal { message: String, restart_count: u32 },
}

impl SupervisorEvent {
    pub fn is_fatal(&self) -> bool {
        matches!(self, SupervisorEvent::Fatal { .. })
    }
}
