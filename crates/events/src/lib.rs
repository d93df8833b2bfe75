//! `jobforge-events` — pub/sub for queue, health and supervisor events.
//!
//! The bus is for distribution only; the job store stays the source of truth.

pub mod bus;
pub mod health;
pub mod in_memory_bus;
pub mod queue;
pub mod supervisor;

pub use bus::{EventBus, Subscription};
pub use health::{HealthEvent, HealthStatus, ProcessMetrics};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use queue::QueueEvent;
pub use supervisor::{SupervisorEvent, SupervisorPhase};
