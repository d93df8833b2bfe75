//! `jobforge-store` — job persistence.
//!
//! Every operation maps to one atomic conditional statement against the
//! backing store; concurrency safety comes from those statements, not from
//! in-process locks held by callers.

pub mod in_memory;
pub mod postgres;
pub mod store;

pub use in_memory::InMemoryJobStore;
pub use postgres::{PostgresJobStore, SCHEMA};
pub use store::JobStore;
