//! `jobforge-runtime` — configuration and wiring of a complete job runner:
//! store, queue engine, maintenance sweeper, supervised worker and one
//! dispatcher per queue.

pub mod app;
pub mod config;

pub use app::{Runtime, build_store};
pub use config::{ConfigError, RuntimeConfig};
