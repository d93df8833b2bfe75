//! `jobforge-queue` — queue engine, maintenance sweeper and client facade.

pub mod client;
pub mod config;
pub mod engine;
pub mod sweeper;

pub use client::{ClientEvent, ClientSubscription, QueueClient};
pub use config::{QueueConfig, SweeperConfig};
pub use engine::{ClaimedJob, Finalized, QueueEngine};
pub use sweeper::{MaintenanceSweeper, SweepReport, SweeperHandle};
