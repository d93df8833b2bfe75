//! `jobforge-core` — job queue domain primitives.
//!
//! This crate is **pure**: job entity and state machine, identifiers, options,
//! retry policy, clock and the error taxonomy. No IO.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod options;
pub mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{QueueError, QueueResult};
pub use id::{JobId, LockToken, WorkerId};
pub use job::{FailureKind, FailureOutcome, Job, JobCounts, JobFailure, JobStatus, Lease};
pub use options::JobOptions;
pub use retry::{BackoffStrategy, RetryPolicy};
