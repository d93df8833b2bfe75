//! `jobforge-worker` — the process the supervisor runs jobs in.
//!
//! A worker reads requests from stdin, routes `execute` requests to a
//! [`JobHandler`] by job name and writes replies to stdout. Logs go to stderr.

pub mod handler;
pub mod metrics;
pub mod registry;
pub mod runtime;

pub use handler::{HandlerError, JobContext, JobHandler, handler_fn};
pub use registry::HandlerRegistry;
pub use runtime::WorkerRuntime;
