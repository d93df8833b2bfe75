//! Tracing/logging setup shared by the jobforge binaries.

/// Initialize process-wide logging to stdout.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogTarget::Stdout);
}

/// Initialize logging for a worker process.
///
/// Worker stdout carries the supervisor protocol, so logs go to stderr.
pub fn init_for_worker() {
    tracing::init(tracing::LogTarget::Stderr);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
