//! The persistence contract the queue engine is built on.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobforge_core::{Job, JobCounts, JobId, JobStatus, LockToken, QueueResult, WorkerId};

/// Durable table of job rows.
///
/// Callers pass `now` explicitly so lease and delay arithmetic follows the
/// caller's clock.
#[async_trait]
pub trait JobStore: Send + Sync + core::fmt::Debug {
    /// Insert a new job. `DuplicateId` if the id exists.
    async fn insert(&self, job: &Job) -> QueueResult<()>;

    async fn find_by_id(&self, id: JobId) -> QueueResult<Option<Job>>;

    /// Atomically claim the next eligible job of `queue`.
    ///
    /// Eligible: `Waiting`, or `Delayed` with `delay_until <= now`. Ordered by
    /// ascending priority, then creation time, then id. The claimed row is
    /// `Active` with a fresh lock token and `lock_until = now + lease`, and
    /// its `attempts` incremented. No two concurrent callers get the same row.
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<(Job, LockToken)>>;

    /// Write `job` only if the stored lock token equals `token`.
    ///
    /// `LockMismatch` otherwise; the stored row is left untouched.
    async fn save_with_lock(&self, job: &Job, token: LockToken) -> QueueResult<()>;

    /// Write `job` only if the stored status equals `expected`.
    ///
    /// For transitions out of lease-less states (`WaitingChildren`).
    async fn save_if_status(&self, job: &Job, expected: JobStatus) -> QueueResult<()>;

    /// Sweeper write: applies only if the stored token AND `lock_until` still
    /// equal what the scan observed, so a lease extended mid-scan wins.
    async fn save_stalled(
        &self,
        job: &Job,
        token: LockToken,
        observed_lock_until: DateTime<Utc>,
    ) -> QueueResult<()>;

    /// Push the lease of an `Active` job held by `worker_id` to `lock_until`.
    async fn extend_lock(
        &self,
        id: JobId,
        worker_id: &WorkerId,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<()>;

    /// `Active` rows of `queue` whose `lock_until < older_than`, oldest lease first.
    async fn find_stalled(
        &self,
        queue: &str,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Job>>;

    /// Delete up to `limit` terminal rows of `queue` finished before
    /// `finished_before`. Returns the number of rows deleted.
    async fn purge_finished(
        &self,
        queue: &str,
        finished_before: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<u64>;

    async fn count_by_status(&self, queue: &str) -> QueueResult<JobCounts>;

    /// Rows of `queue` with `status`, oldest first.
    async fn list_by_status(
        &self,
        queue: &str,
        status: JobStatus,
        limit: usize,
    ) -> QueueResult<Vec<Job>>;
}
