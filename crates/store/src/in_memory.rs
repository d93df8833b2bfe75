//! In-memory job store for tests/dev.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use jobforge_core::clock::after;
use jobforge_core::{
    Job, JobCounts, JobId, JobStatus, LockToken, QueueError, QueueResult, WorkerId,
};

use crate::store::JobStore;

/// Job store backed by a `HashMap` behind one lock.
///
/// Each operation takes the write lock once, which makes it as atomic as the
/// single-statement Postgres equivalent.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.read().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> QueueResult<RwLockReadGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .read()
            .map_err(|_| QueueError::storage("in-memory job store lock poisoned"))
    }

    fn write(&self) -> QueueResult<RwLockWriteGuard<'_, HashMap<JobId, Job>>> {
        self.jobs
            .write()
            .map_err(|_| QueueError::storage("in-memory job store lock poisoned"))
    }

    /// Replace the stored row if `guard` accepts it, mapping a rejection to `rejected`.
    fn replace_if(
        &self,
        job: &Job,
        guard: impl FnOnce(&Job) -> bool,
        rejected: impl FnOnce(&Job) -> QueueError,
    ) -> QueueResult<()> {
        let mut jobs = self.write()?;
        let stored = jobs.get_mut(&job.id).ok_or(QueueError::NotFound(job.id))?;
        if !guard(stored) {
            return Err(rejected(stored));
        }
        *stored = job.clone();
        Ok(())
    }
}

fn claim_order(job: &Job) -> (i32, DateTime<Utc>, JobId) {
    (job.priority, job.created_at, job.id)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &Job) -> QueueResult<()> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(QueueError::DuplicateId(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: JobId) -> QueueResult<Option<Job>> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<(Job, LockToken)>> {
        let mut jobs = self.write()?;

        let next = jobs
            .values()
            .filter(|j| j.queue_name == queue && j.is_claimable(now))
            .min_by_key(|j| claim_order(j))
            .map(|j| j.id);

        let Some(job) = next.and_then(|id| jobs.get_mut(&id)) else {
            return Ok(None);
        };

        let token = LockToken::new();
        job.activate(worker_id.clone(), token, after(now, lease), now)?;
        Ok(Some((job.clone(), token)))
    }

    async fn save_with_lock(&self, job: &Job, token: LockToken) -> QueueResult<()> {
        self.replace_if(
            job,
            |stored| stored.lock_token() == Some(token),
            |stored| QueueError::LockMismatch(stored.id),
        )
    }

    async fn save_if_status(&self, job: &Job, expected: JobStatus) -> QueueResult<()> {
        self.replace_if(
            job,
            |stored| stored.status == expected,
            |stored| QueueError::invalid_transition(stored.id, stored.status, job.status),
        )
    }

    async fn save_stalled(
        &self,
        job: &Job,
        token: LockToken,
        observed_lock_until: DateTime<Utc>,
    ) -> QueueResult<()> {
        self.replace_if(
            job,
            |stored| {
                stored.lease.as_ref().is_some_and(|lease| {
                    lease.token == token && lease.lock_until == observed_lock_until
                })
            },
            |stored| QueueError::LockMismatch(stored.id),
        )
    }

    async fn extend_lock(
        &self,
        id: JobId,
        worker_id: &WorkerId,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        job.extend_lease(worker_id, lock_until, now)
            .map_err(|_| QueueError::LockMismatch(id))
    }

    async fn find_stalled(
        &self,
        queue: &str,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        let jobs = self.read()?;
        let mut stalled: Vec<Job> = jobs
            .values()
            .filter(|j| {
                j.queue_name == queue
                    && j.status == JobStatus::Active
                    && j.lease.as_ref().is_some_and(|l| l.lock_until < older_than)
            })
            .cloned()
            .collect();

        stalled.sort_by_key(|j| (j.lease.as_ref().map(|l| l.lock_until), j.id));
        stalled.truncate(limit);
        Ok(stalled)
    }

    async fn purge_finished(
        &self,
        queue: &str,
        finished_before: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<u64> {
        let mut jobs = self.write()?;
        let mut expired: Vec<(DateTime<Utc>, JobId)> = jobs
            .values()
            .filter(|j| j.queue_name == queue && j.status.is_terminal())
            .filter_map(|j| j.finished_at.map(|at| (at, j.id)))
            .filter(|(at, _)| *at < finished_before)
            .collect();

        expired.sort();
        expired.truncate(limit);

        for (_, id) in &expired {
            jobs.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn count_by_status(&self, queue: &str) -> QueueResult<JobCounts> {
        let jobs = self.read()?;
        let mut counts = JobCounts::default();
        for job in jobs.values().filter(|j| j.queue_name == queue) {
            counts.increment(job.status);
        }
        Ok(counts)
    }

    async fn list_by_status(
        &self,
        queue: &str,
        status: JobStatus,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        let jobs = self.read()?;
        let mut result: Vec<Job> = jobs
            .values()
            .filter(|j| j.queue_name == queue && j.status == status)
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }
}
