//! Postgres-backed job store.
//!
//! Every contract operation is one SQL statement. Conditional writes put the
//! guard (lock token, status, observed `lock_until`) in the `WHERE` clause and
//! inspect `rows_affected`; a zero count is followed by an existence check to
//! tell `NotFound` apart from a lost race.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | QueueError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `DuplicateId` (insert only) |
//! | Database (check constraint violation) | `23514` | `Validation` |
//! | Any other | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row};
use tracing::{debug, instrument};

use jobforge_core::clock::after;
use jobforge_core::{
    Job, JobCounts, JobFailure, JobId, JobStatus, Lease, LockToken, QueueError, QueueResult,
    WorkerId,
};

use crate::store::JobStore;

/// DDL for the `jobs` table. Idempotent.
///
/// The check constraint makes "lease present iff active" hold at the
/// database level too.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id            UUID PRIMARY KEY,
    queue_name    TEXT NOT NULL,
    name          TEXT NOT NULL,
    payload       JSONB NOT NULL,
    status        TEXT NOT NULL,
    attempts      INTEGER NOT NULL DEFAULT 0,
    max_attempts  INTEGER NOT NULL CHECK (max_attempts >= 1),
    priority      INTEGER NOT NULL DEFAULT 0,
    delay_until   TIMESTAMPTZ,
    worker_id     TEXT,
    lock_token    UUID,
    lock_until    TIMESTAMPTZ,
    progress      JSONB,
    result        JSONB,
    error         JSONB,
    parent_id     UUID,
    created_at    TIMESTAMPTZ NOT NULL,
    updated_at    TIMESTAMPTZ NOT NULL,
    processed_at  TIMESTAMPTZ,
    finished_at   TIMESTAMPTZ,
    CONSTRAINT jobs_lease_iff_active CHECK (
        (status = 'active') = (worker_id IS NOT NULL AND lock_token IS NOT NULL AND lock_until IS NOT NULL)
    )
);

CREATE INDEX IF NOT EXISTS jobs_claim_idx
    ON jobs (queue_name, priority, created_at, id)
    WHERE status IN ('waiting', 'delayed');

CREATE INDEX IF NOT EXISTS jobs_stalled_idx
    ON jobs (queue_name, lock_until)
    WHERE status = 'active';

CREATE INDEX IF NOT EXISTS jobs_finished_idx
    ON jobs (queue_name, finished_at)
    WHERE status IN ('completed', 'failed');
"#;

const JOB_COLUMNS: &str = "id, queue_name, name, payload, status, attempts, max_attempts, priority, \
     delay_until, worker_id, lock_token, lock_until, progress, result, error, parent_id, \
     created_at, updated_at, processed_at, finished_at";

/// Full-row update; `$1` is the id, the guard is appended per caller.
macro_rules! update_job_sql {
    ($guard:literal) => {
        concat!(
            "UPDATE jobs SET status = $2, attempts = $3, delay_until = $4, worker_id = $5, ",
            "lock_token = $6, lock_until = $7, progress = $8, result = $9, error = $10, ",
            "updated_at = $11, processed_at = $12, finished_at = $13 ",
            "WHERE id = $1 ",
            $guard
        )
    };
}

/// Postgres job store.
///
/// `Send + Sync`; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> QueueResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> QueueResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn fetch_job(&self, operation: &str, id: JobId) -> QueueResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        row.map(|row| decode_job(&row)).transpose()
    }

    /// Explain a conditional write that touched no row.
    async fn rejected(
        &self,
        operation: &str,
        id: JobId,
        on_conflict: impl FnOnce(&Job) -> QueueError,
    ) -> QueueError {
        match self.fetch_job(operation, id).await {
            Ok(Some(current)) => on_conflict(&current),
            Ok(None) => QueueError::NotFound(id),
            Err(e) => e,
        }
    }

    async fn fetch_jobs(
        &self,
        operation: &str,
        query: Query<'_, Postgres, PgArguments>,
    ) -> QueueResult<Vec<Job>> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(decode_job).collect()
    }
}

/// Bind `$1..$13` of `update_job_sql!`.
fn bind_update<'q>(sql: &'q str, job: &'q Job) -> QueueResult<Query<'q, Postgres, PgArguments>> {
    let lease = job.lease.as_ref();
    let attempts = int_column("attempts", job.attempts)?;
    Ok(sqlx::query(sql)
        .bind(job.id.as_uuid())
        .bind(job.status.as_str())
        .bind(attempts)
        .bind(job.delay_until)
        .bind(lease.map(|l| l.worker_id.as_str()))
        .bind(lease.map(|l| *l.token.as_uuid()))
        .bind(lease.map(|l| l.lock_until))
        .bind(job.progress.clone())
        .bind(job.result.clone())
        .bind(job.error.clone().map(Json))
        .bind(job.updated_at)
        .bind(job.processed_at)
        .bind(job.finished_at))
}

/// Counters are stored as `INTEGER`.
fn int_column(column: &str, value: u32) -> QueueResult<i32> {
    i32::try_from(value).map_err(|_| {
        QueueError::validation(format!("{column} {value} is out of range for the jobs table"))
    })
}

fn row_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, queue = %job.queue_name), err)]
    async fn insert(&self, job: &Job) -> QueueResult<()> {
        let sql = format!(
            "INSERT INTO jobs ({JOB_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"
        );
        let lease = job.lease.as_ref();
        let attempts = int_column("attempts", job.attempts)?;
        let max_attempts = int_column("max_attempts", job.max_attempts)?;
        sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(&job.queue_name)
            .bind(&job.name)
            .bind(&job.payload)
            .bind(job.status.as_str())
            .bind(attempts)
            .bind(max_attempts)
            .bind(job.priority)
            .bind(job.delay_until)
            .bind(lease.map(|l| l.worker_id.as_str()))
            .bind(lease.map(|l| *l.token.as_uuid()))
            .bind(lease.map(|l| l.lock_until))
            .bind(job.progress.clone())
            .bind(job.result.clone())
            .bind(job.error.clone().map(Json))
            .bind(job.parent_id.map(|p| *p.as_uuid()))
            .bind(job.created_at)
            .bind(job.updated_at)
            .bind(job.processed_at)
            .bind(job.finished_at)
            .execute(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    QueueError::DuplicateId(job.id)
                } else {
                    map_sqlx_error("insert", e)
                }
            })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn find_by_id(&self, id: JobId) -> QueueResult<Option<Job>> {
        self.fetch_job("find_by_id", id).await
    }

    #[instrument(skip(self), fields(queue = %queue, worker_id = %worker_id), err)]
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &WorkerId,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<(Job, LockToken)>> {
        let token = LockToken::new();
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'active',
                attempts = attempts + 1,
                worker_id = $2,
                lock_token = $3,
                lock_until = $4,
                delay_until = NULL,
                processed_at = $5,
                updated_at = $5
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue_name = $1
                  AND (
                    (status = 'waiting' AND (delay_until IS NULL OR delay_until <= $5))
                    OR (status = 'delayed' AND delay_until <= $5)
                  )
                ORDER BY priority ASC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(queue)
            .bind(worker_id.as_str())
            .bind(token.as_uuid())
            .bind(after(now, lease))
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        match row {
            Some(row) => {
                let job = decode_job(&row)?;
                debug!(job_id = %job.id, attempt = job.attempts, "claimed job");
                Ok(Some((job, token)))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn save_with_lock(&self, job: &Job, token: LockToken) -> QueueResult<()> {
        let result = bind_update(update_job_sql!("AND lock_token = $14"), job)?
            .bind(token.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("save_with_lock", e))?;

        if result.rows_affected() == 0 {
            return Err(self
                .rejected("save_with_lock", job.id, |current| {
                    QueueError::LockMismatch(current.id)
                })
                .await);
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, expected = %expected), err)]
    async fn save_if_status(&self, job: &Job, expected: JobStatus) -> QueueResult<()> {
        let result = bind_update(update_job_sql!("AND status = $14"), job)?
            .bind(expected.as_str())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("save_if_status", e))?;

        if result.rows_affected() == 0 {
            return Err(self
                .rejected("save_if_status", job.id, |current| {
                    QueueError::invalid_transition(current.id, current.status, job.status)
                })
                .await);
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn save_stalled(
        &self,
        job: &Job,
        token: LockToken,
        observed_lock_until: DateTime<Utc>,
    ) -> QueueResult<()> {
        let result = bind_update(
            update_job_sql!("AND status = 'active' AND lock_token = $14 AND lock_until = $15"),
            job,
        )?
        .bind(token.as_uuid())
        .bind(observed_lock_until)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_stalled", e))?;

        if result.rows_affected() == 0 {
            return Err(self
                .rejected("save_stalled", job.id, |current| {
                    QueueError::LockMismatch(current.id)
                })
                .await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id, worker_id = %worker_id), err)]
    async fn extend_lock(
        &self,
        id: JobId,
        worker_id: &WorkerId,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_until = $3, updated_at = $4
            WHERE id = $1 AND status = 'active' AND worker_id = $2
            "#,
        )
        .bind(id.as_uuid())
        .bind(worker_id.as_str())
        .bind(lock_until)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("extend_lock", e))?;

        if result.rows_affected() == 0 {
            return Err(self
                .rejected("extend_lock", id, |current| QueueError::LockMismatch(current.id))
                .await);
        }
        Ok(())
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn find_stalled(
        &self,
        queue: &str,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE queue_name = $1 AND status = 'active' AND lock_until < $2 \
             ORDER BY lock_until ASC, id ASC LIMIT $3"
        );
        let query = sqlx::query(&sql)
            .bind(queue)
            .bind(older_than)
            .bind(row_limit(limit));
        self.fetch_jobs("find_stalled", query).await
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn purge_finished(
        &self,
        queue: &str,
        finished_before: DateTime<Utc>,
        limit: usize,
    ) -> QueueResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id FROM jobs
                WHERE queue_name = $1
                  AND status IN ('completed', 'failed')
                  AND finished_at < $2
                ORDER BY finished_at ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(queue)
        .bind(finished_before)
        .bind(row_limit(limit))
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("purge_finished", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn count_by_status(&self, queue: &str) -> QueueResult<JobCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS total FROM jobs WHERE queue_name = $1 GROUP BY status",
        )
        .bind(queue)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("count_by_status", e))?;
            let total: i64 = row
                .try_get("total")
                .map_err(|e| map_sqlx_error("count_by_status", e))?;
            counts.set(status.parse()?, total as u64);
        }
        Ok(counts)
    }

    #[instrument(skip(self), fields(queue = %queue, status = %status), err)]
    async fn list_by_status(
        &self,
        queue: &str,
        status: JobStatus,
        limit: usize,
    ) -> QueueResult<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE queue_name = $1 AND status = $2 \
             ORDER BY created_at ASC, id ASC LIMIT $3"
        );
        let query = sqlx::query(&sql)
            .bind(queue)
            .bind(status.as_str())
            .bind(row_limit(limit));
        self.fetch_jobs("list_by_status", query).await
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                // Check constraint violation
                Some("23514") => QueueError::Validation(msg),
                _ => QueueError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            QueueError::storage(format!("connection pool closed in {}", operation))
        }
        _ => QueueError::storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn decode_job(row: &PgRow) -> QueueResult<Job> {
    JobRow::from_row(row)
        .map_err(|e| QueueError::storage(format!("failed to decode job row: {}", e)))?
        .try_into()
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    queue_name: String,
    name: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    max_attempts: i32,
    priority: i32,
    delay_until: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    lock_token: Option<uuid::Uuid>,
    lock_until: Option<DateTime<Utc>>,
    progress: Option<serde_json::Value>,
    result: Option<serde_json::Value>,
    error: Option<Json<JobFailure>>,
    parent_id: Option<uuid::Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            name: row.try_get("name")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            priority: row.try_get("priority")?,
            delay_until: row.try_get("delay_until")?,
            worker_id: row.try_get("worker_id")?,
            lock_token: row.try_get("lock_token")?,
            lock_until: row.try_get("lock_until")?,
            progress: row.try_get("progress")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            parent_id: row.try_get("parent_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            processed_at: row.try_get("processed_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let lease = match (row.worker_id, row.lock_token, row.lock_until) {
            (Some(worker_id), Some(token), Some(lock_until)) => Some(Lease {
                worker_id: WorkerId::new(worker_id),
                token: LockToken::from_uuid(token),
                lock_until,
            }),
            _ => None,
        };

        Ok(Job {
            id: JobId::from_uuid(row.id),
            queue_name: row.queue_name,
            name: row.name,
            payload: row.payload,
            status: row.status.parse()?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            priority: row.priority,
            delay_until: row.delay_until,
            lease,
            progress: row.progress,
            result: row.result,
            error: row.error.map(|Json(failure)| failure),
            parent_id: row.parent_id.map(JobId::from_uuid),
            created_at: row.created_at,
            updated_at: row.updated_at,
            processed_at: row.processed_at,
            finished_at: row.finished_at,
        })
    }
}
