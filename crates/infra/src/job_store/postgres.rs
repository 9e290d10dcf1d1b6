//! Postgres-backed job store.
//!
//! Jobs live in a single `jobs` table. A row trigger publishes the job name on
//! the `jobs:changed` channel whenever a row is inserted or updated into
//! `pending`, which is what wakes the poller on every instance.
//!
//! ## Claiming
//!
//! Claims use `FOR UPDATE SKIP LOCKED` inside an `UPDATE ... FROM` so that
//! select-and-mark is one statement: concurrent claimants (in this process or
//! another) skip each other's rows instead of blocking or double-claiming.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database | `Storage` (with the Postgres message) |
//! | PoolClosed | `Storage` |
//! | Row decode failures | `Decode` |
//! | Listener failures | `Subscription` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument};
use uuid::Uuid;

use courier_core::{JobId, JobRecord, JobStatus};

use super::r#trait::{JobStore, JobStoreError, Notification, NotificationStream};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id          UUID PRIMARY KEY,
        name        TEXT NOT NULL,
        payload     BYTEA NOT NULL,
        created_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        tries       INTEGER NOT NULL DEFAULT 0,
        status      TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'running', 'failed')),
        locked_by   TEXT,
        last_ping   TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_status_created_at_idx
        ON jobs (status, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobs_locked_by_idx
        ON jobs (locked_by) WHERE locked_by IS NOT NULL
    "#,
    r#"
    CREATE OR REPLACE FUNCTION notify_jobs_changed() RETURNS trigger AS $$
    BEGIN
        IF NEW.status = 'pending' THEN
            PERFORM pg_notify('jobs:changed', NEW.name);
        END IF;
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql
    "#,
    "DROP TRIGGER IF EXISTS jobs_changed ON jobs",
    r#"
    CREATE TRIGGER jobs_changed
        AFTER INSERT OR UPDATE ON jobs
        FOR EACH ROW EXECUTE FUNCTION notify_jobs_changed()
    "#,
];

const CLAIM_SQL: &str = r#"
    UPDATE jobs
    SET status = 'running', locked_by = $1, last_ping = now()
    FROM (
        SELECT id FROM jobs
        WHERE status = 'pending'
        ORDER BY created_at
        LIMIT $2
        FOR UPDATE SKIP LOCKED
    ) AS claimable
    WHERE jobs.id = claimable.id
    RETURNING jobs.id, jobs.name, jobs.payload, jobs.created_at, jobs.tries,
              jobs.status, jobs.locked_by, jobs.last_ping
"#;

/// Postgres job store.
///
/// Cheap to clone; all clones share one connection pool.
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

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self), err)]
    async fn create_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("create_schema", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_name = %job.name), err)]
    async fn insert(&self, job: &JobRecord) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, name, payload, created_at, tries, status, locked_by, last_ping)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(*job.id.as_uuid())
        .bind(&job.name)
        .bind(&job.payload)
        .bind(job.created_at)
        .bind(i32::try_from(job.tries).unwrap_or(i32::MAX))
        .bind(job.status.as_str())
        .bind(job.locked_by.as_deref())
        .bind(job.last_ping)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(claimed), err)]
    async fn claim_batch(
        &self,
        limit: usize,
        claimant: &str,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(CLAIM_SQL)
            .bind(claimant)
            .bind(limit_param(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_batch", e))?;

        let jobs = decode_claimed(rows)?;
        Span::current().record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), fields(in_flight, claimed), err)]
    async fn claim_within_capacity(
        &self,
        requested: usize,
        capacity: usize,
        claimant: &str,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let span = Span::current();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let in_flight: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE locked_by = $1 AND status = 'running'",
        )
        .bind(claimant)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("count_in_flight", e))?;
        span.record("in_flight", in_flight);

        let headroom = capacity.saturating_sub(usize::try_from(in_flight).unwrap_or(usize::MAX));
        let limit = requested.min(headroom);
        if limit == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            span.record("claimed", 0);
            return Ok(Vec::new());
        }

        let rows = sqlx::query(CLAIM_SQL)
            .bind(claimant)
            .bind(limit_param(limit))
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("claim_within_capacity", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;

        let jobs = decode_claimed(rows)?;
        span.record("claimed", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn update_status(
        &self,
        id: JobId,
        claimant: &str,
        status: JobStatus,
        locked_by: Option<&str>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = $3, locked_by = $4
            WHERE id = $1 AND locked_by = $2 AND status = 'running'
            "#,
        )
        .bind(*id.as_uuid())
        .bind(claimant)
        .bind(status.as_str())
        .bind(locked_by)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_status", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn update_ping(
        &self,
        id: JobId,
        claimant: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET last_ping = $3
            WHERE id = $1 AND locked_by = $2 AND status = 'running'
            "#,
        )
        .bind(*id.as_uuid())
        .bind(claimant)
        .bind(at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_ping", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn delete(&self, id: JobId, claimant: &str) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE id = $1 AND locked_by = $2 AND status = 'running'",
        )
        .bind(*id.as_uuid())
        .bind(claimant)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("delete", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn count_by_status(&self, status: JobStatus) -> Result<u64, JobStoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_status", e))?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn count_by_locked_by(
        &self,
        claimant: &str,
        status: JobStatus,
    ) -> Result<u64, JobStoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE locked_by = $1 AND status = $2")
                .bind(claimant)
                .bind(status.as_str())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_by_locked_by", e))?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, payload, created_at, tries, status, locked_by, last_ping
            FROM jobs WHERE id = $1
            "#,
        )
        .bind(*id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|row| decode_row(&row)).transpose()
    }

    #[instrument(skip(self), fields(requeued), err)]
    async fn requeue_stale(&self, stale_before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', locked_by = NULL, tries = tries + 1
            WHERE status = 'running' AND COALESCE(last_ping, created_at) < $1
            "#,
        )
        .bind(stale_before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_stale", e))?;

        Span::current().record("requeued", result.rows_affected());
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn subscribe(&self, topic: &str) -> Result<NotificationStream, JobStoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| JobStoreError::Subscription(e.to_string()))?;
        listener
            .listen(topic)
            .await
            .map_err(|e| JobStoreError::Subscription(e.to_string()))?;

        // `into_stream` ends when the connection is lost.
        let stream = listener.into_stream().map(|item| {
            item.map(|n| Notification {
                topic: n.channel().to_string(),
                payload: n.payload().to_string(),
            })
            .map_err(|e| JobStoreError::Subscription(e.to_string()))
        });
        Ok(Box::pin(stream))
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn decode_claimed(rows: Vec<PgRow>) -> Result<Vec<JobRecord>, JobStoreError> {
    let mut jobs = rows
        .iter()
        .map(decode_row)
        .collect::<Result<Vec<_>, _>>()?;
    // RETURNING does not preserve the subquery order.
    jobs.sort_by_key(|j| (j.created_at, j.id));
    Ok(jobs)
}

fn decode_row(row: &PgRow) -> Result<JobRecord, JobStoreError> {
    JobRow::from_row(row)
        .map_err(|e| JobStoreError::Decode(e.to_string()))?
        .try_into()
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Decode(format!("{} in {}", err, operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Raw `jobs` row.
struct JobRow {
    id: Uuid,
    name: String,
    payload: Vec<u8>,
    created_at: DateTime<Utc>,
    tries: i32,
    status: String,
    locked_by: Option<String>,
    last_ping: Option<DateTime<Utc>>,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            tries: row.try_get("tries")?,
            status: row.try_get("status")?,
            locked_by: row.try_get("locked_by")?,
            last_ping: row.try_get("last_ping")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Decode(e.to_string()))?;

        Ok(JobRecord {
            id: JobId::from_uuid(row.id),
            name: row.name,
            payload: row.payload,
            created_at: row.created_at,
            tries: u32::try_from(row.tries).unwrap_or(0),
            status,
            locked_by: row.locked_by,
            last_ping: row.last_ping,
        })
    }
}
