//! Postgres-backed job store.
//!
//! Jobs live in the `ai_jobs` table. Typed payloads (structured result, error
//! info, debug info) are stored as JSONB and decoded on read.
//!
//! ## Claiming
//!
//! `claim_next` is a single statement:
//!
//! ```sql
//! UPDATE ai_jobs SET status = 'running', attempt_count = attempt_count + 1, ...
//! WHERE id = (SELECT id FROM ai_jobs WHERE <claimable> ORDER BY created_at, id
//!             FOR UPDATE SKIP LOCKED LIMIT 1)
//! RETURNING ...
//! ```
//!
//! Concurrent workers skip rows another transaction has locked, so a job is
//! never handed out twice and claimers do not queue up behind each other.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (foreign key violation) | `23503` | `InvestigationNotFound` (insert only) |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{PgPool, Row};
use tracing::instrument;

use casefile_core::{InvestigationId, JobId};

use super::store::{JobStats, JobStore, JobStoreError, stats_from_counts};
use super::types::{Job, JobStatus, NewJob};

const JOB_COLUMNS: &str = r#"
    id, investigation_id, job_type, model, prompt, debug,
    status, attempt_count, attempts_before_retry, worker_id,
    created_at, started_at, completed_at,
    last_attempt_started_at, last_attempt_completed_at, last_attempt_duration_ms,
    next_attempt_at,
    result, result_format, structured_result,
    error, error_info, debug_info
"#;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS ai_jobs (
        id                          BIGSERIAL PRIMARY KEY,
        investigation_id            BIGINT NOT NULL REFERENCES investigations(id) ON DELETE CASCADE,
        job_type                    TEXT NOT NULL CHECK (job_type IN ('analysis', 'inference')),
        model                       TEXT,
        prompt                      TEXT,
        debug                       BOOLEAN NOT NULL DEFAULT FALSE,
        status                      TEXT NOT NULL
                                    CHECK (status IN ('queued', 'running', 'succeeded', 'failed', 'cancelled')),
        attempt_count               INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
        attempts_before_retry       INTEGER NOT NULL DEFAULT 0 CHECK (attempts_before_retry >= 0),
        worker_id                   TEXT,
        created_at                  TIMESTAMPTZ NOT NULL,
        started_at                  TIMESTAMPTZ,
        completed_at                TIMESTAMPTZ,
        last_attempt_started_at     TIMESTAMPTZ,
        last_attempt_completed_at   TIMESTAMPTZ,
        last_attempt_duration_ms    BIGINT,
        next_attempt_at             TIMESTAMPTZ,
        result                      TEXT,
        result_format               TEXT,
        structured_result           JSONB,
        error                       TEXT,
        error_info                  JSONB,
        debug_info                  JSONB
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ai_jobs_claim_idx
        ON ai_jobs (created_at, id) WHERE status = 'queued'
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ai_jobs_investigation_idx
        ON ai_jobs (investigation_id, created_at DESC, id DESC)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS ai_jobs_running_idx
        ON ai_jobs (last_attempt_started_at) WHERE status = 'running'
    "#,
];

/// Postgres-backed job store.
///
/// `Send + Sync`; all statements go through the shared SQLx pool.
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

    /// Create the `ai_jobs` table and its indexes if missing.
    ///
    /// The `investigations` table is owned by the surrounding application and
    /// must already exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(investigation_id = %job.investigation_id, job_type = %job.job_type), err)]
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Job, JobStoreError> {
        let investigation_id = job.investigation_id;
        let sql = format!(
            r#"
            INSERT INTO ai_jobs (investigation_id, job_type, model, prompt, debug, status, created_at)
            VALUES ($1, $2, $3, $4, $5, 'queued', $6)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(investigation_id.get())
            .bind(job.job_type.as_str())
            .bind(job.model)
            .bind(job.prompt)
            .bind(job.debug)
            .bind(now)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.code().as_deref() == Some("23503") => {
                    JobStoreError::InvestigationNotFound(investigation_id)
                }
                other => map_sqlx_error("insert", other),
            })?;

        decode_job(&row)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM ai_jobs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_for_investigation(
        &self,
        investigation_id: InvestigationId,
        take: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM ai_jobs
            WHERE investigation_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(investigation_id.get())
            .bind(i64::try_from(take).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_for_investigation", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn claim_next(
        &self,
        max_attempts: u32,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE ai_jobs SET
                status = 'running',
                attempt_count = attempt_count + 1,
                worker_id = $2,
                started_at = $3,
                last_attempt_started_at = $3,
                last_attempt_completed_at = NULL,
                last_attempt_duration_ms = NULL,
                completed_at = NULL,
                next_attempt_at = NULL,
                result = NULL,
                result_format = NULL,
                structured_result = NULL,
                error = NULL,
                error_info = NULL,
                debug_info = NULL
            WHERE id = (
                SELECT id FROM ai_jobs
                WHERE status = 'queued'
                  AND attempt_count - attempts_before_retry < $1
                  AND (next_attempt_at IS NULL OR next_attempt_at <= $3)
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(i32::try_from(max_attempts).unwrap_or(i32::MAX))
            .bind(worker_id)
            .bind(now)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.as_ref().map(decode_job).transpose()
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn update_if(
        &self,
        job: &Job,
        expected_status: JobStatus,
        expected_attempt: u32,
    ) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ai_jobs SET
                model = $4,
                prompt = $5,
                status = $6,
                attempt_count = $7,
                attempts_before_retry = $8,
                worker_id = $9,
                started_at = $10,
                completed_at = $11,
                last_attempt_started_at = $12,
                last_attempt_completed_at = $13,
                last_attempt_duration_ms = $14,
                next_attempt_at = $15,
                result = $16,
                result_format = $17,
                structured_result = $18,
                error = $19,
                error_info = $20,
                debug_info = $21
            WHERE id = $1 AND status = $2 AND attempt_count = $3
            "#,
        )
        .bind(job.id.get())
        .bind(expected_status.as_str())
        .bind(to_db_count(expected_attempt))
        .bind(job.model.as_deref())
        .bind(job.prompt.as_deref())
        .bind(job.status.as_str())
        .bind(to_db_count(job.attempt_count))
        .bind(to_db_count(job.attempts_before_retry))
        .bind(job.worker_id.as_deref())
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.last_attempt_started_at)
        .bind(job.last_attempt_completed_at)
        .bind(job.last_attempt_duration_ms)
        .bind(job.next_attempt_at)
        .bind(job.result.as_deref())
        .bind(job.result_format.as_deref())
        .bind(to_json(job.id, job.structured_result.as_ref())?)
        .bind(job.error.as_deref())
        .bind(to_json(job.id, job.error_info.as_ref())?)
        .bind(to_json(job.id, job.debug_info.as_ref())?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_if", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn list_expired_leases(
        &self,
        started_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM ai_jobs
            WHERE status = 'running' AND last_attempt_started_at <= $1
            ORDER BY id
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(started_before)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_expired_leases", e))?;

        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM ai_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobStoreError::Storage(e.to_string()))?;
            counts.push((status, usize::try_from(n).unwrap_or_default()));
        }
        Ok(stats_from_counts(counts))
    }
}

fn decode_job(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    Job::try_from(JobRow::from_pg_row(row)?)
}

fn to_db_count(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_json<T: Serialize>(
    job_id: JobId,
    value: Option<&T>,
) -> Result<Option<serde_json::Value>, JobStoreError> {
    value
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| JobStoreError::Corrupt {
            job_id: job_id.get(),
            message: format!("failed to encode payload: {e}"),
        })
}

fn from_json<T: DeserializeOwned>(
    job_id: i64,
    column: &str,
    value: Option<serde_json::Value>,
) -> Result<Option<T>, JobStoreError> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| JobStoreError::Corrupt {
            job_id,
            message: format!("invalid {column}: {e}"),
        })
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: i64,
    investigation_id: i64,
    job_type: String,
    model: Option<String>,
    prompt: Option<String>,
    debug: bool,
    status: String,
    attempt_count: i32,
    attempts_before_retry: i32,
    worker_id: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    last_attempt_started_at: Option<DateTime<Utc>>,
    last_attempt_completed_at: Option<DateTime<Utc>>,
    last_attempt_duration_ms: Option<i64>,
    next_attempt_at: Option<DateTime<Utc>>,
    result: Option<String>,
    result_format: Option<String>,
    structured_result: Option<serde_json::Value>,
    error: Option<String>,
    error_info: Option<serde_json::Value>,
    debug_info: Option<serde_json::Value>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            investigation_id: row.try_get("investigation_id")?,
            job_type: row.try_get("job_type")?,
            model: row.try_get("model")?,
            prompt: row.try_get("prompt")?,
            debug: row.try_get("debug")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            attempts_before_retry: row.try_get("attempts_before_retry")?,
            worker_id: row.try_get("worker_id")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            last_attempt_started_at: row.try_get("last_attempt_started_at")?,
            last_attempt_completed_at: row.try_get("last_attempt_completed_at")?,
            last_attempt_duration_ms: row.try_get("last_attempt_duration_ms")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            result: row.try_get("result")?,
            result_format: row.try_get("result_format")?,
            structured_result: row.try_get("structured_result")?,
            error: row.try_get("error")?,
            error_info: row.try_get("error_info")?,
            debug_info: row.try_get("debug_info")?,
        })
    }
}

impl JobRow {
    fn from_pg_row(row: &sqlx::postgres::PgRow) -> Result<Self, JobStoreError> {
        <JobRow as sqlx::FromRow<'_, sqlx::postgres::PgRow>>::from_row(row)
            .map_err(|e| map_sqlx_error("decode_row", e))
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |message: String| JobStoreError::Corrupt {
            job_id: row.id,
            message,
        };

        let job_type = row.job_type.parse().map_err(|e| corrupt(format!("{e}")))?;
        let status = row.status.parse().map_err(|e| corrupt(format!("{e}")))?;
        let attempt_count = u32::try_from(row.attempt_count)
            .map_err(|_| corrupt(format!("negative attempt_count {}", row.attempt_count)))?;
        let attempts_before_retry = u32::try_from(row.attempts_before_retry)
            .map_err(|_| corrupt(format!("negative attempts_before_retry {}", row.attempts_before_retry)))?;

        Ok(Job {
            id: JobId::new(row.id),
            investigation_id: InvestigationId::new(row.investigation_id),
            job_type,
            model: row.model,
            prompt: row.prompt,
            debug: row.debug,
            status,
            attempt_count,
            attempts_before_retry,
            worker_id: row.worker_id,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            last_attempt_started_at: row.last_attempt_started_at,
            last_attempt_completed_at: row.last_attempt_completed_at,
            last_attempt_duration_ms: row.last_attempt_duration_ms,
            next_attempt_at: row.next_attempt_at,
            result: row.result,
            result_format: row.result_format,
            structured_result: from_json(row.id, "structured_result", row.structured_result)?,
            error: row.error,
            error_info: from_json(row.id, "error_info", row.error_info)?,
            debug_info: from_json(row.id, "debug_info", row.debug_info)?,
        })
    }
}
