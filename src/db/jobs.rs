//! Job queue database queries.
//!
//! Persistent SQLite-backed job queue:
//! - Atomic claiming (queued -> processing via conditional UPDATE)
//! - Batch-scoped deduplicated insert
//! - Retry rescheduling with caller-supplied delay
//! - Retention cleanup of terminal jobs

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{Error, Result};

use super::DbPool;

/// Job status enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "error" => Some(Self::Error),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }
}

/// Job record from the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub payload: Option<String>, // JSON
    pub status: String,
    pub attempts: i32,
    pub batch_id: Option<String>,
    pub last_error: Option<String>,
    pub scheduled_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    /// Get status as enum.
    pub fn status_enum(&self) -> Option<JobStatus> {
        JobStatus::from_str(&self.status)
    }

    /// Parse payload JSON.
    pub fn payload_json(&self) -> serde_json::Value {
        self.payload
            .as_ref()
            .and_then(|p| serde_json::from_str(p).ok())
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Input for creating a new job.
#[derive(Debug, Clone)]
pub struct CreateJob {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub payload: Option<serde_json::Value>,
    pub batch_id: Option<String>,
}

impl CreateJob {
    pub fn new(user_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: nanoid::nanoid!(),
            user_id: user_id.into(),
            kind: kind.into(),
            payload: None,
            batch_id: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_batch(mut self, batch_id: impl Into<String>) -> Self {
        self.batch_id = Some(batch_id.into());
        self
    }
}

/// Create a new queued job.
pub async fn create_job(pool: &DbPool, input: CreateJob) -> Result<Job> {
    let payload_json = input
        .payload
        .map(|p| serde_json::to_string(&p).unwrap_or_default());

    sqlx::query_as::<_, Job>(
        r#"
        INSERT INTO jobs (id, user_id, kind, payload, batch_id)
        VALUES (?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(&input.id)
    .bind(&input.user_id)
    .bind(&input.kind)
    .bind(&payload_json)
    .bind(&input.batch_id)
    .fetch_one(pool)
    .await
    .map_err(Error::Database)
}

/// Create a queued job unless an unresolved twin already exists in the batch.
///
/// The insert is conditional on no other job with the same
/// (user_id, kind, batch_id) sitting in `queued` or `processing`, so a retried
/// caller cannot double-enqueue within a batch. Returns the job when inserted,
/// None when deduplicated.
pub async fn create_job_dedup(pool: &DbPool, input: CreateJob) -> Result<Option<Job>> {
    let batch_id = match input.batch_id.as_deref() {
        Some(b) => b.to_string(),
        None => return create_job(pool, input).await.map(Some),
    };

    let payload_json = input
        .payload
        .map(|p| serde_json::to_string(&p).unwrap_or_default());

    sqlx::query_as::<_, Job>(
        r#"
        INSERT INTO jobs (id, user_id, kind, payload, batch_id)
        SELECT ?, ?, ?, ?, ?
        WHERE NOT EXISTS (
            SELECT 1 FROM jobs
            WHERE user_id = ? AND kind = ? AND batch_id = ?
            AND status IN ('queued', 'processing')
        )
        RETURNING *
        "#,
    )
    .bind(&input.id)
    .bind(&input.user_id)
    .bind(&input.kind)
    .bind(&payload_json)
    .bind(&batch_id)
    .bind(&input.user_id)
    .bind(&input.kind)
    .bind(&batch_id)
    .fetch_optional(pool)
    .await
    .map_err(Error::Database)
}

/// Get a job by ID.
pub async fn get_job(pool: &DbPool, id: &str) -> Result<Job> {
    sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Job not found: {}", id)))
}

/// Atomically claim the next due queued job (oldest first).
///
/// Returns None when nothing is due. A job already moved by a concurrent
/// claimer is skipped by the status guard on the outer UPDATE.
pub async fn claim_next_job(pool: &DbPool) -> Result<Option<Job>> {
    sqlx::query_as::<_, Job>(
        r#"
        UPDATE jobs SET
            status = 'processing',
            updated_at = datetime('now')
        WHERE id = (
            SELECT id FROM jobs
            WHERE status = 'queued'
            AND (scheduled_at IS NULL OR datetime(scheduled_at) <= datetime('now'))
            ORDER BY created_at ASC
            LIMIT 1
        )
        AND status = 'queued'
        RETURNING *
        "#,
    )
    .fetch_optional(pool)
    .await
    .map_err(Error::Database)
}

/// Atomically claim the next due queued job for one user.
pub async fn claim_next_user_job(pool: &DbPool, user_id: &str) -> Result<Option<Job>> {
    sqlx::query_as::<_, Job>(
        r#"
        UPDATE jobs SET
            status = 'processing',
            updated_at = datetime('now')
        WHERE id = (
            SELECT id FROM jobs
            WHERE user_id = ? AND status = 'queued'
            AND (scheduled_at IS NULL OR datetime(scheduled_at) <= datetime('now'))
            ORDER BY created_at ASC
            LIMIT 1
        )
        AND status = 'queued'
        RETURNING *
        "#,
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(Error::Database)
}

/// Complete a job successfully.
pub async fn complete_job(pool: &DbPool, id: &str) -> Result<Job> {
    sqlx::query_as::<_, Job>(
        r#"
        UPDATE jobs SET
            status = 'done',
            updated_at = datetime('now')
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("Job not found: {}", id)))
}

/// Return a failed job to the queue with a retry delay.
///
/// Increments attempts and schedules the next run `delay_secs` from now.
pub async fn reschedule_job(pool: &DbPool, id: &str, error: &str, delay_secs: i64) -> Result<Job> {
    sqlx::query_as::<_, Job>(
        r#"
        UPDATE jobs SET
            status = 'queued',
            attempts = attempts + 1,
            last_error = ?,
            scheduled_at = datetime('now', '+' || ? || ' seconds'),
            updated_at = datetime('now')
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(error)
    .bind(delay_secs)
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("Job not found: {}", id)))
}

/// Fail a job permanently (retry budget exhausted).
pub async fn fail_job(pool: &DbPool, id: &str, error: &str) -> Result<Job> {
    sqlx::query_as::<_, Job>(
        r#"
        UPDATE jobs SET
            status = 'error',
            attempts = attempts + 1,
            last_error = ?,
            updated_at = datetime('now')
        WHERE id = ?
        RETURNING *
        "#,
    )
    .bind(error)
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound(format!("Job not found: {}", id)))
}

/// List all jobs in a batch.
pub async fn list_batch_jobs(pool: &DbPool, batch_id: &str) -> Result<Vec<Job>> {
    sqlx::query_as::<_, Job>(
        r#"
        SELECT * FROM jobs
        WHERE batch_id = ?
        ORDER BY created_at ASC
        "#,
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// Cancel a batch's still-queued jobs for the owning user.
///
/// Jobs already processing or terminal are untouched. Returns rows affected.
pub async fn cancel_batch_jobs(pool: &DbPool, batch_id: &str, user_id: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE jobs SET
            status = 'cancelled',
            updated_at = datetime('now')
        WHERE batch_id = ? AND user_id = ? AND status = 'queued'
        "#,
    )
    .bind(batch_id)
    .bind(user_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Per-status job counts for a user.
pub async fn count_user_jobs_by_status(pool: &DbPool, user_id: &str) -> Result<Vec<(String, i64)>> {
    sqlx::query_as::<_, (String, i64)>(
        r#"
        SELECT status, COUNT(*) FROM jobs
        WHERE user_id = ?
        GROUP BY status
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// Delete terminal jobs older than the retention window.
pub async fn cleanup_old_jobs(pool: &DbPool, days: i64) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM jobs
        WHERE status IN ('done', 'error', 'cancelled')
        AND datetime(updated_at, '+' || ? || ' days') < datetime('now')
        "#,
    )
    .bind(days)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}
