//! Enqueue and batch-level queue management.
//!
//! Enqueue validates and sanitizes a payload, then writes a queued job row
//! with batch-scoped deduplication. The queue manager layers batch
//! orchestration on top: grouped enqueues, aggregate batch status, batch
//! cancellation, and per-user status histograms.
//!
//! Read/aggregate operations swallow storage errors and return None or an
//! empty map so status endpoints stay non-fatal; mutating operations
//! propagate errors to the caller.

use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use crate::db::{self, DbPool, Job};
use crate::Result;

use super::payload;

/// Validate, sanitize, and durably create a queued job.
///
/// With a batch id the insert deduplicates against an unresolved job of the
/// same (user, kind, batch); a deduplicated call is a silent no-op returning
/// None. Validation errors surface synchronously and write nothing.
pub async fn enqueue(
    pool: &DbPool,
    user_id: &str,
    kind: &str,
    payload_value: Value,
    batch_id: Option<&str>,
) -> Result<Option<Job>> {
    payload::validate(kind, &payload_value, user_id)?;
    let clean = payload::sanitize(&payload_value);

    let mut input = db::CreateJob::new(user_id, kind).with_payload(clean);
    if let Some(batch) = batch_id {
        input = input.with_batch(batch);
    }

    let job = db::create_job_dedup(pool, input).await?;
    match &job {
        Some(job) => {
            debug!(job_id = %job.id, user_id, kind, batch_id = ?batch_id, "Job enqueued")
        }
        None => {
            debug!(user_id, kind, batch_id = ?batch_id, "Enqueue deduplicated against in-flight job")
        }
    }

    Ok(job)
}

/// Aggregate batch state, derived from member job rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

/// Derived view over the jobs sharing a batch id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatus {
    pub batch_id: String,
    pub status: BatchState,
    pub total: i64,
    pub completed: i64,
    pub failed: i64,
    pub pending: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Batch-level orchestration over the job store.
#[derive(Clone)]
pub struct QueueManager {
    pool: DbPool,
}

impl QueueManager {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Enqueue a group of jobs as a named batch.
    ///
    /// Generates a batch id when none is given. Entries are enqueued
    /// sequentially, all sharing the batch id; `None` entries are skipped
    /// without error and an empty input writes nothing. The returned ids are
    /// batch-local ordinals (`<batch_id>_<index>`), not storage ids.
    pub async fn enqueue_batch_job(
        &self,
        user_id: &str,
        kind: &str,
        jobs: &[Option<Value>],
        batch_id: Option<String>,
    ) -> Result<Vec<String>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let batch_id = batch_id.unwrap_or_else(generate_batch_id);
        let mut ids = Vec::new();

        for entry in jobs.iter() {
            let Some(payload_value) = entry else {
                continue;
            };

            enqueue(
                &self.pool,
                user_id,
                kind,
                payload_value.clone(),
                Some(&batch_id),
            )
            .await?;

            ids.push(format!("{}_{}", batch_id, ids.len()));
        }

        info!(user_id, kind, batch_id = %batch_id, count = ids.len(), "Batch enqueued");

        Ok(ids)
    }

    /// Aggregate status for a batch; None when the batch has no jobs or the
    /// lookup fails.
    pub async fn get_batch_status(&self, batch_id: &str) -> Option<BatchStatus> {
        let jobs = match db::list_batch_jobs(&self.pool, batch_id).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(batch_id, error = %e, "Failed to load batch jobs");
                return None;
            }
        };

        if jobs.is_empty() {
            return None;
        }

        Some(aggregate_batch(batch_id, &jobs))
    }

    /// Cancel a batch's still-queued jobs for the owning user.
    /// Returns the number of jobs cancelled.
    pub async fn cancel_batch(&self, batch_id: &str, user_id: &str) -> Result<u64> {
        let cancelled = db::cancel_batch_jobs(&self.pool, batch_id, user_id).await?;
        info!(batch_id, user_id, cancelled, "Batch cancel requested");
        Ok(cancelled)
    }

    /// Per-status job counts for a user; empty on storage failure.
    pub async fn get_job_stats(&self, user_id: &str) -> HashMap<String, i64> {
        match db::count_user_jobs_by_status(&self.pool, user_id).await {
            Ok(counts) => counts.into_iter().collect(),
            Err(e) => {
                error!(user_id, error = %e, "Failed to load job stats");
                HashMap::new()
            }
        }
    }
}

/// `batch_<8 hex>_<unix ts>`
pub fn generate_batch_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill(&mut bytes);
    format!(
        "batch_{}_{}",
        hex::encode(bytes),
        chrono::Utc::now().timestamp()
    )
}

fn aggregate_batch(batch_id: &str, jobs: &[Job]) -> BatchStatus {
    let total = jobs.len() as i64;
    let completed = jobs.iter().filter(|j| j.status == "done").count() as i64;
    let pending = jobs
        .iter()
        .filter(|j| j.status == "queued" || j.status == "processing")
        .count() as i64;
    let cancelled = jobs.iter().filter(|j| j.status == "cancelled").count() as i64;
    // Cancelled jobs resolve as not-completed, keeping
    // completed + failed + pending == total
    let failed = total - completed - pending;

    let status = if cancelled == total {
        BatchState::Cancelled
    } else if pending > 0 {
        BatchState::InProgress
    } else if failed > completed {
        BatchState::Failed
    } else {
        BatchState::Completed
    };

    let created_at = jobs
        .iter()
        .map(|j| j.created_at.as_str())
        .min()
        .unwrap_or_default()
        .to_string();
    let updated_at = jobs
        .iter()
        .map(|j| j.updated_at.as_str())
        .max()
        .unwrap_or_default()
        .to_string();

    BatchStatus {
        batch_id: batch_id.to_string(),
        status,
        total,
        completed,
        failed,
        pending,
        created_at,
        updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_pool;
    use serde_json::json;

    #[tokio::test]
    async fn test_enqueue_validates_before_writing() {
        let pool = init_test_pool().await.unwrap();

        let err = enqueue(&pool, "user-1", "bogus_kind", json!({}), None)
            .await
            .unwrap_err();
        assert!(err.is_validation());

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_enqueue_dedup_within_batch() {
        let pool = init_test_pool().await.unwrap();

        let first = enqueue(&pool, "u", "embed", json!({}), Some("b1")).await.unwrap();
        assert!(first.is_some());
        let second = enqueue(&pool, "u", "embed", json!({}), Some("b1")).await.unwrap();
        assert!(second.is_none());

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_enqueue_batch_job_ordinals_and_skips() {
        let pool = init_test_pool().await.unwrap();
        let manager = QueueManager::new(pool.clone());

        let ids = manager
            .enqueue_batch_job(
                "u",
                "insight",
                &[
                    Some(json!({"subjectId": "c1", "kind": "lead_score"})),
                    None,
                    Some(json!({"subjectId": "c2", "kind": "lead_score"})),
                ],
                Some("b9".to_string()),
            )
            .await
            .unwrap();

        assert_eq!(ids, vec!["b9_0", "b9_1"]);

        // Insight payloads differ but share (user, kind, batch): the second
        // enqueue deduplicates, which is the documented batch semantics
        let status = manager.get_batch_status("b9").await.unwrap();
        assert_eq!(status.total, 1);

        // Empty input writes nothing and returns an empty list
        let ids = manager
            .enqueue_batch_job("u", "insight", &[], None)
            .await
            .unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_batch_status_arithmetic() {
        let pool = init_test_pool().await.unwrap();
        let manager = QueueManager::new(pool.clone());

        for i in 0..4 {
            crate::db::create_job(
                &pool,
                crate::db::CreateJob::new("u", format!("kind_{}", i)).with_batch("b1"),
            )
            .await
            .unwrap();
        }

        let jobs = crate::db::list_batch_jobs(&pool, "b1").await.unwrap();
        crate::db::claim_next_job(&pool).await.unwrap().unwrap();
        crate::db::complete_job(&pool, &jobs[0].id).await.unwrap();
        crate::db::claim_next_job(&pool).await.unwrap().unwrap();
        crate::db::fail_job(&pool, &jobs[1].id, "boom").await.unwrap();

        let status = manager.get_batch_status("b1").await.unwrap();
        assert_eq!(status.total, 4);
        assert_eq!(status.completed, 1);
        assert_eq!(status.failed, 1);
        assert_eq!(status.pending, 2);
        assert_eq!(
            status.completed + status.failed + status.pending,
            status.total
        );
        assert_eq!(status.status, BatchState::InProgress);
    }

    #[tokio::test]
    async fn test_batch_status_resolution_rules() {
        let pool = init_test_pool().await.unwrap();
        let manager = QueueManager::new(pool.clone());

        // 1 done + 1 error: tie favors completed
        for kind in ["a", "b"] {
            crate::db::create_job(&pool, crate::db::CreateJob::new("u", kind).with_batch("tie"))
                .await
                .unwrap();
        }
        let jobs = crate::db::list_batch_jobs(&pool, "tie").await.unwrap();
        crate::db::claim_next_job(&pool).await.unwrap();
        crate::db::complete_job(&pool, &jobs[0].id).await.unwrap();
        crate::db::claim_next_job(&pool).await.unwrap();
        crate::db::fail_job(&pool, &jobs[1].id, "boom").await.unwrap();

        let status = manager.get_batch_status("tie").await.unwrap();
        assert_eq!(status.status, BatchState::Completed);

        // Failures in the majority of resolved jobs
        for kind in ["c", "d", "e"] {
            crate::db::create_job(&pool, crate::db::CreateJob::new("u", kind).with_batch("bad"))
                .await
                .unwrap();
        }
        let jobs = crate::db::list_batch_jobs(&pool, "bad").await.unwrap();
        for job in &jobs {
            crate::db::claim_next_job(&pool).await.unwrap();
            crate::db::fail_job(&pool, &job.id, "boom").await.unwrap();
        }
        let status = manager.get_batch_status("bad").await.unwrap();
        assert_eq!(status.status, BatchState::Failed);
    }

    #[tokio::test]
    async fn test_cancel_batch_scenario() {
        let pool = init_test_pool().await.unwrap();
        let manager = QueueManager::new(pool.clone());

        for i in 0..5 {
            crate::db::create_job(
                &pool,
                crate::db::CreateJob::new("u", format!("kind_{}", i)).with_batch("b2"),
            )
            .await
            .unwrap();
        }

        let cancelled = manager.cancel_batch("b2", "u").await.unwrap();
        assert_eq!(cancelled, 5);

        let status = manager.get_batch_status("b2").await.unwrap();
        assert_eq!(status.pending, 0);
        assert_eq!(status.status, BatchState::Cancelled);

        // Nothing left to claim
        assert!(crate::db::claim_next_job(&pool).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_batch_is_none() {
        let pool = init_test_pool().await.unwrap();
        let manager = QueueManager::new(pool);
        assert!(manager.get_batch_status("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_job_stats_histogram() {
        let pool = init_test_pool().await.unwrap();
        let manager = QueueManager::new(pool.clone());

        for kind in ["a", "b"] {
            crate::db::create_job(&pool, crate::db::CreateJob::new("u", kind))
                .await
                .unwrap();
        }
        let claimed = crate::db::claim_next_job(&pool).await.unwrap().unwrap();
        crate::db::complete_job(&pool, &claimed.id).await.unwrap();

        let stats = manager.get_job_stats("u").await;
        assert_eq!(stats.get("queued"), Some(&1));
        assert_eq!(stats.get("done"), Some(&1));
        assert!(manager.get_job_stats("nobody").await.is_empty());
    }

    #[test]
    fn test_batch_id_shape() {
        let id = generate_batch_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[0], "batch");
        assert_eq!(parts[1].len(), 8);
        assert!(parts[2].parse::<i64>().is_ok());
    }
}
