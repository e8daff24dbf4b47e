//! End-to-end pipeline tests: sync through normalize against an in-memory
//! store and a canned Google provider, plus batch cancellation and the
//! runner's retry ceiling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use pulse::config::{EmbeddingConfig, LlmConfig, SyncConfig};
use pulse::db;
use pulse::jobs::processors::build_registry;
use pulse::jobs::{queue, BatchState, JobRunner, QueueManager, RetryPolicy};
use pulse::services::{EmbeddingService, GoogleProvider, LlmService, SyncItem, SyncPage};
use pulse::{Error, Result};

/// Serves the same fixed Gmail page on every call.
struct CannedProvider {
    messages: Vec<SyncItem>,
}

impl CannedProvider {
    fn three_messages() -> Self {
        let message = |id: &str, hour: u8, subject: &str| SyncItem {
            id: id.to_string(),
            occurred_at: Some(format!("2025-03-01T{:02}:00:00+00:00", hour)),
            payload: json!({
                "id": id,
                "threadId": "t1",
                "labelIds": ["INBOX"],
                "snippet": format!("snippet for {}", id),
                "payload": {"headers": [
                    {"name": "Subject", "value": subject},
                    {"name": "From", "value": "Ana Ruiz <ana@example.com>"},
                ]},
            }),
        };
        Self {
            messages: vec![
                message("m1", 9, "Booking request"),
                message("m2", 10, "Re: Booking request"),
                message("m3", 11, "Invoice"),
            ],
        }
    }
}

#[async_trait]
impl GoogleProvider for CannedProvider {
    async fn list_gmail_messages(
        &self,
        _updated_after: Option<&str>,
        _page_token: Option<&str>,
    ) -> Result<SyncPage> {
        Ok(SyncPage {
            items: self.messages.clone(),
            next_page_token: None,
        })
    }

    async fn list_calendar_events(
        &self,
        _updated_after: Option<&str>,
        _page_token: Option<&str>,
    ) -> Result<SyncPage> {
        Ok(SyncPage::default())
    }
}

fn sync_config() -> SyncConfig {
    SyncConfig {
        max_items_per_run: 2000,
        inter_page_delay_ms: 0,
        initial_lookback_days: 30,
        normalize_deadline_secs: 300,
        gmail_excluded_labels: vec!["SPAM".to_string(), "TRASH".to_string()],
    }
}

fn runner_for(pool: db::DbPool, provider: Arc<dyn GoogleProvider>) -> JobRunner {
    let embeddings = EmbeddingService::new(&EmbeddingConfig {
        base_url: None,
        model: "text-embedding-3-small".to_string(),
        api_key: None,
        dimension: 32,
    })
    .unwrap();
    let llm = LlmService::new(&LlmConfig {
        base_url: None,
        model: "gpt-4o-mini".to_string(),
        api_key: None,
    })
    .unwrap();

    let registry = build_registry(pool.clone(), provider, embeddings, llm, sync_config());

    JobRunner::new(
        pool,
        Arc::new(registry),
        RetryPolicy {
            max_attempts: 3,
            base_delay_secs: 0,
            multiplier: 2,
        },
        Duration::from_secs(60),
    )
}

/// Run polling passes until a pass claims nothing.
async fn drain(runner: &JobRunner) {
    for _ in 0..10 {
        let summary = runner.process_jobs(50).await.unwrap();
        if summary.claimed == 0 {
            return;
        }
    }
    panic!("queue did not drain");
}

#[tokio::test]
async fn test_gmail_pipeline_end_to_end() {
    let pool = db::init_test_pool().await.unwrap();
    let runner = runner_for(pool.clone(), Arc::new(CannedProvider::three_messages()));
    let manager = QueueManager::new(pool.clone());

    queue::enqueue(
        &pool,
        "user-1",
        "google_gmail_sync",
        json!({"batchId": "b1"}),
        Some("b1"),
    )
    .await
    .unwrap()
    .unwrap();

    drain(&runner).await;

    // Sync stored the raw events, normalize turned them into interactions
    let raw = db::list_raw_events_for_batch(&pool, "user-1", "gmail", "b1")
        .await
        .unwrap();
    assert_eq!(raw.len(), 3);

    let interactions = db::list_unlinked_interactions(&pool, "user-1", 10)
        .await
        .unwrap();
    assert_eq!(interactions.len(), 3);
    assert_eq!(interactions[0].subject.as_deref(), Some("Booking request"));

    // Both the sync job and its follow-up normalize resolved
    let status = manager.get_batch_status("b1").await.unwrap();
    assert_eq!(status.status, BatchState::Completed);
    assert_eq!(status.total, 2);
    assert_eq!(status.completed, 2);
    assert_eq!(
        status.completed + status.failed + status.pending,
        status.total
    );
}

#[tokio::test]
async fn test_pipeline_rerun_is_idempotent() {
    let pool = db::init_test_pool().await.unwrap();
    let runner = runner_for(pool.clone(), Arc::new(CannedProvider::three_messages()));

    for batch in ["b1", "b2"] {
        queue::enqueue(
            &pool,
            "user-1",
            "google_gmail_sync",
            json!({"batchId": batch}),
            Some(batch),
        )
        .await
        .unwrap();
        drain(&runner).await;
    }

    // The second sync saw the same messages; nothing duplicated
    let interactions = db::list_unlinked_interactions(&pool, "user-1", 10)
        .await
        .unwrap();
    assert_eq!(interactions.len(), 3);

    let (raw_count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM raw_events")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(raw_count, 3);
}

#[tokio::test]
async fn test_batch_cancellation_scenario() {
    let pool = db::init_test_pool().await.unwrap();
    let manager = QueueManager::new(pool.clone());

    for kind in ["extract_contacts", "embed", "insight"] {
        let payload = if kind == "insight" {
            json!({"kind": "weekly_digest"})
        } else {
            json!({})
        };
        queue::enqueue(&pool, "user-1", kind, payload, Some("b1"))
            .await
            .unwrap()
            .unwrap();
    }

    let cancelled = manager.cancel_batch("b1", "user-1").await.unwrap();
    assert_eq!(cancelled, 3);

    let status = manager.get_batch_status("b1").await.unwrap();
    assert_eq!(status.status, BatchState::Cancelled);

    // Cancelled jobs are never claimed
    assert!(db::claim_next_job(&pool).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retry_ceiling_marks_job_error() {
    let pool = db::init_test_pool().await.unwrap();
    let runner = runner_for(pool.clone(), Arc::new(CannedProvider::three_messages()));

    // The llm insight kind fails while no provider is configured
    let job = queue::enqueue(&pool, "user-1", "insight", json!({"kind": "llm"}), None)
        .await
        .unwrap()
        .unwrap();

    for _ in 0..5 {
        runner.process_jobs(10).await.unwrap();
    }

    let stored = db::get_job(&pool, &job.id).await.unwrap();
    assert_eq!(stored.status, "error");
    assert_eq!(stored.attempts, 3);
    assert!(stored.last_error.is_some());
}

#[tokio::test]
async fn test_oversized_payload_rejected_at_enqueue() {
    let pool = db::init_test_pool().await.unwrap();

    let big = json!({"context": "x".repeat(2 * 1024 * 1024)});
    let err = queue::enqueue(&pool, "user-1", "insight", big, None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PayloadTooLarge { .. }));

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 0);
}
