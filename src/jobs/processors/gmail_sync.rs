//! Gmail sync processor.
//!
//! Pulls paginated message lists from the Gmail API, skips excluded labels,
//! and stores one raw event per accepted message tagged with the run's batch
//! id. Raw event inserts conflict-ignore on (user, provider, source_id), so
//! overlapping or re-run syncs never duplicate. On completion a follow-up
//! normalize job is enqueued into the same batch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::db::{self, DbPool, Job};
use crate::jobs::dispatcher::JobProcessor;
use crate::jobs::payload::{JobKind, JobPayload};
use crate::jobs::queue;
use crate::services::GoogleProvider;
use crate::{Error, Result};

use super::payload_value;

pub const PROVIDER: &str = "gmail";

pub struct GmailSyncProcessor {
    pool: DbPool,
    provider: Arc<dyn GoogleProvider>,
    config: SyncConfig,
}

impl GmailSyncProcessor {
    pub fn new(pool: DbPool, provider: Arc<dyn GoogleProvider>, config: SyncConfig) -> Self {
        Self {
            pool,
            provider,
            config,
        }
    }

    fn is_excluded(&self, payload: &serde_json::Value) -> bool {
        let Some(labels) = payload.get("labelIds").and_then(|l| l.as_array()) else {
            return false;
        };
        labels
            .iter()
            .filter_map(|l| l.as_str())
            .any(|label| self.config.gmail_excluded_labels.iter().any(|e| e == label))
    }
}

#[async_trait]
impl JobProcessor for GmailSyncProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        let payload = match JobPayload::parse(JobKind::GoogleGmailSync, &payload_value(job))? {
            JobPayload::GoogleGmailSync(p) => p,
            other => {
                return Err(Error::InvalidPayload {
                    kind: other.kind().to_string(),
                    message: "wrong payload variant for gmail sync".to_string(),
                })
            }
        };

        let batch_id = payload
            .batch_id
            .or_else(|| job.batch_id.clone())
            .unwrap_or_else(queue::generate_batch_id);

        // Incremental lower bound: newest previously ingested message, else a
        // fixed lookback window on first run.
        let lower_bound = match db::latest_raw_event_time(&self.pool, &job.user_id, PROVIDER).await?
        {
            Some(latest) => latest,
            None => (Utc::now() - ChronoDuration::days(self.config.initial_lookback_days))
                .to_rfc3339(),
        };

        let mut fetched = 0usize;
        let mut inserted = 0usize;
        let mut skipped = 0usize;
        let mut page_token: Option<String> = None;

        loop {
            let page = self
                .provider
                .list_gmail_messages(Some(&lower_bound), page_token.as_deref())
                .await?;

            for item in page.items {
                fetched += 1;

                if self.is_excluded(&item.payload) {
                    skipped += 1;
                    continue;
                }

                let occurred_at = item
                    .occurred_at
                    .unwrap_or_else(|| Utc::now().to_rfc3339());
                let wrote = db::insert_raw_event(
                    &self.pool,
                    db::CreateRawEvent {
                        user_id: job.user_id.clone(),
                        provider: PROVIDER.to_string(),
                        payload: item.payload,
                        occurred_at,
                        source_id: item.id,
                        batch_id: Some(batch_id.clone()),
                    },
                )
                .await?;
                if wrote {
                    inserted += 1;
                }

                if fetched >= self.config.max_items_per_run {
                    break;
                }
            }

            if fetched >= self.config.max_items_per_run {
                debug!(user_id = %job.user_id, cap = self.config.max_items_per_run, "Gmail sync hit per-run item cap");
                break;
            }

            match page.next_page_token {
                Some(token) => {
                    page_token = Some(token);
                    sleep(Duration::from_millis(self.config.inter_page_delay_ms)).await;
                }
                None => break,
            }
        }

        queue::enqueue(
            &self.pool,
            &job.user_id,
            JobKind::NormalizeGoogleEmail.as_str(),
            json!({ "batchId": batch_id }),
            Some(&batch_id),
        )
        .await?;

        info!(
            user_id = %job.user_id,
            batch_id = %batch_id,
            fetched,
            inserted,
            skipped,
            "Gmail sync finished"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_sync_config;
    use crate::db::init_test_pool;
    use crate::jobs::processors::testutil::{gmail_message as message, processing_job, FakeProvider};
    use crate::services::SyncPage;

    fn sync_job(batch: Option<&str>) -> Job {
        processing_job(
            "google_gmail_sync",
            "user-1",
            batch.map(|b| format!(r#"{{"batchId":"{}"}}"#, b)),
            batch,
        )
    }

    #[tokio::test]
    async fn test_sync_stores_raw_events_and_enqueues_normalize() {
        let pool = init_test_pool().await.unwrap();
        let provider = Arc::new(FakeProvider::with_gmail(vec![SyncPage {
            items: vec![
                message("m1", "2025-01-01T10:00:00+00:00", &["INBOX"]),
                message("m2", "2025-01-01T11:00:00+00:00", &["SPAM"]),
                message("m3", "2025-01-01T12:00:00+00:00", &["INBOX", "IMPORTANT"]),
            ],
            next_page_token: None,
        }]));

        let processor = GmailSyncProcessor::new(pool.clone(), provider, test_sync_config());
        processor.process(&sync_job(Some("b1"))).await.unwrap();

        let events = db::list_raw_events_for_batch(&pool, "user-1", "gmail", "b1")
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.source_id != "m2"));

        // Follow-up normalize job in the same batch
        let jobs = db::list_batch_jobs(&pool, "b1").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, "normalize_google_email");
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let pool = init_test_pool().await.unwrap();
        let pages = || {
            vec![SyncPage {
                items: vec![message("m1", "2025-01-01T10:00:00+00:00", &["INBOX"])],
                next_page_token: None,
            }]
        };

        for _ in 0..2 {
            let provider = Arc::new(FakeProvider::with_gmail(pages()));
            let processor = GmailSyncProcessor::new(pool.clone(), provider, test_sync_config());
            processor.process(&sync_job(Some("b1"))).await.unwrap();
        }

        let events = db::list_raw_events_for_batch(&pool, "user-1", "gmail", "b1")
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_item_cap_stops_pagination() {
        let pool = init_test_pool().await.unwrap();
        let provider = Arc::new(FakeProvider::with_gmail(vec![
            SyncPage {
                items: vec![
                    message("m1", "2025-01-01T10:00:00+00:00", &["INBOX"]),
                    message("m2", "2025-01-01T11:00:00+00:00", &["INBOX"]),
                ],
                next_page_token: Some("next".to_string()),
            },
            SyncPage {
                items: vec![message("m3", "2025-01-01T12:00:00+00:00", &["INBOX"])],
                next_page_token: None,
            },
        ]));

        let mut config = test_sync_config();
        config.max_items_per_run = 2;

        let processor = GmailSyncProcessor::new(pool.clone(), provider.clone(), config);
        processor.process(&sync_job(Some("b1"))).await.unwrap();

        let events = db::list_raw_events_for_batch(&pool, "user-1", "gmail", "b1")
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        // Second page never requested
        assert_eq!(provider.seen_bounds.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_incremental_bound_uses_latest_ingested() {
        let pool = init_test_pool().await.unwrap();

        db::insert_raw_event(
            &pool,
            db::CreateRawEvent {
                user_id: "user-1".to_string(),
                provider: "gmail".to_string(),
                payload: serde_json::json!({}),
                occurred_at: "2025-02-01T00:00:00+00:00".to_string(),
                source_id: "old".to_string(),
                batch_id: None,
            },
        )
        .await
        .unwrap();

        let provider = Arc::new(FakeProvider::with_gmail(vec![]));
        let processor =
            GmailSyncProcessor::new(pool.clone(), provider.clone(), test_sync_config());
        processor.process(&sync_job(Some("b2"))).await.unwrap();

        let bounds = provider.seen_bounds.lock().unwrap();
        assert_eq!(bounds[0].as_deref(), Some("2025-02-01T00:00:00+00:00"));
    }
}
