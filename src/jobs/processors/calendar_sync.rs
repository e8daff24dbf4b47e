//! Calendar sync processor.
//!
//! Same shape as the Gmail sync: paginated fetch, filter, raw event per
//! accepted item, follow-up normalize job in the same batch. Cancelled events
//! and events marked private are skipped.

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

pub const PROVIDER: &str = "google_calendar";

pub struct CalendarSyncProcessor {
    pool: DbPool,
    provider: Arc<dyn GoogleProvider>,
    config: SyncConfig,
}

impl CalendarSyncProcessor {
    pub fn new(pool: DbPool, provider: Arc<dyn GoogleProvider>, config: SyncConfig) -> Self {
        Self {
            pool,
            provider,
            config,
        }
    }
}

fn is_excluded(payload: &serde_json::Value) -> bool {
    let status = payload.get("status").and_then(|s| s.as_str());
    if status == Some("cancelled") {
        return true;
    }
    let visibility = payload.get("visibility").and_then(|v| v.as_str());
    visibility == Some("private")
}

#[async_trait]
impl JobProcessor for CalendarSyncProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        let payload = match JobPayload::parse(JobKind::GoogleCalendarSync, &payload_value(job))? {
            JobPayload::GoogleCalendarSync(p) => p,
            other => {
                return Err(Error::InvalidPayload {
                    kind: other.kind().to_string(),
                    message: "wrong payload variant for calendar sync".to_string(),
                })
            }
        };

        let batch_id = payload
            .batch_id
            .or_else(|| job.batch_id.clone())
            .unwrap_or_else(queue::generate_batch_id);

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
                .list_calendar_events(Some(&lower_bound), page_token.as_deref())
                .await?;

            for item in page.items {
                fetched += 1;

                if is_excluded(&item.payload) {
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
                debug!(user_id = %job.user_id, cap = self.config.max_items_per_run, "Calendar sync hit per-run item cap");
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
            JobKind::NormalizeGoogleEvent.as_str(),
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
            "Calendar sync finished"
        );

        Ok(())
    }
}
