//! Built-in job processors, one per job kind.
//!
//! Processors share nothing but the job record contract: each owns its
//! external I/O and its idempotency strategy, and each is safe to re-run.

pub mod calendar_sync;
pub mod embed;
pub mod extract_contacts;
pub mod gmail_sync;
pub mod insight;
pub mod normalize;

use std::sync::Arc;

use serde_json::Value;

use crate::config::SyncConfig;
use crate::db::{DbPool, Job};
use crate::services::{EmbeddingService, GoogleProvider, LlmService};

use super::dispatcher::ProcessorRegistry;
use super::payload::JobKind;

pub use calendar_sync::CalendarSyncProcessor;
pub use embed::EmbedProcessor;
pub use extract_contacts::ExtractContactsProcessor;
pub use gmail_sync::GmailSyncProcessor;
pub use insight::InsightProcessor;
pub use normalize::{NormalizeEmailProcessor, NormalizeEventProcessor};

/// The job's stored payload as JSON; Null when absent or unparsable.
pub(crate) fn payload_value(job: &Job) -> Value {
    job.payload_json()
}

/// Registry with every built-in processor registered under its kind.
pub fn build_registry(
    pool: DbPool,
    provider: Arc<dyn GoogleProvider>,
    embeddings: EmbeddingService,
    llm: LlmService,
    sync_config: SyncConfig,
) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();

    registry.register(
        JobKind::GoogleGmailSync.as_str(),
        Arc::new(GmailSyncProcessor::new(
            pool.clone(),
            provider.clone(),
            sync_config.clone(),
        )),
    );
    registry.register(
        JobKind::GoogleCalendarSync.as_str(),
        Arc::new(CalendarSyncProcessor::new(
            pool.clone(),
            provider,
            sync_config.clone(),
        )),
    );
    registry.register(
        JobKind::NormalizeGoogleEmail.as_str(),
        Arc::new(NormalizeEmailProcessor::new(
            pool.clone(),
            sync_config.clone(),
        )),
    );
    registry.register(
        JobKind::NormalizeGoogleEvent.as_str(),
        Arc::new(NormalizeEventProcessor::new(pool.clone(), sync_config)),
    );
    registry.register(
        JobKind::ExtractContacts.as_str(),
        Arc::new(ExtractContactsProcessor::new(pool.clone())),
    );
    registry.register(
        JobKind::Embed.as_str(),
        Arc::new(EmbedProcessor::new(pool.clone(), embeddings)),
    );
    registry.register(
        JobKind::Insight.as_str(),
        Arc::new(InsightProcessor::new(pool, llm)),
    );

    registry
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::db::Job;
    use crate::services::{GoogleProvider, SyncItem, SyncPage};
    use crate::Result;

    /// Serves pre-built pages and records the lower bounds it was asked for.
    pub struct FakeProvider {
        pub gmail_pages: Mutex<Vec<SyncPage>>,
        pub calendar_pages: Mutex<Vec<SyncPage>>,
        pub seen_bounds: Mutex<Vec<Option<String>>>,
    }

    impl FakeProvider {
        pub fn with_gmail(pages: Vec<SyncPage>) -> Self {
            Self {
                gmail_pages: Mutex::new(pages),
                calendar_pages: Mutex::new(Vec::new()),
                seen_bounds: Mutex::new(Vec::new()),
            }
        }

        pub fn with_calendar(pages: Vec<SyncPage>) -> Self {
            Self {
                gmail_pages: Mutex::new(Vec::new()),
                calendar_pages: Mutex::new(pages),
                seen_bounds: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl GoogleProvider for FakeProvider {
        async fn list_gmail_messages(
            &self,
            updated_after: Option<&str>,
            _page_token: Option<&str>,
        ) -> Result<SyncPage> {
            self.seen_bounds
                .lock()
                .unwrap()
                .push(updated_after.map(String::from));
            let mut pages = self.gmail_pages.lock().unwrap();
            if pages.is_empty() {
                Ok(SyncPage::default())
            } else {
                Ok(pages.remove(0))
            }
        }

        async fn list_calendar_events(
            &self,
            updated_after: Option<&str>,
            _page_token: Option<&str>,
        ) -> Result<SyncPage> {
            self.seen_bounds
                .lock()
                .unwrap()
                .push(updated_after.map(String::from));
            let mut pages = self.calendar_pages.lock().unwrap();
            if pages.is_empty() {
                Ok(SyncPage::default())
            } else {
                Ok(pages.remove(0))
            }
        }
    }

    pub fn gmail_message(id: &str, occurred_at: &str, labels: &[&str]) -> SyncItem {
        SyncItem {
            id: id.to_string(),
            occurred_at: Some(occurred_at.to_string()),
            payload: serde_json::json!({
                "id": id,
                "labelIds": labels,
                "snippet": format!("snippet {}", id),
            }),
        }
    }

    /// A processing-state job row for driving a processor directly.
    pub fn processing_job(kind: &str, user_id: &str, payload: Option<String>, batch: Option<&str>) -> Job {
        Job {
            id: "job-under-test".to_string(),
            user_id: user_id.to_string(),
            kind: kind.to_string(),
            payload,
            status: "processing".to_string(),
            attempts: 0,
            batch_id: batch.map(String::from),
            last_error: None,
            scheduled_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}
