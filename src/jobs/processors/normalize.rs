//! Raw event normalization processors.
//!
//! Reads a batch's raw events and upserts interactions keyed by
//! (user_id, source, source_id). A uniqueness conflict means already ingested
//! and counts as processed, so replaying a batch is a no-op. Each job runs
//! under a hard wall-clock deadline and stops early with whatever was
//! processed; the early stop is reported in run metrics, not as a failure.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::db::{self, DbPool, Job, RawEvent};
use crate::jobs::dispatcher::JobProcessor;
use crate::jobs::payload::{JobKind, JobPayload};
use crate::{Error, Result};

use super::payload_value;

/// Fields a normalizer extracts from one raw event.
struct Normalized {
    interaction_type: &'static str,
    subject: Option<String>,
    body_text: Option<String>,
    occurred_at: String,
    source_meta: Value,
}

fn header<'a>(payload: &'a Value, name: &str) -> Option<&'a str> {
    payload
        .get("payload")
        .and_then(|p| p.get("headers"))
        .and_then(|h| h.as_array())?
        .iter()
        .find(|h| {
            h.get("name")
                .and_then(|n| n.as_str())
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|h| h.get("value"))
        .and_then(|v| v.as_str())
}

fn normalize_email(event: &RawEvent) -> Normalized {
    let payload = event.payload_json();

    let subject = header(&payload, "Subject").map(String::from);
    let from = header(&payload, "From").map(String::from);
    let to = header(&payload, "To").map(String::from);
    let thread_id = payload
        .get("threadId")
        .and_then(|t| t.as_str())
        .map(String::from);
    let body_text = payload
        .get("snippet")
        .and_then(|s| s.as_str())
        .map(String::from);

    Normalized {
        interaction_type: "email",
        subject,
        body_text,
        occurred_at: event.occurred_at.clone(),
        source_meta: json!({
            "from": from,
            "to": to,
            "threadId": thread_id,
        }),
    }
}

fn normalize_event(event: &RawEvent) -> Normalized {
    let payload = event.payload_json();

    let subject = payload
        .get("summary")
        .and_then(|s| s.as_str())
        .map(String::from);
    let body_text = payload
        .get("description")
        .and_then(|d| d.as_str())
        .map(String::from);
    let attendees: Vec<String> = payload
        .get("attendees")
        .and_then(|a| a.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|att| att.get("email").and_then(|e| e.as_str()))
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    let organizer = payload
        .get("organizer")
        .and_then(|o| o.get("email"))
        .and_then(|e| e.as_str())
        .map(String::from);
    // Prefer the event's own start over the provider's updated timestamp
    let occurred_at = payload
        .get("start")
        .and_then(|s| s.get("dateTime").or_else(|| s.get("date")))
        .and_then(|d| d.as_str())
        .map(String::from)
        .unwrap_or_else(|| event.occurred_at.clone());

    Normalized {
        interaction_type: "calendar_event",
        subject,
        body_text,
        occurred_at,
        source_meta: json!({
            "attendees": attendees,
            "organizer": organizer,
        }),
    }
}

/// Shared batch loop for both normalizers.
async fn normalize_batch(
    pool: &DbPool,
    job: &Job,
    kind: JobKind,
    provider: &str,
    deadline_secs: u64,
    extract: fn(&RawEvent) -> Normalized,
) -> Result<()> {
    let payload = match JobPayload::parse(kind, &payload_value(job))? {
        JobPayload::NormalizeGoogleEmail(p) | JobPayload::NormalizeGoogleEvent(p) => p,
        other => {
            return Err(Error::InvalidPayload {
                kind: other.kind().to_string(),
                message: "wrong payload variant for normalize".to_string(),
            })
        }
    };

    let batch_id = payload
        .batch_id
        .or_else(|| job.batch_id.clone())
        .ok_or_else(|| Error::InvalidPayload {
            kind: kind.as_str().to_string(),
            message: "normalize requires a batch id".to_string(),
        })?;

    let events = db::list_raw_events_for_batch(pool, &job.user_id, provider, &batch_id).await?;
    let total = events.len();

    let started = Instant::now();
    let mut processed = 0usize;
    let mut inserted = 0usize;
    let mut timed_out = false;

    for event in &events {
        if started.elapsed().as_secs() >= deadline_secs {
            timed_out = true;
            warn!(
                user_id = %job.user_id,
                batch_id = %batch_id,
                processed,
                total,
                "Normalize deadline reached, stopping early"
            );
            break;
        }

        let fields = extract(event);
        let wrote = db::upsert_interaction(
            pool,
            db::CreateInteraction {
                user_id: job.user_id.clone(),
                interaction_type: fields.interaction_type.to_string(),
                subject: fields.subject,
                body_text: fields.body_text,
                occurred_at: fields.occurred_at,
                source: provider.to_string(),
                source_id: event.source_id.clone(),
                source_meta: Some(fields.source_meta),
                batch_id: Some(batch_id.clone()),
            },
        )
        .await?;

        processed += 1;
        if wrote {
            inserted += 1;
        }
    }

    info!(
        user_id = %job.user_id,
        batch_id = %batch_id,
        provider,
        processed,
        inserted,
        total,
        timed_out,
        "Normalize finished"
    );

    Ok(())
}

pub struct NormalizeEmailProcessor {
    pool: DbPool,
    config: SyncConfig,
}

impl NormalizeEmailProcessor {
    pub fn new(pool: DbPool, config: SyncConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl JobProcessor for NormalizeEmailProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        normalize_batch(
            &self.pool,
            job,
            JobKind::NormalizeGoogleEmail,
            super::gmail_sync::PROVIDER,
            self.config.normalize_deadline_secs,
            normalize_email,
        )
        .await
    }
}

pub struct NormalizeEventProcessor {
    pool: DbPool,
    config: SyncConfig,
}

impl NormalizeEventProcessor {
    pub fn new(pool: DbPool, config: SyncConfig) -> Self {
        Self { pool, config }
    }
}

#[async_trait]
impl JobProcessor for NormalizeEventProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        normalize_batch(
            &self.pool,
            job,
            JobKind::NormalizeGoogleEvent,
            super::calendar_sync::PROVIDER,
            self.config.normalize_deadline_secs,
            normalize_event,
        )
        .await
    }
}
