//! Insight generation processor.
//!
//! Dispatches on the insight kind to a generator. Most generators are
//! deterministic reads over recent interactions and contacts; the `llm` kind
//! calls the completion service and fails the job when no provider is
//! configured. Results are fingerprinted (sha256 of the content) so
//! regenerating identical content writes nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::db::{self, DbPool, Interaction, Job};
use crate::jobs::dispatcher::JobProcessor;
use crate::jobs::payload::{InsightKind, JobKind, JobPayload};
use crate::services::LlmService;
use crate::{Error, Result};

use super::payload_value;

pub struct InsightProcessor {
    pool: DbPool,
    llm: LlmService,
}

struct Generated {
    title: String,
    content: Value,
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn days_since(interactions: &[Interaction]) -> Option<i64> {
    interactions
        .iter()
        .filter_map(|i| parse_time(&i.occurred_at))
        .max()
        .map(|latest| (Utc::now() - latest).num_days())
}

pub fn fingerprint(content: &Value) -> String {
    let serialized = serde_json::to_string(content).unwrap_or_default();
    hex::encode(Sha256::digest(serialized.as_bytes()))
}

impl InsightProcessor {
    pub fn new(pool: DbPool, llm: LlmService) -> Self {
        Self { pool, llm }
    }

    async fn thread_summary(&self, user_id: &str, contact_id: &str) -> Result<Generated> {
        let interactions =
            db::list_contact_interactions(&self.pool, user_id, contact_id, 20).await?;

        let first_at = interactions.iter().map(|i| i.occurred_at.as_str()).min();
        let last_at = interactions.iter().map(|i| i.occurred_at.as_str()).max();
        let latest_subject = interactions.first().and_then(|i| i.subject.clone());

        Ok(Generated {
            title: "Conversation summary".to_string(),
            content: json!({
                "message_count": interactions.len(),
                "first_at": first_at,
                "last_at": last_at,
                "latest_subject": latest_subject,
            }),
        })
    }

    async fn next_best_action(&self, user_id: &str, contact_id: &str) -> Result<Generated> {
        let interactions =
            db::list_contact_interactions(&self.pool, user_id, contact_id, 20).await?;

        let days = days_since(&interactions);
        let action = match days {
            None => "reach_out",
            Some(d) if d >= 14 => "follow_up",
            Some(_) => "await_reply",
        };

        Ok(Generated {
            title: "Next best action".to_string(),
            content: json!({
                "action": action,
                "days_since_last_touch": days,
                "last_subject": interactions.first().and_then(|i| i.subject.clone()),
            }),
        })
    }

    async fn weekly_digest(&self, user_id: &str) -> Result<Generated> {
        let recent = db::list_recent_interactions(&self.pool, user_id, 500).await?;
        let cutoff = Utc::now() - chrono::Duration::days(7);

        let this_week: Vec<&Interaction> = recent
            .iter()
            .filter(|i| parse_time(&i.occurred_at).is_some_and(|t| t >= cutoff))
            .collect();
        let emails = this_week
            .iter()
            .filter(|i| i.interaction_type == "email")
            .count();
        let meetings = this_week
            .iter()
            .filter(|i| i.interaction_type == "calendar_event")
            .count();
        let active_contacts = this_week
            .iter()
            .filter_map(|i| i.contact_id.as_deref())
            .collect::<std::collections::HashSet<_>>()
            .len();

        Ok(Generated {
            title: "Weekly digest".to_string(),
            content: json!({
                "total": this_week.len(),
                "emails": emails,
                "meetings": meetings,
                "active_contacts": active_contacts,
            }),
        })
    }

    async fn lead_score(&self, user_id: &str, contact_id: &str) -> Result<Generated> {
        let interactions =
            db::list_contact_interactions(&self.pool, user_id, contact_id, 100).await?;

        let days = days_since(&interactions);
        let recency_bonus = match days {
            Some(d) if d <= 7 => 30,
            Some(d) if d <= 30 => 15,
            _ => 0,
        };
        let score = (interactions.len() * 10 + recency_bonus).min(100);

        Ok(Generated {
            title: "Lead score".to_string(),
            content: json!({
                "score": score,
                "interaction_count": interactions.len(),
                "days_since_last_touch": days,
            }),
        })
    }

    async fn llm_insight(&self, user_id: &str, context: Option<&str>) -> Result<Generated> {
        let recent = db::list_recent_interactions(&self.pool, user_id, 20).await?;
        let highlights: Vec<String> = recent
            .iter()
            .filter_map(|i| i.subject.clone())
            .take(10)
            .collect();

        let prompt = format!(
            "You are assisting a small-business owner with their CRM.\n\
             Recent interaction subjects:\n{}\n\n{}",
            highlights.join("\n"),
            context.unwrap_or("Summarize notable activity and suggest one follow-up."),
        );

        let text = self.llm.complete(&prompt, 512).await?;

        Ok(Generated {
            title: "Assistant insight".to_string(),
            content: json!({ "text": text }),
        })
    }
}

#[async_trait]
impl JobProcessor for InsightProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        let payload = match JobPayload::parse(JobKind::Insight, &payload_value(job))? {
            JobPayload::Insight(p) => p,
            other => {
                return Err(Error::InvalidPayload {
                    kind: other.kind().to_string(),
                    message: "wrong payload variant for insight".to_string(),
                })
            }
        };

        let kind = payload.kind.ok_or_else(|| Error::InvalidPayload {
            kind: JobKind::Insight.as_str().to_string(),
            message: "insight requires a kind".to_string(),
        })?;

        // Digest and LLM insights are user-scoped by default
        let (subject_type, subject_id) = match kind {
            InsightKind::WeeklyDigest | InsightKind::Llm => (
                payload.subject_type.unwrap_or_else(|| "user".to_string()),
                payload.subject_id.unwrap_or_else(|| job.user_id.clone()),
            ),
            _ => {
                let subject_id = payload.subject_id.ok_or_else(|| Error::InvalidPayload {
                    kind: JobKind::Insight.as_str().to_string(),
                    message: format!("{} requires a subjectId", kind.as_str()),
                })?;
                (
                    payload.subject_type.unwrap_or_else(|| "contact".to_string()),
                    subject_id,
                )
            }
        };

        let generated = match kind {
            InsightKind::ThreadSummary => self.thread_summary(&job.user_id, &subject_id).await?,
            InsightKind::NextBestAction => {
                self.next_best_action(&job.user_id, &subject_id).await?
            }
            InsightKind::WeeklyDigest => self.weekly_digest(&job.user_id).await?,
            InsightKind::LeadScore => self.lead_score(&job.user_id, &subject_id).await?,
            InsightKind::Llm => {
                self.llm_insight(&job.user_id, payload.context.as_deref()).await?
            }
        };

        let fp = fingerprint(&generated.content);
        let wrote = db::upsert_insight(
            &self.pool,
            db::CreateInsight {
                user_id: job.user_id.clone(),
                subject_type,
                subject_id: subject_id.clone(),
                kind: kind.as_str().to_string(),
                title: Some(generated.title),
                content: generated.content,
                fingerprint: fp,
            },
        )
        .await?;

        if wrote {
            info!(
                user_id = %job.user_id,
                kind = kind.as_str(),
                subject_id = %subject_id,
                "Insight written"
            );
        } else {
            debug!(
                user_id = %job.user_id,
                kind = kind.as_str(),
                subject_id = %subject_id,
                "Insight unchanged, skipped"
            );
        }

        Ok(())
    }
}
