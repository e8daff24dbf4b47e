//! Contact extraction processor.
//!
//! Walks un-linked interactions, derives candidate identities (email, phone)
//! from provider metadata, and resolves them against observed identities
//! first, then direct contact fields. Email matches are the stronger signal
//! (confidence 0.9), phone the weaker (0.8). Resolved interactions are linked
//! and newly observed identities recorded; calendar interactions also get a
//! timeline entry. Unresolvable interactions stay un-linked for a later pass.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::db::{self, DbPool, Job};
use crate::jobs::dispatcher::JobProcessor;
use crate::jobs::payload::{ExtractMode, JobKind, JobPayload};
use crate::jobs::queue;
use crate::{Error, Result};

use super::payload_value;

pub const EMAIL_CONFIDENCE: f64 = 0.9;
pub const PHONE_CONFIDENCE: f64 = 0.8;

const DEFAULT_MAX_ITEMS: i64 = 100;

pub struct ExtractContactsProcessor {
    pool: DbPool,
}

impl ExtractContactsProcessor {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Resolve an email candidate; records the identity when the match came
    /// from a direct contact field.
    async fn resolve_email(&self, user_id: &str, email: &str) -> Result<Option<String>> {
        if let Some(identity) =
            db::find_contact_by_identity(&self.pool, user_id, "email", email).await?
        {
            return Ok(Some(identity.contact_id));
        }

        if let Some(contact) = db::find_contact_by_email(&self.pool, user_id, email).await? {
            db::upsert_contact_identity(
                &self.pool,
                user_id,
                &contact.id,
                "email",
                email,
                EMAIL_CONFIDENCE,
            )
            .await?;
            return Ok(Some(contact.id));
        }

        Ok(None)
    }

    async fn resolve_phone(&self, user_id: &str, phone: &str) -> Result<Option<String>> {
        if let Some(identity) =
            db::find_contact_by_identity(&self.pool, user_id, "phone", phone).await?
        {
            return Ok(Some(identity.contact_id));
        }

        if let Some(contact) = db::find_contact_by_phone(&self.pool, user_id, phone).await? {
            db::upsert_contact_identity(
                &self.pool,
                user_id,
                &contact.id,
                "phone",
                phone,
                PHONE_CONFIDENCE,
            )
            .await?;
            return Ok(Some(contact.id));
        }

        Ok(None)
    }

    /// Try to link one interaction. Returns true when a contact was resolved.
    async fn link_interaction(&self, interaction: &db::Interaction) -> Result<bool> {
        let meta = interaction.source_meta_json();
        let candidates = candidate_identities(&meta);

        let mut resolved = None;
        for email in &candidates.emails {
            if let Some(contact_id) = self.resolve_email(&interaction.user_id, email).await? {
                resolved = Some(contact_id);
                break;
            }
        }
        if resolved.is_none() {
            for phone in &candidates.phones {
                if let Some(contact_id) = self.resolve_phone(&interaction.user_id, phone).await? {
                    resolved = Some(contact_id);
                    break;
                }
            }
        }

        let Some(contact_id) = resolved else {
            debug!(
                interaction_id = %interaction.id,
                emails = candidates.emails.len(),
                phones = candidates.phones.len(),
                "No contact resolved for interaction"
            );
            return Ok(false);
        };

        db::link_interaction_contact(&self.pool, &interaction.id, &contact_id).await?;

        if interaction.interaction_type == "calendar_event" {
            // Conflict on the natural key means already recorded
            db::insert_timeline_entry(
                &self.pool,
                db::CreateTimelineEntry {
                    user_id: interaction.user_id.clone(),
                    contact_id: contact_id.clone(),
                    event_type: "meeting".to_string(),
                    title: interaction.subject.clone(),
                    occurred_at: interaction.occurred_at.clone(),
                    source_id: interaction.source_id.clone(),
                },
            )
            .await?;
        }

        Ok(true)
    }
}

struct Candidates {
    emails: Vec<String>,
    phones: Vec<String>,
}

/// Candidate identities from provider metadata: sender address for emails,
/// attendee list for calendar events, plus any phone field.
fn candidate_identities(meta: &Value) -> Candidates {
    let mut emails = Vec::new();
    let mut phones = Vec::new();

    if let Some(from) = meta.get("from").and_then(|f| f.as_str()) {
        if let Some(addr) = parse_email_address(from) {
            emails.push(addr);
        }
    }
    if let Some(attendees) = meta.get("attendees").and_then(|a| a.as_array()) {
        for attendee in attendees {
            if let Some(addr) = attendee.as_str().and_then(parse_email_address) {
                if !emails.contains(&addr) {
                    emails.push(addr);
                }
            }
        }
    }
    if let Some(phone) = meta.get("phone").and_then(|p| p.as_str()) {
        let trimmed = phone.trim();
        if !trimmed.is_empty() {
            phones.push(trimmed.to_string());
        }
    }

    Candidates { emails, phones }
}

/// Extract the address from `Name <addr@host>` or a bare address.
fn parse_email_address(raw: &str) -> Option<String> {
    let addr = match (raw.rfind('<'), raw.rfind('>')) {
        (Some(open), Some(close)) if open < close => &raw[open + 1..close],
        _ => raw,
    };
    let addr = addr.trim().to_lowercase();
    if addr.contains('@') {
        Some(addr)
    } else {
        None
    }
}

#[async_trait]
impl JobProcessor for ExtractContactsProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        let payload = match JobPayload::parse(JobKind::ExtractContacts, &payload_value(job))? {
            JobPayload::ExtractContacts(p) => p,
            other => {
                return Err(Error::InvalidPayload {
                    kind: other.kind().to_string(),
                    message: "wrong payload variant for extract contacts".to_string(),
                })
            }
        };

        let interactions = match payload.mode.unwrap_or(ExtractMode::Batch) {
            ExtractMode::Single => {
                let id = payload.interaction_id.ok_or_else(|| Error::InvalidPayload {
                    kind: JobKind::ExtractContacts.as_str().to_string(),
                    message: "single mode requires interactionId".to_string(),
                })?;
                vec![db::get_interaction(&self.pool, &id).await?]
            }
            ExtractMode::Batch => {
                let limit = payload.max_items.map(i64::from).unwrap_or(DEFAULT_MAX_ITEMS);
                db::list_unlinked_interactions(&self.pool, &job.user_id, limit).await?
            }
        };

        let mut linked = 0usize;
        for interaction in &interactions {
            if interaction.contact_id.is_some() {
                continue;
            }
            if self.link_interaction(interaction).await? {
                linked += 1;
            }
        }

        if linked > 0 {
            let batch_id = payload.batch_id.or_else(|| job.batch_id.clone());
            queue::enqueue(
                &self.pool,
                &job.user_id,
                JobKind::Embed.as_str(),
                serde_json::json!({}),
                batch_id.as_deref(),
            )
            .await?;
        }

        info!(
            user_id = %job.user_id,
            scanned = interactions.len(),
            linked,
            "Contact extraction finished"
        );

        Ok(())
    }
}
