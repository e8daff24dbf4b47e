//! Job kinds, typed payloads, and payload validation.
//!
//! Every payload is checked before a job row is written: size and depth limits
//! first, then the kind-specific shape. Parsing lands in a sum type with one
//! variant per kind, so processor dispatch over payloads is an exhaustive
//! match. `sanitize` is a defense-in-depth cleanup pass, not a substitute for
//! the typed parse.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{Error, Result};

/// Maximum serialized payload size in bytes (1 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Maximum nested object/array depth.
pub const MAX_PAYLOAD_DEPTH: usize = 10;

/// Safety bound on the depth-check recursion itself.
const DEPTH_RECURSION_CAP: usize = 15;

/// Entries sampled per level when estimating depth.
const DEPTH_SAMPLE_SIZE: usize = 10;

/// Sanitizer limits, applied per level.
const MAX_STRING_LEN: usize = 50_000;
const MAX_ARRAY_LEN: usize = 1000;
const MAX_OBJECT_KEYS: usize = 50;

static SCRIPT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b[^>]*>.*?</script>").expect("valid regex"));

/// Job kind enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    GoogleGmailSync,
    GoogleCalendarSync,
    NormalizeGoogleEmail,
    NormalizeGoogleEvent,
    ExtractContacts,
    Embed,
    Insight,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GoogleGmailSync => "google_gmail_sync",
            Self::GoogleCalendarSync => "google_calendar_sync",
            Self::NormalizeGoogleEmail => "normalize_google_email",
            Self::NormalizeGoogleEvent => "normalize_google_event",
            Self::ExtractContacts => "extract_contacts",
            Self::Embed => "embed",
            Self::Insight => "insight",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "google_gmail_sync" => Some(Self::GoogleGmailSync),
            "google_calendar_sync" => Some(Self::GoogleCalendarSync),
            "normalize_google_email" => Some(Self::NormalizeGoogleEmail),
            "normalize_google_event" => Some(Self::NormalizeGoogleEvent),
            "extract_contacts" => Some(Self::ExtractContacts),
            "embed" => Some(Self::Embed),
            "insight" => Some(Self::Insight),
            _ => None,
        }
    }

    /// All kinds with built-in processors.
    pub fn all() -> [JobKind; 7] {
        [
            Self::GoogleGmailSync,
            Self::GoogleCalendarSync,
            Self::NormalizeGoogleEmail,
            Self::NormalizeGoogleEvent,
            Self::ExtractContacts,
            Self::Embed,
            Self::Insight,
        ]
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload for sync and normalize jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SyncPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractMode {
    Single,
    Batch,
}

/// Payload for contact extraction jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExtractContactsPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExtractMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerType {
    Interaction,
    Document,
}

impl OwnerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Interaction => "interaction",
            Self::Document => "document",
        }
    }
}

/// Payload for embedding jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EmbedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_type: Option<OwnerType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    ThreadSummary,
    NextBestAction,
    WeeklyDigest,
    LeadScore,
    Llm,
}

impl InsightKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ThreadSummary => "thread_summary",
            Self::NextBestAction => "next_best_action",
            Self::WeeklyDigest => "weekly_digest",
            Self::LeadScore => "lead_score",
            Self::Llm => "llm",
        }
    }
}

/// Payload for insight jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct InsightPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<InsightKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Typed payload, one variant per job kind.
#[derive(Debug, Clone, PartialEq)]
pub enum JobPayload {
    GoogleGmailSync(SyncPayload),
    GoogleCalendarSync(SyncPayload),
    NormalizeGoogleEmail(SyncPayload),
    NormalizeGoogleEvent(SyncPayload),
    ExtractContacts(ExtractContactsPayload),
    Embed(EmbedPayload),
    Insight(InsightPayload),
}

impl JobPayload {
    /// Parse a raw JSON payload into the variant for `kind`.
    pub fn parse(kind: JobKind, value: &Value) -> Result<Self> {
        // A missing payload means all-defaults for every kind
        let owned = if value.is_null() {
            Value::Object(Default::default())
        } else {
            value.clone()
        };

        let map_err = |e: serde_json::Error| Error::InvalidPayload {
            kind: kind.as_str().to_string(),
            message: e.to_string(),
        };

        Ok(match kind {
            JobKind::GoogleGmailSync => {
                Self::GoogleGmailSync(serde_json::from_value(owned).map_err(map_err)?)
            }
            JobKind::GoogleCalendarSync => {
                Self::GoogleCalendarSync(serde_json::from_value(owned).map_err(map_err)?)
            }
            JobKind::NormalizeGoogleEmail => {
                Self::NormalizeGoogleEmail(serde_json::from_value(owned).map_err(map_err)?)
            }
            JobKind::NormalizeGoogleEvent => {
                Self::NormalizeGoogleEvent(serde_json::from_value(owned).map_err(map_err)?)
            }
            JobKind::ExtractContacts => {
                Self::ExtractContacts(serde_json::from_value(owned).map_err(map_err)?)
            }
            JobKind::Embed => Self::Embed(serde_json::from_value(owned).map_err(map_err)?),
            JobKind::Insight => Self::Insight(serde_json::from_value(owned).map_err(map_err)?),
        })
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Self::GoogleGmailSync(_) => JobKind::GoogleGmailSync,
            Self::GoogleCalendarSync(_) => JobKind::GoogleCalendarSync,
            Self::NormalizeGoogleEmail(_) => JobKind::NormalizeGoogleEmail,
            Self::NormalizeGoogleEvent(_) => JobKind::NormalizeGoogleEvent,
            Self::ExtractContacts(_) => JobKind::ExtractContacts,
            Self::Embed(_) => JobKind::Embed,
            Self::Insight(_) => JobKind::Insight,
        }
    }
}

/// Validate a payload for a job kind before persistence.
///
/// Rejects unknown kinds, oversized payloads, excessive nesting, and shapes
/// the kind's schema refuses. The caller's value is never mutated.
pub fn validate(kind_str: &str, payload: &Value, user_id: &str) -> Result<JobPayload> {
    let kind = JobKind::from_str(kind_str).ok_or_else(|| {
        warn!(user_id, kind = kind_str, "Rejected payload: unknown job kind");
        Error::UnknownJobKind(kind_str.to_string())
    })?;

    let serialized = serde_json::to_string(payload).unwrap_or_default();
    if serialized.len() > MAX_PAYLOAD_BYTES {
        warn!(
            user_id,
            kind = kind_str,
            size = serialized.len(),
            "Rejected payload: too large"
        );
        return Err(Error::PayloadTooLarge {
            size: serialized.len(),
            max: MAX_PAYLOAD_BYTES,
        });
    }

    if estimate_depth(payload, 0) > MAX_PAYLOAD_DEPTH {
        warn!(
            user_id,
            kind = kind_str,
            excerpt = %excerpt(&serialized),
            "Rejected payload: nesting too deep"
        );
        return Err(Error::PayloadTooDeep {
            max: MAX_PAYLOAD_DEPTH,
        });
    }

    JobPayload::parse(kind, payload).map_err(|e| {
        warn!(
            user_id,
            kind = kind_str,
            error = %e,
            excerpt = %excerpt(&serialized),
            "Rejected payload: schema validation failed"
        );
        e
    })
}

/// Estimate nesting depth by sampling the first few entries per level.
///
/// Recursion is capped; anything deeper than the cap reports the cap, which
/// already exceeds the limit the caller checks against.
fn estimate_depth(value: &Value, level: usize) -> usize {
    if level >= DEPTH_RECURSION_CAP {
        return level;
    }

    match value {
        Value::Object(map) => map
            .values()
            .take(DEPTH_SAMPLE_SIZE)
            .map(|v| estimate_depth(v, level + 1))
            .max()
            .unwrap_or(level + 1),
        Value::Array(items) => items
            .iter()
            .take(DEPTH_SAMPLE_SIZE)
            .map(|v| estimate_depth(v, level + 1))
            .max()
            .unwrap_or(level + 1),
        _ => level,
    }
}

/// Best-effort recursive payload cleanup.
///
/// Truncates strings, strips script tags and javascript:/data:text/html
/// patterns, caps array lengths and object key counts per level, and strips
/// non-word characters from keys. Returns a new value.
pub fn sanitize(value: &Value) -> Value {
    sanitize_at(value, 0)
}

fn sanitize_at(value: &Value, level: usize) -> Value {
    if level >= DEPTH_RECURSION_CAP {
        return Value::Null;
    }

    match value {
        Value::String(s) => Value::String(sanitize_string(s)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .take(MAX_ARRAY_LEN)
                .map(|v| sanitize_at(v, level + 1))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map.iter().take(MAX_OBJECT_KEYS) {
                let clean_key: String = key
                    .chars()
                    .filter(|c| c.is_alphanumeric() || *c == '_')
                    .collect();
                if clean_key.is_empty() {
                    continue;
                }
                out.insert(clean_key, sanitize_at(val, level + 1));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn sanitize_string(s: &str) -> String {
    let stripped = SCRIPT_TAG.replace_all(s, "");
    let stripped = stripped.replace("javascript:", "").replace("data:text/html", "");

    if stripped.len() > MAX_STRING_LEN {
        // Truncate on a char boundary
        let mut end = MAX_STRING_LEN;
        while !stripped.is_char_boundary(end) {
            end -= 1;
        }
        stripped[..end].to_string()
    } else {
        stripped
    }
}

fn excerpt(serialized: &str) -> &str {
    let mut end = serialized.len().min(200);
    while end > 0 && !serialized.is_char_boundary(end) {
        end -= 1;
    }
    &serialized[..end]
}
