//! AI insight database queries.
//!
//! One insight per (user_id, subject_type, subject_id, kind); the fingerprint
//! column guards against regenerating identical content.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{Error, Result};

use super::DbPool;

/// AI insight record from the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct AiInsight {
    pub id: String,
    pub user_id: String,
    pub subject_type: String,
    pub subject_id: String,
    pub kind: String,
    pub title: Option<String>,
    pub content: String, // JSON
    pub fingerprint: String,
    pub created_at: String,
}

impl AiInsight {
    pub fn content_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.content).unwrap_or(serde_json::Value::Null)
    }
}

/// Input for persisting an insight.
#[derive(Debug, Clone)]
pub struct CreateInsight {
    pub user_id: String,
    pub subject_type: String,
    pub subject_id: String,
    pub kind: String,
    pub title: Option<String>,
    pub content: serde_json::Value,
    pub fingerprint: String,
}

/// Persist an insight, replacing the previous one for the same subject/kind
/// unless the fingerprint is unchanged. Returns true when a row was written.
pub async fn upsert_insight(pool: &DbPool, input: CreateInsight) -> Result<bool> {
    // Identical fingerprint means nothing new to record
    if let Some(existing) =
        find_insight(pool, &input.user_id, &input.subject_type, &input.subject_id, &input.kind)
            .await?
    {
        if existing.fingerprint == input.fingerprint {
            return Ok(false);
        }
    }

    let content_json = serde_json::to_string(&input.content)?;

    sqlx::query(
        r#"
        INSERT INTO ai_insights (id, user_id, subject_type, subject_id, kind, title, content, fingerprint)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, subject_type, subject_id, kind) DO UPDATE SET
            title = excluded.title,
            content = excluded.content,
            fingerprint = excluded.fingerprint,
            created_at = datetime('now')
        "#,
    )
    .bind(nanoid::nanoid!())
    .bind(&input.user_id)
    .bind(&input.subject_type)
    .bind(&input.subject_id)
    .bind(&input.kind)
    .bind(&input.title)
    .bind(&content_json)
    .bind(&input.fingerprint)
    .execute(pool)
    .await?;

    Ok(true)
}

/// Look up an insight by its subject key.
pub async fn find_insight(
    pool: &DbPool,
    user_id: &str,
    subject_type: &str,
    subject_id: &str,
    kind: &str,
) -> Result<Option<AiInsight>> {
    sqlx::query_as::<_, AiInsight>(
        r#"
        SELECT * FROM ai_insights
        WHERE user_id = ? AND subject_type = ? AND subject_id = ? AND kind = ?
        "#,
    )
    .bind(user_id)
    .bind(subject_type)
    .bind(subject_id)
    .bind(kind)
    .fetch_optional(pool)
    .await
    .map_err(Error::Database)
}
