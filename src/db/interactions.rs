//! Interaction database queries.
//!
//! Interactions are the canonical normalized record of a contact touchpoint.
//! The UNIQUE(user_id, source, source_id) key is the pipeline's ingestion
//! idempotency backstop: upserts conflict-ignore, so re-running a normalize
//! batch is a no-op.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{Error, Result};

use super::DbPool;

/// Interaction record from the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub user_id: String,
    pub contact_id: Option<String>,
    #[sqlx(rename = "type")]
    pub interaction_type: String,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub occurred_at: String,
    pub source: String,
    pub source_id: String,
    pub source_meta: Option<String>, // JSON
    pub batch_id: Option<String>,
    pub created_at: String,
}

impl Interaction {
    pub fn source_meta_json(&self) -> serde_json::Value {
        self.source_meta
            .as_ref()
            .and_then(|m| serde_json::from_str(m).ok())
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Input for upserting an interaction.
#[derive(Debug, Clone)]
pub struct CreateInteraction {
    pub user_id: String,
    pub interaction_type: String,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    pub occurred_at: String,
    pub source: String,
    pub source_id: String,
    pub source_meta: Option<serde_json::Value>,
    pub batch_id: Option<String>,
}

/// Upsert an interaction; a conflict on (user_id, source, source_id) means
/// already ingested and is not an error. Returns true when a row was written.
pub async fn upsert_interaction(pool: &DbPool, input: CreateInteraction) -> Result<bool> {
    let meta_json = input
        .source_meta
        .map(|m| serde_json::to_string(&m).unwrap_or_default());

    let result = sqlx::query(
        r#"
        INSERT INTO interactions
            (id, user_id, type, subject, body_text, occurred_at, source, source_id, source_meta, batch_id)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, source, source_id) DO NOTHING
        "#,
    )
    .bind(nanoid::nanoid!())
    .bind(&input.user_id)
    .bind(&input.interaction_type)
    .bind(&input.subject)
    .bind(&input.body_text)
    .bind(&input.occurred_at)
    .bind(&input.source)
    .bind(&input.source_id)
    .bind(&meta_json)
    .bind(&input.batch_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Get an interaction by ID.
pub async fn get_interaction(pool: &DbPool, id: &str) -> Result<Interaction> {
    sqlx::query_as::<_, Interaction>("SELECT * FROM interactions WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Interaction not found: {}", id)))
}

/// List a user's interactions not yet linked to a contact, oldest first.
pub async fn list_unlinked_interactions(
    pool: &DbPool,
    user_id: &str,
    limit: i64,
) -> Result<Vec<Interaction>> {
    sqlx::query_as::<_, Interaction>(
        r#"
        SELECT * FROM interactions
        WHERE user_id = ? AND contact_id IS NULL
        ORDER BY occurred_at ASC
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// Link an interaction to a resolved contact.
pub async fn link_interaction_contact(
    pool: &DbPool,
    interaction_id: &str,
    contact_id: &str,
) -> Result<()> {
    let result = sqlx::query("UPDATE interactions SET contact_id = ? WHERE id = ?")
        .bind(contact_id)
        .bind(interaction_id)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!(
            "Interaction not found: {}",
            interaction_id
        )));
    }
    Ok(())
}

/// List recent interactions for a user (insight generators).
pub async fn list_recent_interactions(
    pool: &DbPool,
    user_id: &str,
    limit: i64,
) -> Result<Vec<Interaction>> {
    sqlx::query_as::<_, Interaction>(
        r#"
        SELECT * FROM interactions
        WHERE user_id = ?
        ORDER BY occurred_at DESC
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// List interactions linked to a contact, newest first.
pub async fn list_contact_interactions(
    pool: &DbPool,
    user_id: &str,
    contact_id: &str,
    limit: i64,
) -> Result<Vec<Interaction>> {
    sqlx::query_as::<_, Interaction>(
        r#"
        SELECT * FROM interactions
        WHERE user_id = ? AND contact_id = ?
        ORDER BY occurred_at DESC
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(contact_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}
