//! Raw event database queries.
//!
//! Raw events hold provider-native JSON exactly as fetched; the normalize
//! processors are the only consumers. Inserts are idempotent on
//! (user_id, provider, source_id).

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{Error, Result};

use super::DbPool;

/// Raw event record from the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct RawEvent {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub payload: String, // provider-native JSON
    pub occurred_at: String,
    pub source_id: String,
    pub batch_id: Option<String>,
    pub created_at: String,
}

impl RawEvent {
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// Input for creating a raw event.
#[derive(Debug, Clone)]
pub struct CreateRawEvent {
    pub user_id: String,
    pub provider: String,
    pub payload: serde_json::Value,
    pub occurred_at: String,
    pub source_id: String,
    pub batch_id: Option<String>,
}

/// Insert a raw event, treating a uniqueness conflict as already ingested.
///
/// Returns true when a row was written.
pub async fn insert_raw_event(pool: &DbPool, input: CreateRawEvent) -> Result<bool> {
    let payload_json = serde_json::to_string(&input.payload)?;

    let result = sqlx::query(
        r#"
        INSERT INTO raw_events (id, user_id, provider, payload, occurred_at, source_id, batch_id)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, provider, source_id) DO NOTHING
        "#,
    )
    .bind(nanoid::nanoid!())
    .bind(&input.user_id)
    .bind(&input.provider)
    .bind(&payload_json)
    .bind(&input.occurred_at)
    .bind(&input.source_id)
    .bind(&input.batch_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// List raw events for a batch and provider, oldest first.
pub async fn list_raw_events_for_batch(
    pool: &DbPool,
    user_id: &str,
    provider: &str,
    batch_id: &str,
) -> Result<Vec<RawEvent>> {
    sqlx::query_as::<_, RawEvent>(
        r#"
        SELECT * FROM raw_events
        WHERE user_id = ? AND provider = ? AND batch_id = ?
        ORDER BY occurred_at ASC
        "#,
    )
    .bind(user_id)
    .bind(provider)
    .bind(batch_id)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// Newest occurred_at previously ingested for a provider.
///
/// Used as the incremental lower bound for the next sync run.
pub async fn latest_raw_event_time(
    pool: &DbPool,
    user_id: &str,
    provider: &str,
) -> Result<Option<String>> {
    let (latest,): (Option<String>,) = sqlx::query_as(
        r#"
        SELECT MAX(occurred_at) FROM raw_events
        WHERE user_id = ? AND provider = ?
        "#,
    )
    .bind(user_id)
    .bind(provider)
    .fetch_one(pool)
    .await?;

    Ok(latest)
}
