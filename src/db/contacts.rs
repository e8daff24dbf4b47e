//! Contact, identity, and timeline database queries.
//!
//! Identity resolution order: observed identities first, then direct contact
//! fields. Email matches carry more weight than phone matches. Timeline
//! inserts conflict-ignore on the natural key, so re-recording an event is
//! a no-op.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::{Error, Result};

use super::DbPool;

/// Contact record from the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub user_id: String,
    pub display_name: String,
    pub primary_email: Option<String>,
    pub primary_phone: Option<String>,
    pub created_at: String,
}

/// Observed identity linking a value (email/phone) to a contact.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ContactIdentity {
    pub id: String,
    pub user_id: String,
    pub contact_id: String,
    pub kind: String,
    pub value: String,
    pub confidence: f64,
    pub created_at: String,
}

/// Input for creating a contact.
#[derive(Debug, Clone)]
pub struct CreateContact {
    pub user_id: String,
    pub display_name: String,
    pub primary_email: Option<String>,
    pub primary_phone: Option<String>,
}

/// Create a contact.
pub async fn create_contact(pool: &DbPool, input: CreateContact) -> Result<Contact> {
    sqlx::query_as::<_, Contact>(
        r#"
        INSERT INTO contacts (id, user_id, display_name, primary_email, primary_phone)
        VALUES (?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(nanoid::nanoid!())
    .bind(&input.user_id)
    .bind(&input.display_name)
    .bind(&input.primary_email)
    .bind(&input.primary_phone)
    .fetch_one(pool)
    .await
    .map_err(Error::Database)
}

/// Find a contact through an observed identity.
pub async fn find_contact_by_identity(
    pool: &DbPool,
    user_id: &str,
    kind: &str,
    value: &str,
) -> Result<Option<ContactIdentity>> {
    sqlx::query_as::<_, ContactIdentity>(
        r#"
        SELECT * FROM contact_identities
        WHERE user_id = ? AND kind = ? AND value = ?
        "#,
    )
    .bind(user_id)
    .bind(kind)
    .bind(value)
    .fetch_optional(pool)
    .await
    .map_err(Error::Database)
}

/// Find a contact by direct email field.
pub async fn find_contact_by_email(
    pool: &DbPool,
    user_id: &str,
    email: &str,
) -> Result<Option<Contact>> {
    sqlx::query_as::<_, Contact>(
        r#"
        SELECT * FROM contacts
        WHERE user_id = ? AND primary_email = ?
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(email)
    .fetch_optional(pool)
    .await
    .map_err(Error::Database)
}

/// Find a contact by direct phone field.
pub async fn find_contact_by_phone(
    pool: &DbPool,
    user_id: &str,
    phone: &str,
) -> Result<Option<Contact>> {
    sqlx::query_as::<_, Contact>(
        r#"
        SELECT * FROM contacts
        WHERE user_id = ? AND primary_phone = ?
        LIMIT 1
        "#,
    )
    .bind(user_id)
    .bind(phone)
    .fetch_optional(pool)
    .await
    .map_err(Error::Database)
}

/// Record an observed identity; conflict on (user_id, kind, value) is a no-op.
pub async fn upsert_contact_identity(
    pool: &DbPool,
    user_id: &str,
    contact_id: &str,
    kind: &str,
    value: &str,
    confidence: f64,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO contact_identities (id, user_id, contact_id, kind, value, confidence)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, kind, value) DO NOTHING
        "#,
    )
    .bind(nanoid::nanoid!())
    .bind(user_id)
    .bind(contact_id)
    .bind(kind)
    .bind(value)
    .bind(confidence)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Input for a timeline entry.
#[derive(Debug, Clone)]
pub struct CreateTimelineEntry {
    pub user_id: String,
    pub contact_id: String,
    pub event_type: String,
    pub title: Option<String>,
    pub occurred_at: String,
    pub source_id: String,
}

/// Record a timeline entry; conflict on the natural key means already
/// recorded and is treated as success.
pub async fn insert_timeline_entry(pool: &DbPool, input: CreateTimelineEntry) -> Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO contact_timeline (id, user_id, contact_id, event_type, title, occurred_at, source_id)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, contact_id, event_type, source_id) DO NOTHING
        "#,
    )
    .bind(nanoid::nanoid!())
    .bind(&input.user_id)
    .bind(&input.contact_id)
    .bind(&input.event_type)
    .bind(&input.title)
    .bind(&input.occurred_at)
    .bind(&input.source_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
