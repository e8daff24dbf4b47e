//! Embedding database queries.
//!
//! At most one vector per (user_id, owner_type, owner_id). Candidates for
//! embedding are found with a left-join anti-select against the owner tables.

use sqlx::FromRow;

use crate::{Error, Result};

use super::DbPool;

/// An owner row still lacking an embedding.
#[derive(Debug, Clone, FromRow)]
pub struct EmbeddingCandidate {
    pub owner_id: String,
    pub subject: Option<String>,
    pub body_text: Option<String>,
}

/// Insert an embedding; conflict on the owner key is a no-op.
/// Returns true when a row was written.
pub async fn insert_embedding(
    pool: &DbPool,
    user_id: &str,
    owner_type: &str,
    owner_id: &str,
    content: &str,
    vector: &[f32],
) -> Result<bool> {
    let vector_json = serde_json::to_string(vector)?;

    let result = sqlx::query(
        r#"
        INSERT INTO embeddings (id, user_id, owner_type, owner_id, content, vector, dim)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id, owner_type, owner_id) DO NOTHING
        "#,
    )
    .bind(nanoid::nanoid!())
    .bind(user_id)
    .bind(owner_type)
    .bind(owner_id)
    .bind(content)
    .bind(&vector_json)
    .bind(vector.len() as i64)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Interactions without an embedding row.
pub async fn list_interactions_missing_embedding(
    pool: &DbPool,
    user_id: &str,
    limit: i64,
) -> Result<Vec<EmbeddingCandidate>> {
    sqlx::query_as::<_, EmbeddingCandidate>(
        r#"
        SELECT i.id AS owner_id, i.subject, i.body_text
        FROM interactions i
        LEFT JOIN embeddings e
            ON e.user_id = i.user_id AND e.owner_type = 'interaction' AND e.owner_id = i.id
        WHERE i.user_id = ? AND e.id IS NULL
        ORDER BY i.occurred_at ASC
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// Documents without an embedding row.
pub async fn list_documents_missing_embedding(
    pool: &DbPool,
    user_id: &str,
    limit: i64,
) -> Result<Vec<EmbeddingCandidate>> {
    sqlx::query_as::<_, EmbeddingCandidate>(
        r#"
        SELECT d.id AS owner_id, d.title AS subject, d.body_text
        FROM documents d
        LEFT JOIN embeddings e
            ON e.user_id = d.user_id AND e.owner_type = 'document' AND e.owner_id = d.id
        WHERE d.user_id = ? AND e.id IS NULL
        ORDER BY d.created_at ASC
        LIMIT ?
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(Error::Database)
}

/// Count a user's embeddings.
pub async fn count_embeddings(pool: &DbPool, user_id: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM embeddings WHERE user_id = ?")
        .bind(user_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}
