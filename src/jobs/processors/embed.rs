//! Embedding generation processor.
//!
//! Finds interactions and documents lacking an embedding row via a left-join
//! anti-select, builds the input text, and inserts the generated vector.
//! Items with too little text are skipped, and per-item generation failures
//! are logged and skipped rather than failing the batch. Owner-key conflicts
//! on insert make re-runs no-ops.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::db::{self, DbPool, EmbeddingCandidate, Job};
use crate::jobs::dispatcher::JobProcessor;
use crate::jobs::payload::{JobKind, JobPayload, OwnerType};
use crate::services::EmbeddingService;
use crate::{Error, Result};

use super::payload_value;

/// Items with less derived text than this are skipped.
pub const MIN_TEXT_LEN: usize = 10;

const DEFAULT_MAX_ITEMS: i64 = 100;

pub struct EmbedProcessor {
    pool: DbPool,
    embeddings: EmbeddingService,
}

impl EmbedProcessor {
    pub fn new(pool: DbPool, embeddings: EmbeddingService) -> Self {
        Self { pool, embeddings }
    }

    /// Embed one candidate. Returns true when a vector was written.
    async fn embed_candidate(
        &self,
        user_id: &str,
        owner_type: OwnerType,
        candidate: &EmbeddingCandidate,
    ) -> Result<bool> {
        let text = embedding_text(candidate);
        if text.len() < MIN_TEXT_LEN {
            debug!(
                owner_id = %candidate.owner_id,
                len = text.len(),
                "Skipping embedding candidate with too little text"
            );
            return Ok(false);
        }

        let vector = self.embeddings.generate(&text).await?;
        db::insert_embedding(
            &self.pool,
            user_id,
            owner_type.as_str(),
            &candidate.owner_id,
            &text,
            &vector,
        )
        .await
    }

    async fn embed_batch(
        &self,
        user_id: &str,
        owner_type: OwnerType,
        candidates: Vec<EmbeddingCandidate>,
    ) -> Result<(usize, usize)> {
        let mut embedded = 0usize;
        let mut failed = 0usize;

        for candidate in &candidates {
            match self.embed_candidate(user_id, owner_type, candidate).await {
                Ok(true) => embedded += 1,
                Ok(false) => {}
                Err(e) => {
                    // Per-item failure is not fatal to the batch
                    warn!(
                        user_id,
                        owner_type = owner_type.as_str(),
                        owner_id = %candidate.owner_id,
                        error = %e,
                        "Embedding failed for item, skipping"
                    );
                    failed += 1;
                }
            }
        }

        Ok((embedded, failed))
    }
}

fn embedding_text(candidate: &EmbeddingCandidate) -> String {
    let subject = candidate.subject.as_deref().unwrap_or("").trim();
    let body = candidate.body_text.as_deref().unwrap_or("").trim();
    if subject.is_empty() {
        body.to_string()
    } else if body.is_empty() {
        subject.to_string()
    } else {
        format!("{}\n{}", subject, body)
    }
}

#[async_trait]
impl JobProcessor for EmbedProcessor {
    async fn process(&self, job: &Job) -> Result<()> {
        let payload = match JobPayload::parse(JobKind::Embed, &payload_value(job))? {
            JobPayload::Embed(p) => p,
            other => {
                return Err(Error::InvalidPayload {
                    kind: other.kind().to_string(),
                    message: "wrong payload variant for embed".to_string(),
                })
            }
        };

        let limit = payload.max_items.map(i64::from).unwrap_or(DEFAULT_MAX_ITEMS);

        // A specific owner narrows the scan to that owner type
        let scopes: Vec<OwnerType> = match payload.owner_type {
            Some(owner_type) => vec![owner_type],
            None => vec![OwnerType::Interaction, OwnerType::Document],
        };

        let mut embedded = 0usize;
        let mut failed = 0usize;

        for owner_type in scopes {
            let mut candidates = match owner_type {
                OwnerType::Interaction => {
                    db::list_interactions_missing_embedding(&self.pool, &job.user_id, limit).await?
                }
                OwnerType::Document => {
                    db::list_documents_missing_embedding(&self.pool, &job.user_id, limit).await?
                }
            };

            if let Some(owner_id) = &payload.owner_id {
                candidates.retain(|c| &c.owner_id == owner_id);
            }

            let (done, bad) = self.embed_batch(&job.user_id, owner_type, candidates).await?;
            embedded += done;
            failed += bad;
        }

        info!(
            user_id = %job.user_id,
            embedded,
            failed,
            "Embedding run finished"
        );

        Ok(())
    }
}
