//! Embedding service.
//!
//! Calls an OpenAI-compatible embeddings endpoint when one is configured.
//! Without configuration it produces deterministic hash-based placeholder
//! vectors, so the pipeline and its tests run end to end with no credentials.
//! Placeholder vectors are NOT semantic.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::time::sleep;
use tracing::debug;

use crate::config::EmbeddingConfig;
use crate::{Error, Result};

/// Retries per request before giving up
const MAX_RETRIES: u32 = 2;

/// Delay before the first retry (doubles each time)
const RETRY_DELAY_MS: u64 = 500;

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    data: Option<Vec<EmbedData>>,
    error: Option<EmbedError>,
}

#[derive(Debug, Deserialize)]
struct EmbedData {
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbedError {
    message: String,
}

/// Text-to-vector service with a placeholder fallback.
#[derive(Clone)]
pub struct EmbeddingService {
    inner: Arc<EmbeddingServiceInner>,
}

struct EmbeddingServiceInner {
    client: Client,
    base_url: Option<String>,
    model: String,
    api_key: Option<String>,
    dimension: usize,
}

impl EmbeddingService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::Embedding(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(EmbeddingServiceInner {
                client,
                base_url: config.base_url.clone(),
                model: config.model.clone(),
                api_key: config.api_key.clone(),
                dimension: config.dimension,
            }),
        })
    }

    pub fn dimension(&self) -> usize {
        self.inner.dimension
    }

    pub fn has_provider(&self) -> bool {
        self.inner.base_url.is_some()
    }

    /// Generate an embedding vector for one text.
    pub async fn generate(&self, text: &str) -> Result<Vec<f32>> {
        let Some(base_url) = self.inner.base_url.as_deref() else {
            debug!("Generating hash-based placeholder embedding");
            return Ok(self.hash_embed(text));
        };

        let mut delay = Duration::from_millis(RETRY_DELAY_MS);
        let mut last_error = None;

        for attempt in 0..=MAX_RETRIES {
            match self.call_provider(base_url, text).await {
                Ok(embedding) => return Ok(embedding),
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying embedding request");
                        sleep(delay).await;
                        delay *= 2;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| Error::Embedding("Embedding request failed".to_string())))
    }

    async fn call_provider(&self, base_url: &str, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", base_url.trim_end_matches('/'));

        let mut request = self.inner.client.post(&url).json(&json!({
            "model": self.inner.model,
            "input": text,
        }));
        if let Some(key) = &self.inner.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Embedding(format!("Embedding request failed: {}", e)))?;

        let resp: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::Embedding(format!("Failed to parse embedding response: {}", e)))?;

        if let Some(error) = resp.error {
            return Err(Error::Embedding(error.message));
        }

        resp.data
            .and_then(|d| d.into_iter().next())
            .map(|d| d.embedding)
            .ok_or_else(|| Error::Embedding("No embedding in response".to_string()))
    }

    /// Deterministic unit vector derived from the text alone.
    fn hash_embed(&self, text: &str) -> Vec<f32> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let dim = self.inner.dimension;
        let mut embedding = vec![0.0f32; dim];

        for (i, slot) in embedding.iter_mut().enumerate() {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            (i as u64).hash(&mut hasher);
            let hash = hasher.finish();
            *slot = ((hash as f64 / u64::MAX as f64) * 2.0 - 1.0) as f32;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }

        embedding
    }
}
