//! LLM completion service.
//!
//! Thin client for an OpenAI-compatible chat completions endpoint. Unlike the
//! embedding service there is no offline fallback: insight kinds that need a
//! model fail with `Error::Llm` when no provider is configured, and the job
//! surfaces that error instead of fabricating content.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::LlmConfig;
use crate::{Error, Result};

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
    error: Option<ChatError>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatError {
    message: String,
}

/// Chat completion client.
#[derive(Clone)]
pub struct LlmService {
    inner: Arc<LlmServiceInner>,
}

struct LlmServiceInner {
    client: Client,
    base_url: Option<String>,
    model: String,
    api_key: Option<String>,
}

impl LlmService {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Llm(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(LlmServiceInner {
                client,
                base_url: config.base_url.clone(),
                model: config.model.clone(),
                api_key: config.api_key.clone(),
            }),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.inner.base_url.is_some()
    }

    /// Run one completion and return the assistant text.
    pub async fn complete(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let base_url = self
            .inner
            .base_url
            .as_deref()
            .ok_or_else(|| Error::Llm("No LLM provider configured".to_string()))?;

        let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));

        debug!(model = %self.inner.model, max_tokens, "Requesting LLM completion");

        let mut request = self.inner.client.post(&url).json(&json!({
            "model": self.inner.model,
            "max_tokens": max_tokens,
            "messages": [{"role": "user", "content": prompt}],
        }));
        if let Some(key) = &self.inner.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Llm(format!("LLM request failed: {}", e)))?;

        let resp: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::Llm(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = resp.error {
            return Err(Error::Llm(error.message));
        }

        resp.choices
            .and_then(|c| c.into_iter().next())
            .map(|c| c.message.content)
            .ok_or_else(|| Error::Llm("No completion in response".to_string()))
    }
}
