//! Google provider client.
//!
//! `GoogleProvider` is the seam the sync processors depend on; the HTTP
//! implementation talks to the Gmail and Calendar REST APIs with bearer auth
//! and page tokens. Items come back as provider-native JSON so the raw event
//! store keeps the unmodified payload and normalization stays a separate,
//! replayable step.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::config::GoogleConfig;
use crate::{Error, Result};

/// One provider item: stable id, provider timestamp, raw payload.
#[derive(Debug, Clone)]
pub struct SyncItem {
    pub id: String,
    pub occurred_at: Option<String>,
    pub payload: Value,
}

/// One page of provider items.
#[derive(Debug, Clone, Default)]
pub struct SyncPage {
    pub items: Vec<SyncItem>,
    pub next_page_token: Option<String>,
}

/// Paginated access to Gmail messages and Calendar events.
///
/// `updated_after` is an RFC 3339 lower bound; `None` means no bound and the
/// caller decides the lookback window.
#[async_trait]
pub trait GoogleProvider: Send + Sync {
    async fn list_gmail_messages(
        &self,
        updated_after: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<SyncPage>;

    async fn list_calendar_events(
        &self,
        updated_after: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<SyncPage>;
}

#[derive(Debug, Deserialize)]
struct GmailListResponse {
    messages: Option<Vec<GmailMessageRef>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CalendarListResponse {
    items: Option<Vec<Value>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

/// Gmail/Calendar client over reqwest.
///
/// Construction succeeds without a token so the daemon can start
/// unconfigured; requests fail with `Error::Google` until one is set.
pub struct HttpGoogleProvider {
    client: Client,
    gmail_base_url: String,
    calendar_base_url: String,
    access_token: Option<String>,
}

impl HttpGoogleProvider {
    pub fn new(config: &GoogleConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Google(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            gmail_base_url: config.gmail_base_url.trim_end_matches('/').to_string(),
            calendar_base_url: config.calendar_base_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.access_token.is_some()
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        let token = self
            .access_token
            .as_deref()
            .ok_or_else(|| Error::Google("GOOGLE_ACCESS_TOKEN is not configured".to_string()))?;

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Google(format!("Request to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Google(format!(
                "Google API returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Google(format!("Failed to parse response from {}: {}", url, e)))
    }

    /// Fetch the full message for a Gmail list entry.
    async fn get_gmail_message(&self, id: &str) -> Result<Value> {
        let url = format!("{}/users/me/messages/{}", self.gmail_base_url, id);
        self.get_json(&url, &[("format", "full".to_string())]).await
    }
}

#[async_trait]
impl GoogleProvider for HttpGoogleProvider {
    async fn list_gmail_messages(
        &self,
        updated_after: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<SyncPage> {
        let url = format!("{}/users/me/messages", self.gmail_base_url);

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(after) = updated_after {
            // Gmail search takes epoch seconds
            if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(after) {
                query.push(("q", format!("after:{}", ts.timestamp())));
            }
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let list: GmailListResponse = serde_json::from_value(self.get_json(&url, &query).await?)?;

        let mut items = Vec::new();
        for message_ref in list.messages.unwrap_or_default() {
            let payload = self.get_gmail_message(&message_ref.id).await?;
            let occurred_at = payload
                .get("internalDate")
                .and_then(|d| d.as_str())
                .and_then(|ms| ms.parse::<i64>().ok())
                .and_then(|ms| chrono::DateTime::from_timestamp_millis(ms))
                .map(|dt| dt.to_rfc3339());
            items.push(SyncItem {
                id: message_ref.id,
                occurred_at,
                payload,
            });
        }

        debug!(count = items.len(), "Fetched Gmail message page");

        Ok(SyncPage {
            items,
            next_page_token: list.next_page_token,
        })
    }

    async fn list_calendar_events(
        &self,
        updated_after: Option<&str>,
        page_token: Option<&str>,
    ) -> Result<SyncPage> {
        let url = format!("{}/calendars/primary/events", self.calendar_base_url);

        let mut query: Vec<(&str, String)> =
            vec![("singleEvents", "true".to_string()), ("orderBy", "updated".to_string())];
        if let Some(after) = updated_after {
            query.push(("updatedMin", after.to_string()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let list: CalendarListResponse =
            serde_json::from_value(self.get_json(&url, &query).await?)?;

        let items = list
            .items
            .unwrap_or_default()
            .into_iter()
            .filter_map(|payload| {
                let id = payload.get("id")?.as_str()?.to_string();
                let occurred_at = payload
                    .get("updated")
                    .and_then(|u| u.as_str())
                    .map(String::from);
                Some(SyncItem {
                    id,
                    occurred_at,
                    payload,
                })
            })
            .collect::<Vec<_>>();

        debug!(count = items.len(), "Fetched Calendar event page");

        Ok(SyncPage {
            items,
            next_page_token: list.next_page_token,
        })
    }
}
