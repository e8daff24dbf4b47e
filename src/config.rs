//! Configuration management for Pulse.
//!
//! Loads configuration from environment variables with dotenvy support.
//! Covers the database, the job runner's retry/timeout policy, provider sync
//! limits, and the external Google / embedding / LLM endpoints.

use std::env;
use std::sync::OnceLock;

/// Global configuration instance
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Get the global configuration
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}

/// Initialize configuration (call once at startup)
pub fn init() -> &'static Config {
    config()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub runner: RunnerConfig,
    pub sync: SyncConfig,
    pub google: GoogleConfig,
    pub embedding: EmbeddingConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Seconds between polling passes when running as a daemon.
    pub poll_interval_secs: u64,
    /// Maximum jobs claimed per polling pass.
    pub claim_batch_size: i64,
    /// Per-job processing timeout in seconds.
    pub job_timeout_secs: u64,
    /// Retry ceiling; a job lands in `error` once attempts reach this.
    pub max_attempts: i32,
    /// Base retry delay in seconds (doubles per attempt).
    pub retry_base_delay_secs: i64,
    /// Terminal jobs older than this are swept by the retention cleanup.
    pub retention_days: i64,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Cap on provider items fetched in a single sync run.
    pub max_items_per_run: usize,
    /// Sleep between provider pages, in milliseconds.
    pub inter_page_delay_ms: u64,
    /// Lookback window for a first-ever sync, in days.
    pub initial_lookback_days: i64,
    /// Wall-clock deadline for a normalize job, in seconds.
    pub normalize_deadline_secs: u64,
    /// Gmail labels whose messages are skipped during sync.
    pub gmail_excluded_labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub gmail_base_url: String,
    pub calendar_base_url: String,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub base_url: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
    pub dimension: usize,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: Option<String>,
    pub model: String,
    pub api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            database: DatabaseConfig {
                path: env_or("DATABASE_PATH", "./data/pulse.db"),
            },
            runner: RunnerConfig {
                poll_interval_secs: env_or("RUNNER_POLL_INTERVAL", "5").parse().unwrap_or(5),
                claim_batch_size: env_or("RUNNER_CLAIM_BATCH", "10").parse().unwrap_or(10),
                job_timeout_secs: env_or("RUNNER_JOB_TIMEOUT", "300").parse().unwrap_or(300),
                max_attempts: env_or("RUNNER_MAX_ATTEMPTS", "3").parse().unwrap_or(3),
                retry_base_delay_secs: env_or("RUNNER_RETRY_BASE_DELAY", "1").parse().unwrap_or(1),
                retention_days: env_or("JOB_RETENTION_DAYS", "90").parse().unwrap_or(90),
            },
            sync: SyncConfig {
                max_items_per_run: env_or("SYNC_MAX_ITEMS", "2000").parse().unwrap_or(2000),
                inter_page_delay_ms: env_or("SYNC_PAGE_DELAY_MS", "200").parse().unwrap_or(200),
                initial_lookback_days: env_or("SYNC_LOOKBACK_DAYS", "30").parse().unwrap_or(30),
                normalize_deadline_secs: env_or("NORMALIZE_DEADLINE", "300").parse().unwrap_or(300),
                gmail_excluded_labels: env_or("GMAIL_EXCLUDED_LABELS", "SPAM,TRASH,DRAFT")
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            google: GoogleConfig {
                gmail_base_url: env_or(
                    "GMAIL_BASE_URL",
                    "https://gmail.googleapis.com/gmail/v1",
                ),
                calendar_base_url: env_or(
                    "CALENDAR_BASE_URL",
                    "https://www.googleapis.com/calendar/v3",
                ),
                access_token: env::var("GOOGLE_ACCESS_TOKEN").ok(),
            },
            embedding: EmbeddingConfig {
                base_url: env::var("EMBEDDING_BASE_URL").ok(),
                model: env_or("EMBEDDING_MODEL", "text-embedding-3-small"),
                api_key: env::var("EMBEDDING_API_KEY").ok(),
                dimension: env_or("EMBEDDING_DIMENSION", "768").parse().unwrap_or(768),
            },
            llm: LlmConfig {
                base_url: env::var("LLM_BASE_URL").ok(),
                model: env_or("LLM_MODEL", "gpt-4o-mini"),
                api_key: env::var("LLM_API_KEY").ok(),
            },
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Sync settings with no inter-page pacing, for tests.
#[cfg(test)]
pub fn test_sync_config() -> SyncConfig {
    SyncConfig {
        max_items_per_run: 2000,
        inter_page_delay_ms: 0,
        initial_lookback_days: 30,
        normalize_deadline_secs: 300,
        gmail_excluded_labels: vec![
            "SPAM".to_string(),
            "TRASH".to_string(),
            "DRAFT".to_string(),
        ],
    }
}
