//! Pulse worker daemon.
//!
//! Runs the polling job loop and a daily retention sweep until interrupted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulse::config;
use pulse::db;
use pulse::jobs::{processors, JobRunner, RetryPolicy};
use pulse::services::{EmbeddingService, HttpGoogleProvider, LlmService};
use pulse::Result;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pulse=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::init();
    tracing::info!(database = %config.database.path, "Starting Pulse worker");

    let pool = db::init_pool(&config.database.path).await?;
    db::initialize_schema(&pool).await?;
    db::health_check(&pool).await?;
    tracing::info!("Database ready");

    let google = Arc::new(HttpGoogleProvider::new(&config.google)?);
    if !google.is_configured() {
        tracing::warn!("Google access token not configured - sync jobs will fail until it is set");
    }
    let embeddings = EmbeddingService::new(&config.embedding)?;
    if !embeddings.has_provider() {
        tracing::warn!(
            dimension = embeddings.dimension(),
            "No embedding provider configured - using hash-based placeholder vectors"
        );
    }
    let llm = LlmService::new(&config.llm)?;
    if !llm.is_configured() {
        tracing::warn!("LLM provider not configured - llm insight jobs will fail");
    }

    let registry = processors::build_registry(
        pool.clone(),
        google,
        embeddings,
        llm,
        config.sync.clone(),
    );
    tracing::info!(kinds = ?registry.kinds(), "Processors registered");

    let runner = Arc::new(JobRunner::new(
        pool,
        Arc::new(registry),
        RetryPolicy::from_config(&config.runner),
        Duration::from_secs(config.runner.job_timeout_secs),
    ));

    let running = Arc::new(AtomicBool::new(true));

    // Polling loop
    let poll_handle = {
        let runner = runner.clone();
        let running = running.clone();
        let interval = Duration::from_secs(config.runner.poll_interval_secs);
        let batch = config.runner.claim_batch_size;
        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                if let Err(e) = runner.process_jobs(batch).await {
                    tracing::error!(error = %e, "Polling pass failed");
                }
                tokio::time::sleep(interval).await;
            }
        })
    };

    // Retention sweep, once a day
    let sweep_handle = {
        let runner = runner.clone();
        let running = running.clone();
        let retention_days = config.runner.retention_days;
        tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                if let Err(e) = runner.cleanup_old_jobs(retention_days).await {
                    tracing::error!(error = %e, "Retention sweep failed");
                }
                tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
            }
        })
    };

    tracing::info!(
        poll_interval_secs = config.runner.poll_interval_secs,
        "Pulse worker running"
    );

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("Shutdown signal received, stopping");
    running.store(false, Ordering::SeqCst);
    poll_handle.abort();
    sweep_handle.abort();

    Ok(())
}
