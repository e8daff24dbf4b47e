//! Processor registry and job dispatch.
//!
//! The registry is an explicit object constructed at startup and passed by
//! reference to the runner; there is no module-level static. Built-in
//! processors are registered under their kind strings, and additional
//! handlers can be registered at runtime for kinds not known at compile time
//! (feature-flagged processors).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};

use crate::db::Job;
use crate::{Error, Result};

/// The unit of business logic executed for one job kind.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> Result<()>;
}

/// Kind-to-processor routing table.
pub struct ProcessorRegistry {
    handlers: HashMap<String, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for a kind, replacing any existing one.
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn JobProcessor>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Kinds with a registered handler.
    pub fn kinds(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Route a claimed job to its processor.
    ///
    /// Processor errors propagate unmodified; retry decisions belong to the
    /// runner, not here.
    pub async fn dispatch(&self, job: &Job) -> Result<()> {
        let handler = self
            .handlers
            .get(&job.kind)
            .ok_or_else(|| Error::NoHandlerRegistered(job.kind.clone()))?;

        info!(
            job_id = %job.id,
            kind = %job.kind,
            user_id = %job.user_id,
            attempt = job.attempts,
            "Job processing started"
        );

        match handler.process(job).await {
            Ok(()) => {
                info!(job_id = %job.id, kind = %job.kind, user_id = %job.user_id, "Job processing succeeded");
                Ok(())
            }
            Err(e) => {
                error!(
                    job_id = %job.id,
                    kind = %job.kind,
                    user_id = %job.user_id,
                    attempt = job.attempts,
                    error = %e,
                    "Job processing failed"
                );
                Err(e)
            }
        }
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProcessor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobProcessor for CountingProcessor {
        async fn process(&self, _job: &Job) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl JobProcessor for FailingProcessor {
        async fn process(&self, _job: &Job) -> Result<()> {
            Err(Error::Internal("always fails".to_string()))
        }
    }

    fn test_job(kind: &str) -> Job {
        Job {
            id: "job-1".to_string(),
            user_id: "user-1".to_string(),
            kind: kind.to_string(),
            payload: None,
            status: "processing".to_string(),
            attempts: 0,
            batch_id: None,
            last_error: None,
            scheduled_at: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_kind() {
        let counter = Arc::new(CountingProcessor {
            calls: AtomicUsize::new(0),
        });
        let mut registry = ProcessorRegistry::new();
        registry.register("embed", counter.clone());

        registry.dispatch(&test_job("embed")).await.unwrap();
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_unregistered_kind() {
        let registry = ProcessorRegistry::new();
        let err = registry.dispatch(&test_job("embed")).await.unwrap_err();
        assert!(matches!(err, Error::NoHandlerRegistered(_)));
    }

    #[tokio::test]
    async fn test_processor_error_propagates_unmodified() {
        let mut registry = ProcessorRegistry::new();
        registry.register("flaky", Arc::new(FailingProcessor));

        let err = registry.dispatch(&test_job("flaky")).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_runtime_registration_replaces() {
        let first = Arc::new(CountingProcessor {
            calls: AtomicUsize::new(0),
        });
        let second = Arc::new(CountingProcessor {
            calls: AtomicUsize::new(0),
        });

        let mut registry = ProcessorRegistry::new();
        registry.register("custom_kind", first.clone());
        registry.register("custom_kind", second.clone());

        registry.dispatch(&test_job("custom_kind")).await.unwrap();
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
    }
}
