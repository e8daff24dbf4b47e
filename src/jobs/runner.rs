//! Polling job runner.
//!
//! One invocation claims up to N due jobs (oldest first) and processes them
//! sequentially; external provider APIs are the bottleneck, so there is no
//! intra-invocation parallelism. Each dispatch races a per-job timeout, and a
//! timeout counts as a failure like any thrown error. Failures reschedule
//! with exponential backoff until the retry ceiling, then land in `error`.
//!
//! Concurrent runner invocations racing on the same rows are tolerated, not
//! excluded: the claim is an atomic conditional update, and every processor
//! write is an idempotent upsert, so a re-run after a partial failure is safe.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::db::{self, DbPool, Job};
use crate::{Error, Result};

use super::dispatcher::ProcessorRegistry;

/// Retry/backoff policy injected into the runner.
///
/// The canonical retry ceiling is 3 attempts; delay before retry n is
/// `base_delay_secs * multiplier^(n-1)`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay_secs: i64,
    pub multiplier: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_secs: 1,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay_secs: config.retry_base_delay_secs,
            multiplier: 2,
        }
    }

    /// Delay before the retry following failure number `attempt` (1-based).
    pub fn delay_secs(&self, attempt: i32) -> i64 {
        let exp = (attempt - 1).max(0) as u32;
        self.base_delay_secs
            .saturating_mul(self.multiplier.saturating_pow(exp))
    }
}

/// Counters for one polling pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub claimed: usize,
    pub succeeded: usize,
    pub requeued: usize,
    pub failed: usize,
}

/// The polling loop: claim, dispatch with timeout, transition status.
pub struct JobRunner {
    pool: DbPool,
    registry: Arc<ProcessorRegistry>,
    policy: RetryPolicy,
    job_timeout: Duration,
}

impl JobRunner {
    pub fn new(
        pool: DbPool,
        registry: Arc<ProcessorRegistry>,
        policy: RetryPolicy,
        job_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            registry,
            policy,
            job_timeout,
        }
    }

    /// Claim and process up to `limit` due jobs, sequentially, oldest first.
    pub async fn process_jobs(&self, limit: i64) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        for _ in 0..limit {
            let Some(job) = db::claim_next_job(&self.pool).await? else {
                break;
            };
            self.run_one(job, &mut summary).await?;
        }

        if summary.claimed > 0 {
            info!(
                claimed = summary.claimed,
                succeeded = summary.succeeded,
                requeued = summary.requeued,
                failed = summary.failed,
                "Polling pass finished"
            );
        }

        Ok(summary)
    }

    /// Claim and process up to `limit` due jobs for one user.
    pub async fn process_user_jobs(&self, user_id: &str, limit: i64) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        for _ in 0..limit {
            let Some(job) = db::claim_next_user_job(&self.pool, user_id).await? else {
                break;
            };
            self.run_one(job, &mut summary).await?;
        }

        Ok(summary)
    }

    async fn run_one(&self, job: Job, summary: &mut RunSummary) -> Result<()> {
        summary.claimed += 1;

        let outcome = match timeout(self.job_timeout, self.registry.dispatch(&job)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::JobTimeout(self.job_timeout.as_secs())),
        };

        match outcome {
            Ok(()) => {
                db::complete_job(&self.pool, &job.id).await?;
                summary.succeeded += 1;
            }
            Err(e) => {
                self.handle_failure(&job, &e).await?;
                if job.attempts + 1 < self.policy.max_attempts {
                    summary.requeued += 1;
                } else {
                    summary.failed += 1;
                }
            }
        }

        Ok(())
    }

    /// Count the failure and either reschedule with backoff or fail
    /// permanently once the ceiling is reached.
    async fn handle_failure(&self, job: &Job, error: &Error) -> Result<()> {
        let failure_number = job.attempts + 1;
        let message = error.to_string();

        if failure_number < self.policy.max_attempts {
            let delay = self.policy.delay_secs(failure_number);
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = failure_number,
                delay_secs = delay,
                error = %message,
                "Job failed, scheduling retry"
            );
            db::reschedule_job(&self.pool, &job.id, &message, delay).await?;
        } else {
            warn!(
                job_id = %job.id,
                kind = %job.kind,
                attempt = failure_number,
                error = %message,
                "Job failed permanently, retry budget exhausted"
            );
            db::fail_job(&self.pool, &job.id, &message).await?;
        }

        Ok(())
    }

    /// Sweep terminal jobs older than the retention window.
    /// Returns the number of rows deleted.
    pub async fn cleanup_old_jobs(&self, retention_days: i64) -> Result<u64> {
        let deleted = db::cleanup_old_jobs(&self.pool, retention_days).await?;
        if deleted > 0 {
            debug!(deleted, retention_days, "Retention sweep removed old jobs");
        }
        Ok(deleted)
    }

    /// Per-status job counts for a user.
    pub async fn get_job_stats(&self, user_id: &str) -> Result<Vec<(String, i64)>> {
        db::count_user_jobs_by_status(&self.pool, user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_pool;
    use crate::jobs::dispatcher::JobProcessor;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct OkProcessor;

    #[async_trait]
    impl JobProcessor for OkProcessor {
        async fn process(&self, _job: &Job) -> Result<()> {
            Ok(())
        }
    }

    struct AlwaysFails {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobProcessor for AlwaysFails {
        async fn process(&self, _job: &Job) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Internal("kaboom".to_string()))
        }
    }

    struct SlowProcessor;

    #[async_trait]
    impl JobProcessor for SlowProcessor {
        async fn process(&self, _job: &Job) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_secs: 0,
            multiplier: 2,
        }
    }

    fn runner(pool: DbPool, registry: ProcessorRegistry, policy: RetryPolicy) -> JobRunner {
        JobRunner::new(pool, Arc::new(registry), policy, Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_success_transitions_to_done() {
        let pool = init_test_pool().await.unwrap();
        let mut registry = ProcessorRegistry::new();
        registry.register("ok_kind", Arc::new(OkProcessor));
        let runner = runner(pool.clone(), registry, fast_policy());

        let job = db::create_job(&pool, db::CreateJob::new("u", "ok_kind"))
            .await
            .unwrap();

        let summary = runner.process_jobs(10).await.unwrap();
        assert_eq!(summary.claimed, 1);
        assert_eq!(summary.succeeded, 1);

        let job = db::get_job(&pool, &job.id).await.unwrap();
        assert_eq!(job.status, "done");
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn test_retry_ceiling_exact() {
        let pool = init_test_pool().await.unwrap();
        let failing = Arc::new(AlwaysFails {
            calls: AtomicUsize::new(0),
        });
        let mut registry = ProcessorRegistry::new();
        registry.register("flaky", failing.clone());
        let runner = runner(pool.clone(), registry, fast_policy());

        let job = db::create_job(&pool, db::CreateJob::new("u", "flaky"))
            .await
            .unwrap();

        // Zero base delay keeps rescheduled jobs immediately due
        for _ in 0..5 {
            runner.process_jobs(10).await.unwrap();
        }

        let job = db::get_job(&pool, &job.id).await.unwrap();
        assert_eq!(job.status, "error");
        assert_eq!(job.attempts, 3);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
        assert_eq!(job.last_error.as_deref(), Some("Internal error: kaboom"));

        // Terminal: further passes never touch it
        let summary = runner.process_jobs(10).await.unwrap();
        assert_eq!(summary.claimed, 0);
        assert_eq!(failing.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let pool = init_test_pool().await.unwrap();
        let mut registry = ProcessorRegistry::new();
        registry.register("slow", Arc::new(SlowProcessor));
        let runner = JobRunner::new(
            pool.clone(),
            Arc::new(registry),
            fast_policy(),
            Duration::from_millis(50),
        );

        let job = db::create_job(&pool, db::CreateJob::new("u", "slow"))
            .await
            .unwrap();

        runner.process_jobs(1).await.unwrap();

        let job = db::get_job(&pool, &job.id).await.unwrap();
        assert_eq!(job.status, "queued");
        assert_eq!(job.attempts, 1);
        assert!(job.last_error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unregistered_kind_exhausts_retries() {
        let pool = init_test_pool().await.unwrap();
        let runner = runner(pool.clone(), ProcessorRegistry::new(), fast_policy());

        let job = db::create_job(&pool, db::CreateJob::new("u", "mystery"))
            .await
            .unwrap();

        for _ in 0..3 {
            runner.process_jobs(10).await.unwrap();
        }

        let job = db::get_job(&pool, &job.id).await.unwrap();
        assert_eq!(job.status, "error");
        assert!(job
            .last_error
            .as_deref()
            .unwrap()
            .contains("No handler registered"));
    }

    #[tokio::test]
    async fn test_process_user_jobs_scoped() {
        let pool = init_test_pool().await.unwrap();
        let mut registry = ProcessorRegistry::new();
        registry.register("ok_kind", Arc::new(OkProcessor));
        let runner = runner(pool.clone(), registry, fast_policy());

        let mine = db::create_job(&pool, db::CreateJob::new("user-1", "ok_kind"))
            .await
            .unwrap();
        let theirs = db::create_job(&pool, db::CreateJob::new("user-2", "ok_kind"))
            .await
            .unwrap();

        let summary = runner.process_user_jobs("user-1", 10).await.unwrap();
        assert_eq!(summary.claimed, 1);

        assert_eq!(db::get_job(&pool, &mine.id).await.unwrap().status, "done");
        assert_eq!(db::get_job(&pool, &theirs.id).await.unwrap().status, "queued");
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_secs(1), 1);
        assert_eq!(policy.delay_secs(2), 2);
        assert_eq!(policy.delay_secs(3), 4);
    }
}
