//! The synchronization job queue.
//!
//! A passive, durable scheduler: triggers enqueue work, any number of worker
//! processes poll [`process_next`], and the job row itself carries the
//! outcome. Sync failures never surface as errors here — they become state
//! transitions on the job, inspectable through [`list_recent`].

use crate::config::Config;
use crate::content::ContentStore;
use crate::db;
use crate::model::{SyncJob, TriggerType};
use crate::notion::WorkspaceSource;
use chrono::{Duration, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid input: {0}")]
    Validation(&'static str),
    #[error("no sync job with id {0}")]
    NotFound(i64),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// When to run a failed job again, and when to stop trying.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay_secs: i64,
    pub max_delay_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 5,
            max_delay_secs: 3600,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.sync.max_attempts as i32,
            base_delay_secs: cfg.sync.backoff_base_seconds as i64,
            max_delay_secs: cfg.sync.max_backoff_seconds as i64,
        }
    }

    /// Exponential backoff: base * 2^(attempt-1), capped, never below base.
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let exp = attempt.saturating_sub(1).clamp(0, 30) as u32;
        let secs = self
            .base_delay_secs
            .saturating_mul(1i64 << exp)
            .min(self.max_delay_secs)
            .max(self.base_delay_secs);
        Duration::seconds(secs)
    }
}

/// Deterministic dedupe key; one active job per page at a time.
pub fn dedupe_key_for_page(page_id: &str) -> String {
    format!("page:{page_id}")
}

#[derive(Debug, Clone)]
pub struct EnqueueOutcome {
    pub job: SyncJob,
    /// False when the request was absorbed into an already-active job.
    pub created: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SweepSummary {
    pub created: usize,
    pub reused: usize,
    /// (page_id, error) pairs for items that could not be enqueued.
    pub failures: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// Nothing was due.
    Empty,
    /// One job was claimed and ran to a completion report.
    Done(SyncJob),
}

/// Enqueue a sync for one page. Idempotent while a job for the same page is
/// still pending or processing: the existing job is returned unchanged.
#[instrument(skip_all)]
pub async fn enqueue_for_page(
    pool: &SqlitePool,
    policy: &RetryPolicy,
    page_id: &str,
    trigger: TriggerType,
    payload: Option<Value>,
) -> Result<EnqueueOutcome, QueueError> {
    let page_id = page_id.trim();
    if page_id.is_empty() {
        return Err(QueueError::Validation("page id must be non-empty"));
    }

    let dedupe_key = dedupe_key_for_page(page_id);
    let (job, created) = db::create_or_reuse_job(
        pool,
        page_id,
        &dedupe_key,
        trigger,
        payload.as_ref(),
        policy.max_attempts,
    )
    .await?;

    if created {
        info!(job_id = job.id, page_id, trigger = trigger.as_str(), "enqueued sync job");
    } else {
        info!(job_id = job.id, page_id, "reused active sync job");
    }
    Ok(EnqueueOutcome { job, created })
}

/// Sweep the workspace's published catalog and enqueue every page. A single
/// bad page id fails only its own entry; the rest of the sweep proceeds.
#[instrument(skip_all)]
pub async fn enqueue_published(
    pool: &SqlitePool,
    source: &dyn WorkspaceSource,
    policy: &RetryPolicy,
) -> Result<SweepSummary, QueueError> {
    let page_ids = source
        .list_published_page_ids()
        .await
        .map_err(anyhow::Error::new)?;

    let mut summary = SweepSummary::default();
    for page_id in page_ids {
        match enqueue_for_page(pool, policy, &page_id, TriggerType::Manual, None).await {
            Ok(outcome) if outcome.created => summary.created += 1,
            Ok(_) => summary.reused += 1,
            Err(err) => {
                warn!(page_id = %page_id, %err, "skipping unenqueueable page");
                summary.failures.push((page_id, err.to_string()));
            }
        }
    }
    info!(
        created = summary.created,
        reused = summary.reused,
        failed = summary.failures.len(),
        "published sweep complete"
    );
    Ok(summary)
}

/// Claim the next due job and run it to completion. The single entry point a
/// worker invokes once per poll tick.
#[instrument(skip_all)]
pub async fn process_next(
    pool: &SqlitePool,
    source: &dyn WorkspaceSource,
    store: &dyn ContentStore,
    policy: &RetryPolicy,
    worker_id: &str,
) -> Result<ProcessOutcome, QueueError> {
    let Some(job) = db::claim_next_job(pool, worker_id, Utc::now()).await? else {
        return Ok(ProcessOutcome::Empty);
    };
    info!(
        job_id = job.id,
        page_id = %job.page_id,
        attempt = job.attempt,
        "claimed sync job"
    );

    let reported = match run_sync(source, store, &job).await {
        Ok(()) => {
            info!(job_id = job.id, page_id = %job.page_id, "sync job succeeded");
            db::mark_succeeded(pool, job.id, worker_id).await?
        }
        Err(failure) => {
            if failure.transient {
                warn!(job_id = job.id, attempt = job.attempt, error = %failure.message, "sync attempt failed");
            } else {
                error!(job_id = job.id, attempt = job.attempt, error = %failure.message, "sync attempt failed");
            }
            if job.attempt >= job.max_attempts {
                db::mark_failed(pool, job.id, worker_id, &failure.message).await?
            } else {
                let next_run_at = Utc::now() + policy.delay_for_attempt(job.attempt);
                db::reschedule_retry(pool, job.id, worker_id, &failure.message, next_run_at).await?
            }
        }
    };

    match reported {
        Some(job) => Ok(ProcessOutcome::Done(job)),
        // A manual retry reclaimed the lease while we were executing; the
        // retried run owns the job now, so report its current state.
        None => {
            warn!(job_id = job.id, "lease was reclaimed during execution");
            let current = db::find_job(pool, job.id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("job {} vanished mid-flight", job.id))?;
            Ok(ProcessOutcome::Done(current))
        }
    }
}

struct SyncFailure {
    message: String,
    transient: bool,
}

/// Fetch then upsert, in that order. A fetch failure must never touch the
/// content repository; an upsert failure counts the same as a fetch failure
/// for retry purposes.
async fn run_sync(
    source: &dyn WorkspaceSource,
    store: &dyn ContentStore,
    job: &SyncJob,
) -> Result<(), SyncFailure> {
    let page = source.fetch_page(&job.page_id).await.map_err(|e| SyncFailure {
        transient: e.is_transient(),
        message: format!("fetch failed: {e}"),
    })?;
    store
        .upsert_by_external_id(&page)
        .await
        .map_err(|e| SyncFailure {
            transient: true,
            message: format!("upsert failed: {e}"),
        })?;
    Ok(())
}

/// Operator retry. Works on any job, including one stuck in `processing`
/// behind a crashed worker's lease; the attempt counter is preserved.
#[instrument(skip_all)]
pub async fn retry(pool: &SqlitePool, job_id: i64) -> Result<SyncJob, QueueError> {
    if job_id <= 0 {
        return Err(QueueError::Validation("job id must be positive"));
    }
    let job = db::reset_for_retry(pool, job_id, Utc::now())
        .await?
        .ok_or(QueueError::NotFound(job_id))?;
    info!(job_id, page_id = %job.page_id, "manually re-queued sync job");
    Ok(job)
}

/// Newest-first listing for operators.
pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<SyncJob>, QueueError> {
    if limit <= 0 {
        return Err(QueueError::Validation("limit must be positive"));
    }
    Ok(db::list_recent_jobs(pool, limit).await?)
}
