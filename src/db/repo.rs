use crate::model::{JobStatus, SyncJob, TriggerType};
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

const JOB_COLUMNS: &str = "id, page_id, dedupe_key, trigger_type, status, attempt, max_attempts, \
     payload, error_message, next_run_at, locked_at, locked_by, created_at, updated_at";

fn job_from_row(row: &SqliteRow) -> Result<SyncJob> {
    let status_str: String = row.get("status");
    let status = JobStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("job has unknown status {status_str}"))?;
    let trigger_str: String = row.get("trigger_type");
    let trigger_type = TriggerType::parse_trigger(&trigger_str)
        .ok_or_else(|| anyhow!("job has unknown trigger {trigger_str}"))?;
    let payload = row
        .get::<Option<String>, _>("payload")
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()
        .context("corrupt job payload")?;

    Ok(SyncJob {
        id: row.get("id"),
        page_id: row.get("page_id"),
        dedupe_key: row.get("dedupe_key"),
        trigger_type,
        status,
        attempt: row.get("attempt"),
        max_attempts: row.get("max_attempts"),
        payload,
        error_message: row.get("error_message"),
        next_run_at: row.get::<Option<DateTime<Utc>>, _>("next_run_at"),
        locked_at: row.get::<Option<DateTime<Utc>>, _>("locked_at"),
        locked_by: row.get("locked_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if matches!(db.kind(), sqlx::error::ErrorKind::UniqueViolation)
    )
}

#[instrument(skip_all)]
pub async fn find_job(pool: &Pool, id: i64) -> Result<Option<SyncJob>> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn find_active_by_dedupe_key(pool: &Pool, dedupe_key: &str) -> Result<Option<SyncJob>> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM sync_jobs \
         WHERE dedupe_key = ? AND status IN ('pending', 'processing') \
         ORDER BY created_at DESC, id DESC LIMIT 1"
    ))
    .bind(dedupe_key)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Create a pending job for `dedupe_key`, or hand back the active one if a
/// pending/processing job already exists. The partial unique index over
/// active jobs is the arbiter when two enqueuers race; the loser re-reads
/// the winner's row. Returns the job and whether it was freshly created.
#[instrument(skip_all)]
pub async fn create_or_reuse_job(
    pool: &Pool,
    page_id: &str,
    dedupe_key: &str,
    trigger: TriggerType,
    payload: Option<&Value>,
    max_attempts: i32,
) -> Result<(SyncJob, bool)> {
    let payload_text = payload.map(serde_json::to_string).transpose()?;

    for _ in 0..3 {
        if let Some(job) = find_active_by_dedupe_key(pool, dedupe_key).await? {
            return Ok((job, false));
        }

        let now = Utc::now();
        let inserted = sqlx::query(&format!(
            "INSERT INTO sync_jobs \
                 (page_id, dedupe_key, trigger_type, status, attempt, max_attempts, \
                  payload, next_run_at, created_at, updated_at) \
             VALUES (?, ?, ?, 'pending', 0, ?, ?, ?, ?, ?) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(page_id)
        .bind(dedupe_key)
        .bind(trigger.as_str())
        .bind(max_attempts)
        .bind(&payload_text)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(pool)
        .await;

        match inserted {
            Ok(row) => return Ok((job_from_row(&row)?, true)),
            // Another enqueuer created the active job between our lookup and
            // insert; loop back and pick theirs up.
            Err(err) if is_unique_violation(&err) => continue,
            Err(err) => return Err(err.into()),
        }
    }
    bail!("gave up enqueueing {page_id}: dedupe key {dedupe_key} kept changing under us")
}

/// Atomically claim the oldest due pending job for `worker_id`.
///
/// Selection and lease are split into a read plus a conditional update; the
/// `status = 'pending'` guard on the update is the compare-and-swap. When the
/// affected-row count is zero another worker won the race and we re-select.
#[instrument(skip_all)]
pub async fn claim_next_job(
    pool: &Pool,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<SyncJob>> {
    loop {
        let candidate: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM sync_jobs \
             WHERE status = 'pending' AND (next_run_at IS NULL OR next_run_at <= ?) \
             ORDER BY created_at ASC, id ASC LIMIT 1",
        )
        .bind(now)
        .fetch_optional(pool)
        .await?;

        let Some(id) = candidate else {
            return Ok(None);
        };

        let claimed = sqlx::query(
            "UPDATE sync_jobs SET \
                 status = 'processing', \
                 attempt = attempt + 1, \
                 locked_at = ?, \
                 locked_by = ?, \
                 next_run_at = NULL, \
                 updated_at = ? \
             WHERE id = ? AND status = 'pending'",
        )
        .bind(now)
        .bind(worker_id)
        .bind(now)
        .bind(id)
        .execute(pool)
        .await?;

        if claimed.rows_affected() == 1 {
            let job = find_job(pool, id)
                .await?
                .ok_or_else(|| anyhow!("claimed job {id} vanished"))?;
            return Ok(Some(job));
        }
        // Lost the race; the next iteration sees the queue without this job.
    }
}

/// Record a successful sync. Conditional on the caller still holding the
/// lease; returns None when a manual retry reclaimed the job mid-flight.
#[instrument(skip_all)]
pub async fn mark_succeeded(pool: &Pool, id: i64, worker_id: &str) -> Result<Option<SyncJob>> {
    let row = sqlx::query(&format!(
        "UPDATE sync_jobs SET \
             status = 'succeeded', \
             error_message = NULL, \
             next_run_at = NULL, \
             locked_at = NULL, \
             locked_by = NULL, \
             updated_at = ? \
         WHERE id = ? AND status = 'processing' AND locked_by = ? \
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(Utc::now())
    .bind(id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Release the lease and schedule another attempt at `next_run_at`.
#[instrument(skip_all)]
pub async fn reschedule_retry(
    pool: &Pool,
    id: i64,
    worker_id: &str,
    error_message: &str,
    next_run_at: DateTime<Utc>,
) -> Result<Option<SyncJob>> {
    let row = sqlx::query(&format!(
        "UPDATE sync_jobs SET \
             status = 'pending', \
             error_message = ?, \
             next_run_at = ?, \
             locked_at = NULL, \
             locked_by = NULL, \
             updated_at = ? \
         WHERE id = ? AND status = 'processing' AND locked_by = ? \
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(error_message)
    .bind(next_run_at)
    .bind(Utc::now())
    .bind(id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Attempts are exhausted; park the job until an operator retries it.
#[instrument(skip_all)]
pub async fn mark_failed(
    pool: &Pool,
    id: i64,
    worker_id: &str,
    error_message: &str,
) -> Result<Option<SyncJob>> {
    let row = sqlx::query(&format!(
        "UPDATE sync_jobs SET \
             status = 'failed', \
             error_message = ?, \
             next_run_at = NULL, \
             locked_at = NULL, \
             locked_by = NULL, \
             updated_at = ? \
         WHERE id = ? AND status = 'processing' AND locked_by = ? \
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(error_message)
    .bind(Utc::now())
    .bind(id)
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(job_from_row).transpose()
}

/// Operator-issued retry: re-queue the job whatever its state, dropping any
/// lease (a stuck `processing` row is reclaimable this way) while keeping
/// the attempt counter. Returns None for an unknown id.
#[instrument(skip_all)]
pub async fn reset_for_retry(pool: &Pool, id: i64, now: DateTime<Utc>) -> Result<Option<SyncJob>> {
    let row = sqlx::query(&format!(
        "UPDATE sync_jobs SET \
             status = 'pending', \
             trigger_type = 'retry', \
             next_run_at = ?, \
             locked_at = NULL, \
             locked_by = NULL, \
             updated_at = ? \
         WHERE id = ? \
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(now)
    .bind(now)
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(job_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn list_recent_jobs(pool: &Pool, limit: i64) -> Result<Vec<SyncJob>> {
    let rows = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM sync_jobs ORDER BY created_at DESC, id DESC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(job_from_row).collect()
}

#[instrument(skip_all)]
pub async fn count_pending_jobs(pool: &Pool) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM sync_jobs WHERE status = 'pending'")
            .fetch_one(pool)
            .await?;
    Ok(count)
}
