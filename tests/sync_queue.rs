use async_trait::async_trait;
use chrono::{Duration, Utc};
use notion_mirror::content::{ContentStore, SqliteContentStore, StorageError};
use notion_mirror::model::{JobStatus, PageContent, StoredPage, TriggerType};
use notion_mirror::notion::{SourceError, WorkspaceSource};
use notion_mirror::queue::{self, ProcessOutcome, RetryPolicy};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn test_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_secs: 5,
        max_delay_secs: 3600,
    }
}

fn sample_content(page_id: &str) -> PageContent {
    PageContent {
        external_id: page_id.to_string(),
        title: Some(format!("Page {page_id}")),
        payload: json!({ "id": page_id }),
        last_edited_at: None,
    }
}

/// Workspace fake in the recording style: queued responses are popped per
/// fetch, falling back to success; every call is recorded.
#[derive(Clone, Default)]
struct RecordingWorkspace {
    fetch_responses: Arc<Mutex<VecDeque<Result<PageContent, SourceError>>>>,
    published: Arc<Mutex<Vec<String>>>,
    fetch_calls: Arc<Mutex<Vec<String>>>,
}

impl RecordingWorkspace {
    fn with_fetch_responses(responses: Vec<Result<PageContent, SourceError>>) -> Self {
        Self {
            fetch_responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    fn with_published(ids: &[&str]) -> Self {
        Self {
            published: Arc::new(Mutex::new(ids.iter().map(|s| s.to_string()).collect())),
            ..Default::default()
        }
    }

    async fn fetch_calls(&self) -> Vec<String> {
        self.fetch_calls.lock().await.clone()
    }
}

#[async_trait]
impl WorkspaceSource for RecordingWorkspace {
    async fn fetch_page(&self, page_id: &str) -> Result<PageContent, SourceError> {
        self.fetch_calls.lock().await.push(page_id.to_string());
        let mut guard = self.fetch_responses.lock().await;
        guard
            .pop_front()
            .unwrap_or_else(|| Ok(sample_content(page_id)))
    }

    async fn list_published_page_ids(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.published.lock().await.clone())
    }
}

/// Content store wrapper counting upserts, to verify side-effect ordering.
struct CountingStore {
    inner: SqliteContentStore,
    upserts: AtomicUsize,
}

impl CountingStore {
    fn new(pool: sqlx::SqlitePool) -> Self {
        Self {
            inner: SqliteContentStore::new(pool),
            upserts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ContentStore for CountingStore {
    async fn upsert_by_external_id(&self, page: &PageContent) -> Result<StoredPage, StorageError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert_by_external_id(page).await
    }
}

/// Content store that always fails, for the storage-error retry path.
struct BrokenStore;

#[async_trait]
impl ContentStore for BrokenStore {
    async fn upsert_by_external_id(&self, _page: &PageContent) -> Result<StoredPage, StorageError> {
        Err(StorageError::Db(sqlx::Error::PoolClosed))
    }
}

async fn make_job_due(pool: &sqlx::SqlitePool, job_id: i64) {
    sqlx::query("UPDATE sync_jobs SET next_run_at = ? WHERE id = ?")
        .bind(Utc::now() - Duration::seconds(1))
        .bind(job_id)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn enqueue_is_idempotent_while_active() {
    let pool = setup_pool().await;
    let policy = test_policy();

    let first = queue::enqueue_for_page(&pool, &policy, "p1", TriggerType::Button, None)
        .await
        .unwrap();
    assert!(first.created);

    // Second enqueue while pending is absorbed.
    let second = queue::enqueue_for_page(&pool, &policy, "p1", TriggerType::Manual, None)
        .await
        .unwrap();
    assert!(!second.created);
    assert_eq!(second.job.id, first.job.id);

    // Still absorbed while the job is processing.
    notion_mirror::db::claim_next_job(&pool, "w1", Utc::now())
        .await
        .unwrap()
        .unwrap();
    let third = queue::enqueue_for_page(&pool, &policy, "p1", TriggerType::Button, None)
        .await
        .unwrap();
    assert!(!third.created);
    assert_eq!(third.job.id, first.job.id);
}

#[tokio::test]
async fn payload_rides_along_unparsed() {
    let pool = setup_pool().await;
    let policy = test_policy();

    let payload = json!({ "requested_by": "editor-7", "reason": "webhook" });
    let outcome = queue::enqueue_for_page(
        &pool,
        &policy,
        "p1",
        TriggerType::Button,
        Some(payload.clone()),
    )
    .await
    .unwrap();
    assert_eq!(outcome.job.payload, Some(payload));
}

#[tokio::test]
async fn transient_failure_then_success() {
    let pool = setup_pool().await;
    let policy = test_policy();
    let store = SqliteContentStore::new(pool.clone());
    let workspace = RecordingWorkspace::with_fetch_responses(vec![
        Err(SourceError::RateLimited("slow down".into())),
        Ok(sample_content("p1")),
    ]);

    let job = queue::enqueue_for_page(&pool, &policy, "p1", TriggerType::Button, None)
        .await
        .unwrap()
        .job;

    // First attempt fails; the job goes back to pending with backoff.
    let before = Utc::now();
    let outcome = queue::process_next(&pool, &workspace, &store, &policy, "w1")
        .await
        .unwrap();
    let failed = match outcome {
        ProcessOutcome::Done(j) => j,
        ProcessOutcome::Empty => panic!("expected a job"),
    };
    assert_eq!(failed.id, job.id);
    assert_eq!(failed.status, JobStatus::Pending);
    assert_eq!(failed.attempt, 1);
    assert!(failed.next_run_at.unwrap() > before);
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("fetch failed"));
    assert!(failed.locked_at.is_none());
    assert!(failed.locked_by.is_none());

    // Not claimable until the backoff elapses.
    let outcome = queue::process_next(&pool, &workspace, &store, &policy, "w1")
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Empty));

    make_job_due(&pool, job.id).await;
    let outcome = queue::process_next(&pool, &workspace, &store, &policy, "w1")
        .await
        .unwrap();
    let done = match outcome {
        ProcessOutcome::Done(j) => j,
        ProcessOutcome::Empty => panic!("expected a job"),
    };
    assert_eq!(done.status, JobStatus::Succeeded);
    assert_eq!(done.attempt, 2);
    assert!(done.locked_at.is_none());
    assert!(done.error_message.is_none());
    assert!(done.next_run_at.is_none());

    // The page landed in the mirror.
    let page = store.find_by_external_id("p1").await.unwrap().unwrap();
    assert_eq!(page.title.as_deref(), Some("Page p1"));

    assert_eq!(workspace.fetch_calls().await, vec!["p1", "p1"]);
}

#[tokio::test]
async fn attempts_exhaust_into_terminal_failure() {
    let pool = setup_pool().await;
    let policy = test_policy();
    let store = SqliteContentStore::new(pool.clone());
    let workspace = RecordingWorkspace::with_fetch_responses(vec![
        Err(SourceError::RateLimited("1".into())),
        Err(SourceError::RateLimited("2".into())),
        Err(SourceError::RateLimited("3".into())),
    ]);

    let job = queue::enqueue_for_page(&pool, &policy, "p1", TriggerType::Button, None)
        .await
        .unwrap()
        .job;
    assert_eq!(job.max_attempts, 3);

    for expected_attempt in 1..=3 {
        let outcome = queue::process_next(&pool, &workspace, &store, &policy, "w1")
            .await
            .unwrap();
        let reported = match outcome {
            ProcessOutcome::Done(j) => j,
            ProcessOutcome::Empty => panic!("expected a job"),
        };
        assert_eq!(reported.attempt, expected_attempt);
        if expected_attempt < 3 {
            assert_eq!(reported.status, JobStatus::Pending);
            make_job_due(&pool, job.id).await;
        } else {
            assert_eq!(reported.status, JobStatus::Failed);
            assert!(reported.next_run_at.is_none());
            assert!(reported.locked_at.is_none());
        }
    }

    // Terminal: nothing left to claim even after time passes.
    let outcome = queue::process_next(&pool, &workspace, &store, &policy, "w1")
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Empty));
}

#[tokio::test]
async fn backoff_grows_between_attempts() {
    let pool = setup_pool().await;
    let policy = test_policy();
    let store = SqliteContentStore::new(pool.clone());
    let workspace = RecordingWorkspace::with_fetch_responses(vec![
        Err(SourceError::RateLimited("1".into())),
        Err(SourceError::RateLimited("2".into())),
    ]);

    let job = queue::enqueue_for_page(&pool, &policy, "p1", TriggerType::Button, None)
        .await
        .unwrap()
        .job;

    let first = match queue::process_next(&pool, &workspace, &store, &policy, "w1")
        .await
        .unwrap()
    {
        ProcessOutcome::Done(j) => j,
        ProcessOutcome::Empty => panic!("expected a job"),
    };
    let first_wait = first.next_run_at.unwrap() - first.updated_at;

    make_job_due(&pool, job.id).await;
    let second = match queue::process_next(&pool, &workspace, &store, &policy, "w1")
        .await
        .unwrap()
    {
        ProcessOutcome::Done(j) => j,
        ProcessOutcome::Empty => panic!("expected a job"),
    };
    let second_wait = second.next_run_at.unwrap() - second.updated_at;

    assert!(second_wait >= first_wait);
    assert!(first_wait >= Duration::seconds(policy.base_delay_secs));
}

#[tokio::test]
async fn stuck_processing_job_is_reclaimed_by_retry() {
    let pool = setup_pool().await;
    let policy = test_policy();

    let job = queue::enqueue_for_page(&pool, &policy, "p1", TriggerType::Button, None)
        .await
        .unwrap()
        .job;
    let claimed = notion_mirror::db::claim_next_job(&pool, "w-crashed", Utc::now())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.status, JobStatus::Processing);

    let retried = queue::retry(&pool, job.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Pending);
    assert!(retried.next_run_at.unwrap() <= Utc::now());
    assert!(retried.locked_at.is_none());
    assert!(retried.locked_by.is_none());
    // The counter survives the reset; only the trigger records the reentry.
    assert_eq!(retried.attempt, claimed.attempt);
    assert_eq!(retried.trigger_type, TriggerType::Retry);
}

#[tokio::test]
async fn retried_failed_job_runs_again() {
    let pool = setup_pool().await;
    let mut policy = test_policy();
    policy.max_attempts = 1;
    let store = SqliteContentStore::new(pool.clone());
    let workspace = RecordingWorkspace::with_fetch_responses(vec![
        Err(SourceError::InvalidResponse("bad json".into())),
        Ok(sample_content("p1")),
    ]);

    let job = queue::enqueue_for_page(&pool, &policy, "p1", TriggerType::Button, None)
        .await
        .unwrap()
        .job;
    let failed = match queue::process_next(&pool, &workspace, &store, &policy, "w1")
        .await
        .unwrap()
    {
        ProcessOutcome::Done(j) => j,
        ProcessOutcome::Empty => panic!("expected a job"),
    };
    assert_eq!(failed.status, JobStatus::Failed);

    queue::retry(&pool, job.id).await.unwrap();
    let done = match queue::process_next(&pool, &workspace, &store, &policy, "w1")
        .await
        .unwrap()
    {
        ProcessOutcome::Done(j) => j,
        ProcessOutcome::Empty => panic!("expected a job"),
    };
    assert_eq!(done.status, JobStatus::Succeeded);
    assert!(done.error_message.is_none());
}

#[tokio::test]
async fn published_sweep_counts_created_and_reused() {
    let pool = setup_pool().await;
    let policy = test_policy();
    let workspace = RecordingWorkspace::with_published(&["p1", "p2", "p3", "p4", "p5"]);

    // Two pages already have active jobs.
    queue::enqueue_for_page(&pool, &policy, "p1", TriggerType::Button, None)
        .await
        .unwrap();
    queue::enqueue_for_page(&pool, &policy, "p2", TriggerType::Button, None)
        .await
        .unwrap();

    let summary = queue::enqueue_published(&pool, &workspace, &policy)
        .await
        .unwrap();
    assert_eq!(summary.created, 3);
    assert_eq!(summary.reused, 2);
    assert!(summary.failures.is_empty());
}

#[tokio::test]
async fn published_sweep_collects_per_item_failures() {
    let pool = setup_pool().await;
    let policy = test_policy();
    // A blank id fails validation; everything else still gets enqueued.
    let workspace = RecordingWorkspace::with_published(&["p1", "  ", "p2"]);

    let summary = queue::enqueue_published(&pool, &workspace, &policy)
        .await
        .unwrap();
    assert_eq!(summary.created, 2);
    assert_eq!(summary.reused, 0);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].0, "  ");
}

#[tokio::test]
async fn fetch_failure_never_touches_the_store() {
    let pool = setup_pool().await;
    let policy = test_policy();
    let store = CountingStore::new(pool.clone());
    let workspace = RecordingWorkspace::with_fetch_responses(vec![Err(
        SourceError::InvalidResponse("bad json".into()),
    )]);

    queue::enqueue_for_page(&pool, &policy, "p1", TriggerType::Button, None)
        .await
        .unwrap();
    queue::process_next(&pool, &workspace, &store, &policy, "w1")
        .await
        .unwrap();

    assert_eq!(store.upserts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn upsert_failure_takes_the_retry_path() {
    let pool = setup_pool().await;
    let policy = test_policy();
    let workspace = RecordingWorkspace::default();

    queue::enqueue_for_page(&pool, &policy, "p1", TriggerType::Button, None)
        .await
        .unwrap();
    let outcome = queue::process_next(&pool, &workspace, &BrokenStore, &policy, "w1")
        .await
        .unwrap();
    let job = match outcome {
        ProcessOutcome::Done(j) => j,
        ProcessOutcome::Empty => panic!("expected a job"),
    };
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt, 1);
    assert!(job
        .error_message
        .as_deref()
        .unwrap()
        .contains("upsert failed"));
}

#[tokio::test]
async fn empty_queue_reports_empty() {
    let pool = setup_pool().await;
    let policy = test_policy();
    let store = SqliteContentStore::new(pool.clone());
    let workspace = RecordingWorkspace::default();

    let outcome = queue::process_next(&pool, &workspace, &store, &policy, "w1")
        .await
        .unwrap();
    assert!(matches!(outcome, ProcessOutcome::Empty));
    assert!(workspace.fetch_calls().await.is_empty());
}

#[tokio::test]
async fn recent_listing_is_newest_first() {
    let pool = setup_pool().await;
    let policy = test_policy();

    for page in ["p1", "p2", "p3"] {
        queue::enqueue_for_page(&pool, &policy, page, TriggerType::Button, None)
            .await
            .unwrap();
    }

    let jobs = queue::list_recent(&pool, 2).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].page_id, "p3");
    assert_eq!(jobs[1].page_id, "p2");
}
