use anyhow::Result;
use clap::Parser;
use notion_mirror::config;
use notion_mirror::content::SqliteContentStore;
use notion_mirror::db;
use notion_mirror::model::JobStatus;
use notion_mirror::notion::NotionClient;
use notion_mirror::queue::{self, ProcessOutcome, RetryPolicy};
use std::path::PathBuf;
use tracing::info;
use uuid::Uuid;

/// Process every due sync job and exit. Jobs parked in backoff are left for
/// the next run; the exit summary reports what remains.
#[derive(Debug, Parser)]
#[command(author, version, about = "Drain due sync jobs and exit")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Sweep the published catalog before draining
    #[arg(long)]
    sweep: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let notion = NotionClient::from_config(&cfg);
    let store = SqliteContentStore::new(pool.clone());
    let policy = RetryPolicy::from_config(&cfg);
    let worker_id = format!("worker-{}", Uuid::new_v4());

    if args.sweep {
        let summary = queue::enqueue_published(&pool, &notion, &policy).await?;
        info!(
            created = summary.created,
            reused = summary.reused,
            failed = summary.failures.len(),
            "published sweep"
        );
    }

    let mut processed = 0u64;
    let mut succeeded = 0u64;
    loop {
        match queue::process_next(&pool, &notion, &store, &policy, &worker_id).await? {
            ProcessOutcome::Done(job) => {
                processed += 1;
                if job.status == JobStatus::Succeeded {
                    succeeded += 1;
                }
            }
            ProcessOutcome::Empty => break,
        }
    }

    let still_pending = db::count_pending_jobs(&pool).await?;
    info!(
        processed,
        succeeded,
        still_pending,
        "sync pass complete"
    );
    Ok(())
}
