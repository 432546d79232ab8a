use anyhow::Result;
use clap::Parser;
use notion_mirror::config;
use notion_mirror::content::SqliteContentStore;
use notion_mirror::db;
use notion_mirror::notion::NotionClient;
use notion_mirror::queue::{self, ProcessOutcome, RetryPolicy};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
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
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);

    // Periodic published-catalog sweep; the first tick fires at startup.
    let sweep_pool = pool.clone();
    let sweep_notion = notion.clone();
    let mut sweep_tick =
        tokio::time::interval(Duration::from_secs(cfg.sync.refresh_interval_seconds));
    tokio::spawn(async move {
        loop {
            sweep_tick.tick().await;
            match queue::enqueue_published(&sweep_pool, &sweep_notion, &policy).await {
                Ok(summary) => {
                    info!(
                        created = summary.created,
                        reused = summary.reused,
                        failed = summary.failures.len(),
                        "published sweep"
                    );
                }
                Err(err) => error!(?err, "published sweep failed"),
            }
        }
    });

    info!(worker_id = %worker_id, "starting sync worker");
    loop {
        match queue::process_next(&pool, &notion, &store, &policy, &worker_id).await {
            Ok(ProcessOutcome::Done(_)) => {}
            Ok(ProcessOutcome::Empty) => tokio::time::sleep(poll_sleep).await,
            Err(err) => {
                error!(?err, "sync worker error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
