use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use notion_mirror::config;
use notion_mirror::db;
use notion_mirror::model::{SyncJob, TriggerType};
use notion_mirror::notion::NotionClient;
use notion_mirror::queue::{self, RetryPolicy};
use std::path::PathBuf;

/// Operator view of the sync queue: inspect recent jobs, re-queue stuck or
/// failed ones, and enqueue pages by hand.
#[derive(Debug, Parser)]
#[command(author, version, about = "Inspect and manage sync jobs")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List recent jobs, newest first
    List {
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Re-queue a job by id, reclaiming its lease if stuck in processing
    Retry { job_id: i64 },
    /// Enqueue a single page by workspace page id
    Enqueue { page_id: String },
    /// Enqueue every published page from the workspace catalog
    Sweep,
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
    let policy = RetryPolicy::from_config(&cfg);

    match args.command {
        Command::List { limit } => {
            let jobs = queue::list_recent(&pool, limit).await?;
            if jobs.is_empty() {
                println!("no sync jobs");
            }
            for job in jobs {
                println!("{}", format_job(&job));
            }
        }
        Command::Retry { job_id } => {
            let job = queue::retry(&pool, job_id).await?;
            println!("re-queued: {}", format_job(&job));
        }
        Command::Enqueue { page_id } => {
            let outcome =
                queue::enqueue_for_page(&pool, &policy, &page_id, TriggerType::Button, None)
                    .await?;
            let verb = if outcome.created { "created" } else { "reused" };
            println!("{verb}: {}", format_job(&outcome.job));
        }
        Command::Sweep => {
            let notion = NotionClient::from_config(&cfg);
            let summary = queue::enqueue_published(&pool, &notion, &policy).await?;
            println!(
                "sweep: created={} reused={} failed={}",
                summary.created,
                summary.reused,
                summary.failures.len()
            );
            for (page_id, err) in &summary.failures {
                println!("  failed {page_id}: {err}");
            }
        }
    }
    Ok(())
}

fn format_job(job: &SyncJob) -> String {
    let mut line = format!(
        "#{} {} page={} trigger={} attempt={}/{}",
        job.id,
        job.status.as_str(),
        job.page_id,
        job.trigger_type.as_str(),
        job.attempt,
        job.max_attempts,
    );
    if let Some(next) = job.next_run_at {
        line.push_str(&format!(" next_run_in={}s", (next - Utc::now()).num_seconds()));
    }
    if let (Some(at), Some(by)) = (job.locked_at, &job.locked_by) {
        line.push_str(&format!(
            " locked_by={by} held_for={}s",
            (Utc::now() - at).num_seconds()
        ));
    }
    if let Some(err) = &job.error_message {
        line.push_str(&format!(" error={err:?}"));
    }
    line
}
