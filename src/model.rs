use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "succeeded" => Some(JobStatus::Succeeded),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    /// Terminal jobs never transition again without an explicit manual retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Where a job came from. Audit metadata only; the queue never branches on it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TriggerType {
    Button,
    Manual,
    Retry,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Button => "button",
            TriggerType::Manual => "manual",
            TriggerType::Retry => "retry",
        }
    }

    pub fn parse_trigger(s: &str) -> Option<Self> {
        match s {
            "button" => Some(TriggerType::Button),
            "manual" => Some(TriggerType::Manual),
            "retry" => Some(TriggerType::Retry),
            _ => None,
        }
    }
}

/// One scheduled attempt to pull a workspace page into the local mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub page_id: String,
    pub dedupe_key: String,
    pub trigger_type: TriggerType,
    pub status: JobStatus,
    pub attempt: i32,
    pub max_attempts: i32,
    pub payload: Option<Value>,
    pub error_message: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncJob {
    /// A job holds its lease exactly while it is processing.
    pub fn is_leased(&self) -> bool {
        self.locked_at.is_some() && self.locked_by.is_some()
    }
}

/// What the workspace source yields for a single page. The queue carries this
/// from fetch to upsert without interpreting the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContent {
    pub external_id: String,
    pub title: Option<String>,
    pub payload: Value,
    pub last_edited_at: Option<DateTime<Utc>>,
}

/// A mirrored page row in the local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPage {
    pub id: i64,
    pub external_id: String,
    pub title: Option<String>,
    pub payload: Value,
    pub last_edited_at: Option<DateTime<Utc>>,
    pub synced_at: DateTime<Utc>,
}
