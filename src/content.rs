//! Local mirror of workspace pages.
//!
//! The queue engine only sees the [`ContentStore`] trait; the sqlite
//! implementation below writes the `pages` table that the public site
//! serves from.

use crate::model::{PageContent, StoredPage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::instrument;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("corrupt page payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Upsert-by-external-id capability consumed by the sync engine.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn upsert_by_external_id(&self, page: &PageContent) -> Result<StoredPage, StorageError>;
}

#[derive(Clone, Debug)]
pub struct SqliteContentStore {
    pool: SqlitePool,
}

impl SqliteContentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<StoredPage>, StorageError> {
        let row = sqlx::query(
            "SELECT id, external_id, title, payload, last_edited_at, synced_at \
             FROM pages WHERE external_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(page_from_row).transpose()
    }
}

#[async_trait]
impl ContentStore for SqliteContentStore {
    #[instrument(skip_all, fields(external_id = %page.external_id))]
    async fn upsert_by_external_id(&self, page: &PageContent) -> Result<StoredPage, StorageError> {
        let payload = serde_json::to_string(&page.payload)?;
        let row = sqlx::query(
            "INSERT INTO pages (external_id, title, payload, last_edited_at, synced_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(external_id) DO UPDATE SET \
                 title = excluded.title, \
                 payload = excluded.payload, \
                 last_edited_at = excluded.last_edited_at, \
                 synced_at = excluded.synced_at \
             RETURNING id, external_id, title, payload, last_edited_at, synced_at",
        )
        .bind(&page.external_id)
        .bind(&page.title)
        .bind(payload)
        .bind(page.last_edited_at)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        page_from_row(row)
    }
}

fn page_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StoredPage, StorageError> {
    let payload: String = row.get("payload");
    Ok(StoredPage {
        id: row.get("id"),
        external_id: row.get("external_id"),
        title: row.get("title"),
        payload: serde_json::from_str(&payload)?,
        last_edited_at: row.get::<Option<DateTime<Utc>>, _>("last_edited_at"),
        synced_at: row.get("synced_at"),
    })
}
