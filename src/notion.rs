use crate::config::Config;
use crate::model::PageContent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Request, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const NOTION_API_BASE: &str = "https://api.notion.com/";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const QUERY_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to reach Notion: {0}")]
    Network(#[from] reqwest::Error),
    #[error("received 429 from Notion: {0}")]
    RateLimited(String),
    #[error("notion server error {status}: {body}")]
    Server { status: StatusCode, body: String },
    #[error("notion error {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("invalid Notion request: {0}")]
    InvalidRequest(String),
    #[error("invalid Notion response: {0}")]
    InvalidResponse(String),
}

impl SourceError {
    /// Network trouble, throttling, and server errors are worth retrying;
    /// other API rejections and malformed responses are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Network(_) | SourceError::RateLimited(_) | SourceError::Server { .. }
        )
    }
}

/// The workspace side of a sync: fetch one page, or list the publishable
/// catalog. Implemented by [`NotionClient`] and by fakes in tests.
#[async_trait]
pub trait WorkspaceSource: Send + Sync {
    async fn fetch_page(&self, page_id: &str) -> Result<PageContent, SourceError>;

    async fn list_published_page_ids(&self) -> Result<Vec<String>, SourceError>;
}

#[derive(Clone)]
pub struct NotionClient {
    http: Client,
    base_url: Url,
    token: String,
    version: String,
    database_id: String,
    published_property: String,
}

impl fmt::Debug for NotionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionClient")
            .field("base_url", &self.base_url)
            .field("database_id", &self.database_id)
            .finish_non_exhaustive()
    }
}

impl NotionClient {
    pub fn from_config(cfg: &Config) -> Self {
        let base_url = Url::parse(NOTION_API_BASE).expect("valid default Notion URL");
        Self::with_base_url(
            cfg.notion.token.clone(),
            cfg.notion.version.clone(),
            cfg.notion.database_id.clone(),
            cfg.notion.published_property.clone(),
            base_url,
        )
    }

    pub fn with_base_url(
        token: String,
        version: String,
        database_id: String,
        published_property: String,
        base_url: Url,
    ) -> Self {
        let http = Client::builder()
            .user_agent("notion-mirror/0.1")
            .timeout(REQUEST_TIMEOUT)
            .no_proxy()
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
            version,
            database_id,
            published_property,
        }
    }

    pub fn build_page_request(&self, page_id: &str) -> Result<Request, SourceError> {
        let endpoint = self
            .base_url
            .join(&format!("v1/pages/{page_id}"))
            .map_err(|e| SourceError::InvalidRequest(e.to_string()))?;
        self.http
            .get(endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", &self.version)
            .build()
            .map_err(SourceError::Network)
    }

    pub fn build_query_request(&self, cursor: Option<&str>) -> Result<Request, SourceError> {
        let endpoint = self
            .base_url
            .join(&format!("v1/databases/{}/query", self.database_id))
            .map_err(|e| SourceError::InvalidRequest(e.to_string()))?;
        let body = build_published_query_body(&self.published_property, cursor);
        self.http
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", &self.version)
            .header("Content-Type", "application/json")
            .json(&body)
            .build()
            .map_err(SourceError::Network)
    }

    async fn execute(&self, request: Request) -> Result<reqwest::Response, SourceError> {
        debug!(url=%request.url(), "sending notion request");
        let res = self.http.execute(request).await?;
        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(SourceError::RateLimited(body));
        }
        if status.is_server_error() {
            let body = res.text().await.unwrap_or_default();
            return Err(SourceError::Server { status, body });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(SourceError::Api { status, body });
        }
        Ok(res)
    }
}

#[async_trait]
impl WorkspaceSource for NotionClient {
    async fn fetch_page(&self, page_id: &str) -> Result<PageContent, SourceError> {
        let request = self.build_page_request(page_id)?;
        let res = self.execute(request).await?;
        let payload: Value = res
            .json()
            .await
            .map_err(|e| SourceError::InvalidResponse(e.to_string()))?;
        Ok(page_content_from_value(page_id, payload))
    }

    async fn list_published_page_ids(&self) -> Result<Vec<String>, SourceError> {
        let mut ids = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let request = self.build_query_request(cursor.as_deref())?;
            let res = self.execute(request).await?;
            let page: QueryResponse = res
                .json()
                .await
                .map_err(|e| SourceError::InvalidResponse(e.to_string()))?;
            ids.extend(page.results.into_iter().map(|r| r.id));
            if !page.has_more {
                return Ok(ids);
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => {
                    return Err(SourceError::InvalidResponse(
                        "has_more set without next_cursor".into(),
                    ))
                }
            }
        }
    }
}

/// Query body selecting published pages, oldest-edited first so a sweep
/// refreshes stale mirrors before recently touched ones.
pub fn build_published_query_body(published_property: &str, cursor: Option<&str>) -> Value {
    let mut body = json!({
        "filter": {
            "property": published_property,
            "checkbox": { "equals": true }
        },
        "sorts": [
            { "timestamp": "last_edited_time", "direction": "ascending" }
        ],
        "page_size": QUERY_PAGE_SIZE,
    });
    if let Some(cursor) = cursor {
        body["start_cursor"] = json!(cursor);
    }
    body
}

/// Assemble a [`PageContent`] from the raw page object. The payload is kept
/// verbatim; only the title and edit stamp are lifted out for listings.
pub fn page_content_from_value(requested_id: &str, payload: Value) -> PageContent {
    let external_id = payload
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or(requested_id)
        .to_string();
    let title = extract_title(&payload);
    let last_edited_at = payload
        .get("last_edited_time")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    PageContent {
        external_id,
        title,
        payload,
        last_edited_at,
    }
}

/// Pull the plain text of the page's title property, wherever it lives.
fn extract_title(payload: &Value) -> Option<String> {
    let properties = payload.get("properties")?.as_object()?;
    let title_prop = properties
        .values()
        .find(|p| p.get("type").and_then(Value::as_str) == Some("title"))?;
    let fragments = title_prop.get("title")?.as_array()?;
    let text: String = fragments
        .iter()
        .filter_map(|f| f.get("plain_text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[derive(Deserialize)]
struct QueryResponse {
    results: Vec<QueryResult>,
    has_more: bool,
    next_cursor: Option<String>,
}

#[derive(Deserialize)]
struct QueryResult {
    id: String,
}
