//! Notion record-store client: transport, error taxonomy, retry policy, and
//! property payload construction for the reconciliation engine.

use std::time::Duration;

use async_trait::async_trait;
use jobscout_core::JobRecord;
use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "jobscout-notion";

pub const API_BASE: &str = "https://api.notion.com/v1";
pub const API_VERSION: &str = "2022-06-28";

/// Per-attempt timeout for every API call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
/// Notion caps a single rich-text block at 2000 characters.
pub const RICH_TEXT_LIMIT: usize = 2000;
/// Multi-select payloads carry at most this many options.
pub const MULTI_SELECT_LIMIT: usize = 10;
const LIST_PAGE_SIZE: usize = 100;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing credential or unresolvable target collection. Fatal, aborts
    /// before any work.
    #[error("configuration error: {0}")]
    Config(String),
    /// Network or timeout failure. Retried up to the attempt cap.
    #[error("transport error: {0}")]
    Transport(String),
    /// The store asked us to back off. Retried after the mandated wait,
    /// within the same attempt budget as transport failures.
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
    /// The store rejected a property value. Reported per record, never
    /// retried.
    #[error("validation rejected: {0}")]
    Validation(String),
}

impl ApiError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::RateLimited(_))
    }
}

/// Exponential backoff between attempts of one API call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run one fallible API call with the retry policy. Rate-limit errors sleep
/// for the server-mandated duration instead of the backoff delay, but spend
/// the same attempt budget. Non-retryable errors return immediately.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut call: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0usize;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= policy.max_attempts || !err.is_retryable() {
                    return Err(err);
                }
                let wait = match &err {
                    ApiError::RateLimited(d) => *d,
                    _ => policy.delay_for_attempt(attempt - 1),
                };
                debug!(attempt, wait_ms = wait.as_millis() as u64, error = %err, "retrying call");
                tokio::time::sleep(wait).await;
            }
        }
    }
}

/// Contract the reconciliation engine consumes. Implemented by the HTTP
/// client and by in-memory stores in tests.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// One page of record ids in the collection plus the cursor for the next
    /// page, if any.
    async fn list_pages(
        &self,
        collection_id: &str,
        cursor: Option<String>,
    ) -> Result<(Vec<String>, Option<String>), ApiError>;

    async fn create_page(&self, collection_id: &str, properties: Value)
        -> Result<String, ApiError>;

    async fn update_page(&self, page_id: &str, properties: Value) -> Result<(), ApiError>;

    async fn archive_page(&self, page_id: &str) -> Result<(), ApiError>;

    /// Create a fresh collection carrying the tracker schema, returning its
    /// id. Used by interactive collection resolution.
    async fn provision_collection(&self) -> Result<String, ApiError>;
}

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub api_key: String,
    /// Parent page for `provision_collection`; optional until provisioning
    /// is actually requested.
    pub parent_page_id: Option<String>,
    pub timeout: Duration,
}

impl NotionConfig {
    /// Credentials come from the process environment; their absence is a
    /// fail-fast configuration error.
    pub fn from_env() -> Result<Self, ApiError> {
        let api_key = std::env::var("NOTION_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ApiError::Config("NOTION_API_KEY is not set".to_string()))?;
        Ok(Self {
            api_key,
            parent_page_id: std::env::var("NOTION_PARENT_PAGE_ID")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            timeout: DEFAULT_TIMEOUT,
        })
    }
}

#[derive(Debug)]
pub struct NotionClient {
    http: reqwest::Client,
    api_key: String,
    parent_page_id: Option<String>,
}

impl NotionClient {
    pub fn new(config: NotionConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::Config(format!("building http client: {e}")))?;
        Ok(Self {
            http,
            api_key: config.api_key,
            parent_page_id: config.parent_page_id,
        })
    }

    async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<Value, ApiError> {
        let url = format!("{API_BASE}/{endpoint}");
        let mut req = self
            .http
            .request(method, &url)
            .bearer_auth(&self.api_key)
            .header("Notion-Version", API_VERSION);
        if let Some(body) = body {
            req = req.json(&body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = resp.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
                .map(Duration::from_secs_f64)
                .unwrap_or(Duration::from_secs(1));
            return Err(ApiError::RateLimited(wait));
        }

        let payload: Value = resp
            .json()
            .await
            .map_err(|e| ApiError::Transport(format!("decoding response: {e}")))?;

        if status.is_success() {
            return Ok(payload);
        }

        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(ApiError::Config(format!("http {status}: {message}")))
        } else if status.is_client_error() {
            Err(ApiError::Validation(message))
        } else {
            Err(ApiError::Transport(format!("http {status}: {message}")))
        }
    }
}

#[async_trait]
impl RecordStore for NotionClient {
    async fn list_pages(
        &self,
        collection_id: &str,
        cursor: Option<String>,
    ) -> Result<(Vec<String>, Option<String>), ApiError> {
        let mut body = json!({ "page_size": LIST_PAGE_SIZE });
        if let Some(cursor) = cursor {
            body["start_cursor"] = Value::String(cursor);
        }
        let payload = self
            .request(
                Method::POST,
                &format!("databases/{collection_id}/query"),
                Some(body),
            )
            .await?;

        let ids = payload
            .get("results")
            .and_then(Value::as_array)
            .map(|results| {
                results
                    .iter()
                    .filter_map(|r| r.get("id").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let next = match payload.get("has_more").and_then(Value::as_bool) {
            Some(true) => payload
                .get("next_cursor")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        };
        Ok((ids, next))
    }

    async fn create_page(
        &self,
        collection_id: &str,
        properties: Value,
    ) -> Result<String, ApiError> {
        let body = json!({
            "parent": { "database_id": collection_id },
            "properties": properties,
        });
        let payload = self.request(Method::POST, "pages", Some(body)).await?;
        payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Validation("create response carried no page id".to_string()))
    }

    async fn update_page(&self, page_id: &str, properties: Value) -> Result<(), ApiError> {
        self.request(
            Method::PATCH,
            &format!("pages/{page_id}"),
            Some(json!({ "properties": properties })),
        )
        .await?;
        Ok(())
    }

    async fn archive_page(&self, page_id: &str) -> Result<(), ApiError> {
        self.request(
            Method::PATCH,
            &format!("pages/{page_id}"),
            Some(json!({ "archived": true })),
        )
        .await?;
        Ok(())
    }

    async fn provision_collection(&self) -> Result<String, ApiError> {
        let parent = self.parent_page_id.as_deref().ok_or_else(|| {
            ApiError::Config("NOTION_PARENT_PAGE_ID is required to create a collection".to_string())
        })?;

        let body = json!({
            "parent": { "type": "page_id", "page_id": parent },
            "icon": { "type": "emoji", "emoji": "📋" },
            "title": [{ "type": "text", "text": { "content": "Internship Tracker" } }],
        });
        let payload = self.request(Method::POST, "databases", Some(body)).await?;
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                ApiError::Validation("database create response carried no id".to_string())
            })?;

        // This API version only accepts the property schema via a follow-up
        // PATCH, not on the create call.
        self.request(
            Method::PATCH,
            &format!("databases/{id}"),
            Some(json!({ "properties": collection_schema() })),
        )
        .await?;
        debug!(collection_id = %id, "collection provisioned");
        Ok(id)
    }
}

/// Property schema a freshly provisioned collection carries.
fn collection_schema() -> Value {
    json!({
        "Salary": { "rich_text": {} },
        "City": { "rich_text": {} },
        "Company Size": { "select": { "options": [
            { "name": "20-99", "color": "green" },
            { "name": "100-499", "color": "blue" },
        ]}},
        "Funding Stage": { "select": { "options": [
            { "name": "Angel", "color": "pink" },
            { "name": "Series A", "color": "orange" },
            { "name": "Series B", "color": "yellow" },
            { "name": "Series C", "color": "green" },
            { "name": "Unfunded", "color": "gray" },
            { "name": "Bootstrapped", "color": "gray" },
        ]}},
        "JD Quality": { "select": { "options": [
            { "name": "A", "color": "green" },
            { "name": "B", "color": "blue" },
            { "name": "C", "color": "yellow" },
            { "name": "D", "color": "red" },
            { "name": "F", "color": "gray" },
        ]}},
        "Status": { "select": { "options": [
            { "name": "pending", "color": "gray" },
            { "name": "applied", "color": "blue" },
            { "name": "interviewing", "color": "orange" },
            { "name": "offered", "color": "green" },
            { "name": "rejected", "color": "red" },
            { "name": "ghosted", "color": "brown" },
        ]}},
        "Tags": { "multi_select": { "options": [] } },
        "Source": { "rich_text": {} },
        "Link": { "url": {} },
        "Collected": { "date": {} },
        "JD Summary": { "rich_text": {} },
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Title,
    RichText,
    Select,
    MultiSelect,
    Url,
    Date,
}

/// Record field → (property name, value kind). This table alone drives
/// payload construction.
pub const PROPERTY_MAP: &[(&str, &str, ValueKind)] = &[
    ("company", "Name", ValueKind::Title),
    ("salary", "Salary", ValueKind::RichText),
    ("location", "City", ValueKind::RichText),
    ("company_size", "Company Size", ValueKind::Select),
    ("funding_stage", "Funding Stage", ValueKind::Select),
    ("jd_quality", "JD Quality", ValueKind::Select),
    ("status", "Status", ValueKind::Select),
    ("tags", "Tags", ValueKind::MultiSelect),
    ("url", "Link", ValueKind::Url),
    ("collected_at", "Collected", ValueKind::Date),
    ("jd_summary", "JD Summary", ValueKind::RichText),
];

fn scalar_value(record: &JobRecord, field: &str) -> String {
    match field {
        "company" => record.company.clone(),
        "salary" => record.salary.clone(),
        "location" => record.location.clone(),
        "company_size" => record.company_size.clone(),
        "funding_stage" => record.funding_stage.clone(),
        "jd_quality" => record
            .jd_quality
            .map(|g| g.as_str().to_string())
            .unwrap_or_default(),
        "status" => record.status.as_str().to_string(),
        "url" => record.url.clone(),
        "collected_at" => record.collected_at.clone(),
        "jd_summary" => record.jd_summary.clone(),
        _ => String::new(),
    }
}

fn truncate_chars(s: &str, limit: usize) -> String {
    s.chars().take(limit).collect()
}

/// Build the full property payload for one record. Updates send this whole
/// set as an overwrite, not a merge. The title property is always included,
/// even when empty, since it is the primary key column; every other empty
/// value is omitted. Select values go out verbatim: an unmatched option is
/// the store's ValidationError to raise, not ours.
pub fn build_properties(record: &JobRecord) -> Value {
    let mut props = Map::new();
    for &(field, name, kind) in PROPERTY_MAP {
        match kind {
            ValueKind::Title => {
                let text = truncate_chars(&scalar_value(record, field), RICH_TEXT_LIMIT);
                props.insert(
                    name.to_string(),
                    json!({ "title": [{ "text": { "content": text } }] }),
                );
            }
            ValueKind::RichText => {
                let value = scalar_value(record, field);
                if !value.is_empty() {
                    let text = truncate_chars(&value, RICH_TEXT_LIMIT);
                    props.insert(
                        name.to_string(),
                        json!({ "rich_text": [{ "text": { "content": text } }] }),
                    );
                }
            }
            ValueKind::Select => {
                let value = scalar_value(record, field);
                if !value.is_empty() {
                    props.insert(name.to_string(), json!({ "select": { "name": value } }));
                }
            }
            ValueKind::MultiSelect => {
                if !record.tags.is_empty() {
                    let options: Vec<Value> = record
                        .tags
                        .iter()
                        .take(MULTI_SELECT_LIMIT)
                        .map(|t| json!({ "name": t }))
                        .collect();
                    props.insert(name.to_string(), json!({ "multi_select": options }));
                }
            }
            ValueKind::Url => {
                let value = scalar_value(record, field);
                if !value.is_empty() {
                    props.insert(name.to_string(), json!({ "url": value }));
                }
            }
            ValueKind::Date => {
                let value = scalar_value(record, field);
                if !value.is_empty() {
                    props.insert(name.to_string(), json!({ "date": { "start": value } }));
                }
            }
        }
    }
    Value::Object(props)
}

/// Accept a canonical collection id or any share-link string containing one,
/// and normalize it into dashed form. Returns None when no 32-hex-digit run
/// is present.
pub fn extract_collection_id(raw: &str) -> Option<String> {
    let cleaned: Vec<char> = raw
        .to_ascii_lowercase()
        .chars()
        .filter(|c| *c != '-')
        .collect();

    let mut run = 0usize;
    for (i, c) in cleaned.iter().enumerate() {
        if c.is_ascii_hexdigit() {
            run += 1;
            if run == 32 {
                let hex: String = cleaned[i + 1 - 32..=i].iter().collect();
                return Some(format!(
                    "{}-{}-{}-{}-{}",
                    &hex[..8],
                    &hex[8..12],
                    &hex[12..16],
                    &hex[16..20],
                    &hex[20..]
                ));
            }
        } else {
            run = 0;
        }
    }
    None
}
