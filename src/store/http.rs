//! Notion-like REST store.
//!
//! # Endpoints
//! ```text
//! POST  /v1/databases/{collection}/query   filter on the key property, one page per call
//! POST  /v1/pages                          create under parent database
//! PATCH /v1/pages/{id}                     update properties
//! GET   /v1/users/me                       reachability
//! ```
//!
//! Status mapping follows `SyncError::from_status`; `Retry-After` (seconds
//! or HTTP-date) is carried on 429/5xx errors.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::StoreConfig;
use crate::error::{SyncError, SyncResult, TransientCause};
use crate::store::{QueryPage, Record, RecordStore, RemoteRecord};

const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct Page {
    id: String,
    #[serde(default)]
    properties: Record,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<Page>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

impl From<Page> for RemoteRecord {
    fn from(page: Page) -> Self {
        Self {
            id: page.id,
            fields: page.properties,
        }
    }
}

/// Bearer-token HTTP client for the downstream store.
#[derive(Clone)]
pub struct HttpRecordStore {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
}

impl HttpRecordStore {
    pub fn new(config: &StoreConfig, token: &str, timeout: Duration) -> SyncResult<Self> {
        url::Url::parse(&config.base_url)
            .map_err(|e| SyncError::validation("store.base_url", e.to_string()))?;

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| SyncError::validation("store.token", "token contains invalid header characters"))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            "notion-version",
            HeaderValue::from_str(&config.api_version)
                .map_err(|_| SyncError::validation("store.api_version", "invalid header value"))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::transient("store.init", TransientCause::Network, e.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size.clamp(1, 100),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path)
    }

    async fn send(&self, operation: &str, request: reqwest::RequestBuilder) -> SyncResult<Value> {
        let response = request.send().await.map_err(|e| transport_error(operation, e))?;
        let status = response.status();

        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(SyncError::from_status(operation, status.as_u16(), body, retry_after));
        }

        let text = response.text().await.map_err(|e| transport_error(operation, e))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// `Retry-After` as delta-seconds or an HTTP-date. A date in the past means
/// no wait.
fn parse_retry_after(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?;
    Some((at.with_timezone(&Utc) - Utc::now()).to_std().unwrap_or(Duration::ZERO))
}

fn transport_error(operation: &str, e: reqwest::Error) -> SyncError {
    let cause = if e.is_timeout() {
        TransientCause::Timeout
    } else {
        TransientCause::Network
    };
    SyncError::transient(operation, cause, e.to_string())
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn query_page(
        &self,
        collection: &str,
        key_field: &str,
        key: &str,
        cursor: Option<&str>,
    ) -> SyncResult<QueryPage> {
        let operation = format!("{}.query", collection);
        let mut body = json!({
            "filter": { "property": key_field, "rich_text": { "equals": key } },
            "page_size": self.page_size,
        });
        if let Some(c) = cursor {
            body["start_cursor"] = Value::String(c.to_string());
        }

        let value = self
            .send(&operation, self.client.post(self.url(&format!("databases/{}/query", collection))).json(&body))
            .await?;
        let page: QueryResponse = serde_json::from_value(value)?;

        if let Some(first) = page.results.into_iter().next() {
            return Ok(QueryPage {
                found: Some(first.into()),
                next_cursor: None,
            });
        }
        Ok(QueryPage {
            found: None,
            next_cursor: page.next_cursor.filter(|_| page.has_more),
        })
    }

    async fn create(&self, collection: &str, fields: &Record) -> SyncResult<RemoteRecord> {
        let operation = format!("{}.create", collection);
        let body = json!({
            "parent": { "database_id": collection },
            "properties": fields,
        });
        let value = self.send(&operation, self.client.post(self.url("pages")).json(&body)).await?;
        let page: Page = serde_json::from_value(value)?;
        Ok(page.into())
    }

    async fn update(&self, collection: &str, id: &str, fields: &Record) -> SyncResult<RemoteRecord> {
        let operation = format!("{}.update", collection);
        let body = json!({ "properties": fields });
        let value = self
            .send(&operation, self.client.patch(self.url(&format!("pages/{}", id))).json(&body))
            .await?;
        let page: Page = serde_json::from_value(value)?;
        Ok(page.into())
    }

    async fn ping(&self) -> SyncResult<()> {
        self.send("store.ping", self.client.get(self.url("users/me"))).await.map(|_| ())
    }
}

impl std::fmt::Debug for HttpRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRecordStore")
            .field("base_url", &self.base_url)
            .field("page_size", &self.page_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_forms() {
        assert_eq!(parse_retry_after(" 7 "), Some(Duration::from_secs(7)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), Some(Duration::ZERO));
        assert_eq!(parse_retry_after("soon"), None);

        let later = (Utc::now() + chrono::Duration::seconds(120)).to_rfc2822();
        let wait = parse_retry_after(&later).unwrap();
        assert!(wait > Duration::from_secs(100) && wait <= Duration::from_secs(120));
    }
}
