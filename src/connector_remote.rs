//! Remote workspace connector.
//!
//! Talks to a hosted database service over its JSON HTTP API:
//!
//! - `POST {base}/databases/{id}/query`, paginated with `start_cursor`,
//!   `has_more` and `next_cursor`, for pulls;
//! - `PATCH {base}/pages/{id}` to update an existing page, falling back to
//!   `POST {base}/pages` with a `database_id` parent when the page does not
//!   exist, for pushes.
//!
//! Each configured table maps to one remote database id. Pages are
//! normalized as `id` → record id, `last_edited_time` → `last_modified`,
//! `properties` → `data`; property values keep their native shape.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (other) → fail immediately
//! - Network errors and client timeouts → retry
//!
//! Backoff doubles from `backoff_base_ms` and is capped at 32× the base.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::config::RemoteConnectorConfig;
use crate::connector::{with_backoff, Attempt, Connector, IdRemap, PushReport, RetryPolicy};
use crate::error::{RecordError, Result, SyncError};
use crate::models::{CanonicalRecord, Snapshot, Source};

/// One page of a database query response.
#[derive(Debug, Deserialize)]
struct QueryPage {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

pub struct RemoteConnector {
    name: String,
    client: reqwest::Client,
    base_url: String,
    api_version: String,
    token: String,
    tables: BTreeMap<String, String>,
    page_size: u32,
    retry: RetryPolicy,
}

impl RemoteConnector {
    /// Build a connector, reading the API token from the environment
    /// variable named by `token_env`.
    pub fn new(config: &RemoteConnectorConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .map_err(|_| SyncError::Config(format!("{} not set", config.token_env)))?;
        Self::with_token(config, token)
    }

    pub fn with_token(config: &RemoteConnectorConfig, token: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            name: "remote".to_string(),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            token: token.into(),
            tables: config.tables.clone(),
            page_size: config.page_size,
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.backoff_base_ms),
            ),
        })
    }

    /// Send one JSON request with retry. With `missing_ok`, a 404 yields
    /// `Ok(None)` instead of an error.
    async fn call(
        &self,
        method: Method,
        url: &str,
        body: &Value,
        missing_ok: bool,
    ) -> Result<Option<Value>> {
        with_backoff(&self.name, self.retry, || {
            let method = method.clone();
            async move {
                let response = self
                    .client
                    .request(method, url)
                    .bearer_auth(&self.token)
                    .header("Notion-Version", &self.api_version)
                    .json(body)
                    .send()
                    .await
                    .map_err(|e| Attempt::Retry(e.to_string()))?;

                let status = response.status();
                if status.is_success() {
                    return response
                        .json::<Value>()
                        .await
                        .map(Some)
                        .map_err(|e| Attempt::Fatal(format!("invalid response body: {}", e)));
                }
                if missing_ok && status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }

                let text = response.text().await.unwrap_or_default();
                Err(classify_status(status, &text))
            }
        })
        .await
    }

    async fn query_database(&self, database_id: &str, since: Option<&str>) -> Result<Vec<Value>> {
        let url = format!("{}/databases/{}/query", self.base_url, database_id);
        let mut results = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let body = query_body(self.page_size, cursor.as_deref(), since);
            let response = self
                .call(Method::POST, &url, &body, false)
                .await?
                .unwrap_or(Value::Null);
            let page: QueryPage = serde_json::from_value(response).map_err(|e| {
                SyncError::unavailable(&self.name, format!("malformed query response: {}", e))
            })?;

            debug!(database_id, fetched = page.results.len(), "query page");
            results.extend(page.results);

            match (page.has_more, page.next_cursor) {
                (false, _) => break,
                (true, Some(next)) => cursor = Some(next),
                (true, None) => {
                    return Err(SyncError::unavailable(
                        &self.name,
                        format!("database {}: has_more without next_cursor", database_id),
                    ))
                }
            }
        }

        Ok(results)
    }

    async fn pull_tables(&self, table: Option<&str>, since: Option<&str>) -> Result<Snapshot> {
        let names: Vec<String> = match table {
            Some(t) => vec![t.to_string()],
            None => self.tables.keys().cloned().collect(),
        };

        let mut snapshot = Snapshot::new();
        for name in names {
            // A table with no mapped database exists only on the other side.
            let records = match self.tables.get(&name) {
                Some(database_id) => self
                    .query_database(database_id, since)
                    .await?
                    .iter()
                    .filter_map(normalize_page)
                    .collect(),
                None => Vec::new(),
            };
            snapshot.insert(name, records);
        }
        Ok(snapshot)
    }

    /// Update the page, or create it when the service does not know the id.
    /// Returns the service-assigned id of a created page when it differs
    /// from the record id.
    async fn push_one(&self, database_id: &str, record: &CanonicalRecord) -> Result<Option<String>> {
        let update_url = format!("{}/pages/{}", self.base_url, record.id());
        let update = json!({ "properties": record.data() });
        if self
            .call(Method::PATCH, &update_url, &update, true)
            .await?
            .is_some()
        {
            return Ok(None);
        }

        let create_url = format!("{}/pages", self.base_url);
        let create = json!({
            "parent": { "database_id": database_id },
            "properties": record.data(),
        });
        let created = self
            .call(Method::POST, &create_url, &create, false)
            .await?
            .unwrap_or(Value::Null);
        match created.get("id").and_then(Value::as_str) {
            Some(remote_id) if !remote_id.is_empty() && remote_id != record.id() => {
                debug!(record_id = record.id(), remote_id, "page created under a new id");
                Ok(Some(remote_id.to_string()))
            }
            Some(_) => Ok(None),
            None => Err(SyncError::unavailable(
                &self.name,
                format!("create of '{}' returned no page id", record.id()),
            )),
        }
    }
}

#[async_trait]
impl Connector for RemoteConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> Source {
        Source::Remote
    }

    async fn tables(&self) -> Result<Vec<String>> {
        Ok(self.tables.keys().cloned().collect())
    }

    async fn pull(&self, table: Option<&str>) -> Result<Snapshot> {
        self.pull_tables(table, None).await
    }

    /// Filters on the service side with a `last_edited_time` `after` clause.
    async fn pull_since(&self, table: Option<&str>, since: &str) -> Result<Snapshot> {
        self.pull_tables(table, Some(since)).await
    }

    async fn push(&self, records: &[CanonicalRecord], table: &str) -> Result<PushReport> {
        let database_id = self.tables.get(table).ok_or_else(|| {
            SyncError::unavailable(
                &self.name,
                format!("no remote database mapped for table '{}'", table),
            )
        })?;

        let mut report = PushReport::new(&self.name, table, records.len());
        for record in records {
            match self.push_one(database_id, record).await {
                Ok(Some(remote_id)) => report.remapped.push(IdRemap {
                    from: record.id().to_string(),
                    to: remote_id,
                }),
                Ok(None) => {}
                Err(e) => {
                    warn!(table, record_id = record.id(), error = %e, "remote push failed");
                    report.record_failure(RecordError::new(record.id(), e.to_string()));
                }
            }
        }
        if !report.remapped.is_empty() {
            info!(table, created = report.remapped.len(), "remote assigned ids to created pages");
        }
        Ok(report)
    }
}

/// Retry on rate limiting and server errors; everything else is fatal.
fn classify_status(status: StatusCode, body: &str) -> Attempt {
    let reason = format!("HTTP {}: {}", status, body);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Attempt::Retry(reason)
    } else {
        Attempt::Fatal(reason)
    }
}

fn query_body(page_size: u32, cursor: Option<&str>, since: Option<&str>) -> Value {
    let mut body = Map::new();
    body.insert("page_size".into(), json!(page_size));
    if let Some(cursor) = cursor {
        body.insert("start_cursor".into(), json!(cursor));
    }
    if let Some(since) = since {
        body.insert(
            "filter".into(),
            json!({
                "timestamp": "last_edited_time",
                "last_edited_time": { "after": since },
            }),
        );
    }
    Value::Object(body)
}

/// Convert one page object into a record. Pages without an id are dropped.
fn normalize_page(page: &Value) -> Option<CanonicalRecord> {
    let id = page.get("id").and_then(Value::as_str).filter(|s| !s.is_empty())?;
    let last_modified = page
        .get("last_edited_time")
        .and_then(Value::as_str)
        .map(str::to_string);
    let data = page
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    Some(CanonicalRecord::new(id, Source::Remote, last_modified, data))
}
