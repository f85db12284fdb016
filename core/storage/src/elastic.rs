//! Elasticsearch store adapter.
//!
//! Plays the role of the secondary, searchable store. Each record is one
//! document in a single index, keyed by the record identity.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::adapter::StoreAdapter;
use mirrorsync_common::{
    Change, ChangeSet, Error, FieldValue, Fields, RecordId, Result, SchemaMapping,
};

/// Connection settings for an Elasticsearch index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElasticConfig {
    /// Cluster base URL, e.g. `http://localhost:9200`.
    pub url: String,
    /// Index holding the records.
    pub index: String,
    /// Documents requested per search page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Refresh the index after each write so the next search sees it.
    #[serde(default = "default_refresh")]
    pub refresh: bool,
    /// Keyword field used to order records sharing a timestamp.
    /// Defaults to the `.keyword` subfield dynamic mapping adds to the identity.
    #[serde(default)]
    pub tiebreak_field: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_page_size() -> usize {
    500
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_refresh() -> bool {
    true
}

impl ElasticConfig {
    /// Create a configuration with default paging, timeout and refresh.
    pub fn new(url: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            index: index.into(),
            page_size: default_page_size(),
            timeout_secs: default_timeout_secs(),
            refresh: default_refresh(),
            tiebreak_field: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Map<String, Value>,
    #[serde(default)]
    sort: Option<Vec<Value>>,
}

/// Elasticsearch store adapter.
pub struct ElasticStore {
    name: String,
    schema: SchemaMapping,
    config: ElasticConfig,
    base: Url,
    http: Client,
}

impl ElasticStore {
    /// Create a new adapter. No request is made until the first fetch.
    ///
    /// # Errors
    /// - `Config` for an invalid schema, URL, page size or index name
    pub fn new(config: ElasticConfig, schema: SchemaMapping) -> Result<Self> {
        schema.validate()?;

        if config.page_size == 0 {
            return Err(Error::Config("Elasticsearch pageSize must be > 0".to_string()));
        }
        if config.index.is_empty() || config.index.contains('/') {
            return Err(Error::Config(format!(
                "Invalid Elasticsearch index: '{}'",
                config.index
            )));
        }

        let mut raw = config.url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)
            .map_err(|e| Error::Config(format!("Invalid Elasticsearch URL '{}': {}", config.url, e)))?;

        let http = Client::builder()
            .user_agent("MirrorSync/0.1")
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(url = %base, index = %config.index, "Elasticsearch store configured");

        Ok(Self {
            name: format!("elasticsearch:{}", config.index),
            schema,
            config,
            base,
            http,
        })
    }

    fn search_url(&self) -> Result<Url> {
        self.base
            .join(&format!("{}/_search", self.config.index))
            .map_err(|e| Error::Config(format!("Invalid search URL: {}", e)))
    }

    fn document_url(&self, id: &RecordId) -> Result<Url> {
        let encoded = utf8_percent_encode(id.as_str(), NON_ALPHANUMERIC);
        let mut url = self
            .base
            .join(&format!("{}/_doc/{}", self.config.index, encoded))
            .map_err(|e| Error::Config(format!("Invalid document URL: {}", e)))?;
        if self.config.refresh {
            url.query_pairs_mut().append_pair("refresh", "true");
        }
        Ok(url)
    }

    /// Sort key that breaks timestamp ties. Text fields cannot be sorted on.
    fn tiebreak_field(&self) -> String {
        self.config
            .tiebreak_field
            .clone()
            .unwrap_or_else(|| format!("{}.keyword", self.schema.identity_field))
    }

    /// Range query for one page, sorted so `search_after` can walk the window.
    fn search_body(&self, cutoff: DateTime<Utc>, search_after: Option<&[Value]>) -> Value {
        let ts = &self.schema.timestamp_field;
        let tiebreak = self.tiebreak_field();
        let mut body = json!({
            "size": self.config.page_size,
            "query": {
                "range": {
                    ts: { "gt": cutoff.timestamp_millis(), "format": "epoch_millis" }
                }
            },
            "sort": [
                { ts: { "order": "asc" } },
                { tiebreak: { "order": "asc" } }
            ]
        });

        if let Some(after) = search_after {
            body["search_after"] = Value::Array(after.to_vec());
        }

        body
    }

    fn hit_to_change(&self, hit: &Hit) -> Result<Change> {
        let id = match hit.source.get(&self.schema.identity_field) {
            Some(value) => RecordId::from_json(value)?,
            None => RecordId::new(hit.id.clone())?,
        };

        let raw_ts = hit.source.get(&self.schema.timestamp_field).ok_or_else(|| {
            Error::InvalidInput(format!(
                "Document {} has no '{}' field",
                id, self.schema.timestamp_field
            ))
        })?;
        let modified_at = parse_timestamp(raw_ts)?;

        let mut fields = Fields::new();
        for field in &self.schema.mirrored_fields {
            let value = match hit.source.get(field) {
                Some(v) => FieldValue::from_json(v)?,
                None => FieldValue::Null,
            };
            fields.insert(field.clone(), value);
        }

        Ok(Change::with_fields(id, modified_at, fields))
    }

    /// Full document for a record: identity, timestamp and every mirrored field.
    fn document(&self, change: &Change) -> Value {
        let mut doc = Map::new();
        doc.insert(
            self.schema.identity_field.clone(),
            Value::String(change.id().to_string()),
        );
        doc.insert(
            self.schema.timestamp_field.clone(),
            Value::String(
                change
                    .modified_at()
                    .to_rfc3339_opts(SecondsFormat::Millis, true),
            ),
        );
        for field in &self.schema.mirrored_fields {
            let value = change.field(field).map(FieldValue::to_json).unwrap_or(Value::Null);
            doc.insert(field.clone(), value);
        }
        Value::Object(doc)
    }

    async fn fetch_page(
        &self,
        url: &Url,
        cutoff: DateTime<Utc>,
        search_after: Option<&[Value]>,
    ) -> Result<Vec<Hit>> {
        let mut request = self
            .http
            .post(url.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .json(&self.search_body(cutoff, search_after));
        if let Some(user) = &self.config.username {
            request = request.basic_auth(user, self.config.password.as_deref());
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Fetch {
                store: self.name.clone(),
                message: format!("Search request failed: {}", e),
                transient: is_transient_request_error(&e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Fetch {
                store: self.name.clone(),
                message: format!("Search returned {} - {}", status, body),
                transient: is_transient_status(status),
            });
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| Error::fetch_fatal(&self.name, format!("Failed to parse search response: {}", e)))?;

        Ok(parsed.hits.hits)
    }
}

#[async_trait]
impl StoreAdapter for ElasticStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &SchemaMapping {
        &self.schema
    }

    async fn fetch_changes_since(&self, cutoff: DateTime<Utc>) -> Result<ChangeSet> {
        let url = self.search_url()?;
        let mut changes = Vec::new();
        let mut search_after: Option<Vec<Value>> = None;

        loop {
            let hits = self.fetch_page(&url, cutoff, search_after.as_deref()).await?;
            let page_len = hits.len();

            for hit in &hits {
                let change = self
                    .hit_to_change(hit)
                    .map_err(|e| Error::fetch_fatal(&self.name, e.to_string()))?;
                changes.push(change);
            }

            if page_len < self.config.page_size {
                break;
            }

            match hits.last().and_then(|h| h.sort.clone()) {
                Some(sort) => search_after = Some(sort),
                None => {
                    return Err(Error::fetch_fatal(
                        &self.name,
                        "Search hits carry no sort values; cannot page further",
                    ))
                }
            }
        }

        debug!(store = %self.name, count = changes.len(), "Fetched changes from Elasticsearch");
        Ok(changes.into())
    }

    async fn upsert(&self, change: &Change) -> Result<()> {
        let url = self.document_url(change.id())?;
        debug!(store = %self.name, id = %change.id(), "Indexing document");

        let mut request = self.http.put(url).json(&self.document(change));
        if let Some(user) = &self.config.username {
            request = request.basic_auth(user, self.config.password.as_deref());
        }

        let response = request.send().await.map_err(|e| Error::Write {
            store: self.name.clone(),
            id: change.id().to_string(),
            message: format!("Index request failed: {}", e),
            transient: is_transient_request_error(&e),
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::Write {
                store: self.name.clone(),
                id: change.id().to_string(),
                message: format!("Index returned {} - {}", status, body),
                transient: is_transient_status(status),
            })
        }
    }
}

/// Accepts RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS[.fff]` read as UTC, or epoch milliseconds.
fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    let parsed = match value {
        Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            })
            .or_else(|| {
                s.parse::<i64>()
                    .ok()
                    .and_then(DateTime::<Utc>::from_timestamp_millis)
            }),
        _ => None,
    };

    parsed.ok_or_else(|| Error::InvalidInput(format!("Unrecognised timestamp: {}", value)))
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

fn is_transient_request_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
