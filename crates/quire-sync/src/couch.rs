//! CouchDB-style HTTP change feed
//!
//! Uses two endpoints of the remote database:
//!
//! * `GET {db}/_all_docs?include_docs=true&update_seq=true&startkey=..&endkey=..`
//!   for the full import
//! * `GET {db}/_changes?include_docs=true&since=..&limit=..` for incremental
//!   pages
//!
//! Sequence values may be numbers or strings depending on the server; both
//! are carried as [`SyncCursor`] and sent back unchanged.

use crate::feed::{ChangeFeed, FeedBatch, FeedRecord};
use async_trait::async_trait;
use quire_common::config::RemoteConfig;
use quire_common::{Error, KeyRange, Result, SyncCursor};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// `_all_docs` response
#[derive(Debug, Deserialize)]
struct AllDocsResponse {
    #[serde(default)]
    rows: Vec<AllDocsRow>,
    #[serde(default)]
    update_seq: Option<SyncCursor>,
}

#[derive(Debug, Deserialize)]
struct AllDocsRow {
    id: String,
    #[serde(default)]
    doc: Option<Value>,
    #[serde(default)]
    value: Option<RowValue>,
}

#[derive(Debug, Deserialize)]
struct RowValue {
    #[serde(default)]
    deleted: bool,
}

/// `_changes` response
#[derive(Debug, Deserialize)]
struct ChangesResponse {
    #[serde(default)]
    results: Vec<ChangeRow>,
    #[serde(default)]
    last_seq: Option<SyncCursor>,
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    id: String,
    #[serde(default)]
    deleted: bool,
    #[serde(default)]
    doc: Option<Value>,
}

/// Parse an `_all_docs` body
pub fn parse_all_docs(body: &str) -> Result<FeedBatch> {
    let response: AllDocsResponse = serde_json::from_str(body)
        .map_err(|e| Error::Deserialization(format!("_all_docs response: {e}")))?;
    let records = response
        .rows
        .into_iter()
        .map(|row| FeedRecord {
            deleted: row.value.is_some_and(|v| v.deleted),
            id: row.id,
            doc: row.doc.filter(|doc| !doc.is_null()),
        })
        .collect();
    Ok(FeedBatch {
        records,
        cursor: response.update_seq,
    })
}

/// Parse a `_changes` body
pub fn parse_changes(body: &str) -> Result<FeedBatch> {
    let response: ChangesResponse = serde_json::from_str(body)
        .map_err(|e| Error::Deserialization(format!("_changes response: {e}")))?;
    let records = response
        .results
        .into_iter()
        .map(|row| FeedRecord {
            id: row.id,
            deleted: row.deleted,
            doc: row.doc.filter(|doc| !doc.is_null()),
        })
        .collect();
    Ok(FeedBatch {
        records,
        cursor: response.last_seq,
    })
}

/// Change feed of a remote CouchDB-compatible database
pub struct CouchFeed {
    db_url: String,
    http_client: reqwest::Client,
}

impl CouchFeed {
    /// Create a feed for the database at `db_url`
    pub fn new(db_url: impl Into<String>, timeout_ms: u64) -> Result<Self> {
        let db_url = db_url.into().trim_end_matches('/').to_string();
        if db_url.is_empty() {
            return Err(Error::Configuration("remote database URL is empty".into()));
        }
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        Ok(Self {
            db_url,
            http_client,
        })
    }

    /// Create a feed from the `remote` configuration section
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| Error::Configuration("remote.url is not set".into()))?;
        Self::new(url, config.timeout_ms)
    }

    /// Database URL without trailing slash
    #[must_use]
    pub fn db_url(&self) -> &str {
        &self.db_url
    }

    async fn get(&self, endpoint: &str, query: &[(&str, String)]) -> Result<String> {
        let url = format!("{}/{}", self.db_url, endpoint);
        debug!("GET {} {:?}", url, query);

        let response = self
            .http_client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout
                } else {
                    Error::SyncTransport(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::SyncTransport(format!(
                "{endpoint} returned status {status}: {body}"
            )));
        }

        response.text().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout
            } else {
                Error::SyncTransport(e.to_string())
            }
        })
    }
}

/// CouchDB expects JSON-encoded keys in `startkey`/`endkey`
fn json_key(key: &str) -> String {
    Value::String(key.to_string()).to_string()
}

#[async_trait]
impl ChangeFeed for CouchFeed {
    fn name(&self) -> &str {
        "couchdb"
    }

    async fn fetch_all(&self, range: &KeyRange) -> Result<FeedBatch> {
        let mut query = vec![
            ("include_docs", "true".to_string()),
            ("update_seq", "true".to_string()),
        ];
        if let Some(start) = &range.start {
            query.push(("startkey", json_key(start)));
        }
        if let Some(end) = &range.end {
            query.push(("endkey", json_key(end)));
        }
        let body = self.get("_all_docs", &query).await?;
        parse_all_docs(&body)
    }

    async fn changes_since(&self, since: Option<&SyncCursor>, limit: usize) -> Result<FeedBatch> {
        let mut query = vec![
            ("include_docs", "true".to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(since) = since {
            query.push(("since", since.as_query_value()));
        }
        let body = self.get("_changes", &query).await?;
        parse_changes(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_all_docs() {
        let body = r#"{
            "total_rows": 3, "offset": 0, "update_seq": 42,
            "rows": [
                {"id": "A", "key": "A", "value": {"rev": "1-a"},
                 "doc": {"_id": "A", "_rev": "1-a", "title": "x"}},
                {"id": "B", "key": "B", "value": {"rev": "2-b", "deleted": true}, "doc": null}
            ]
        }"#;
        let batch = parse_all_docs(body).unwrap();
        assert_eq!(batch.cursor, Some(SyncCursor::Seq(42)));
        assert_eq!(batch.records.len(), 2);
        assert_eq!(
            batch.records[0].doc,
            Some(json!({"_id": "A", "_rev": "1-a", "title": "x"}))
        );
        assert!(!batch.records[0].deleted);
        assert!(batch.records[1].deleted);
        assert!(batch.records[1].doc.is_none());
    }

    #[test]
    fn test_parse_changes_with_string_seq() {
        let body = r#"{
            "results": [
                {"seq": "7-g1AAAA", "id": "A", "changes": [{"rev": "3-c"}],
                 "doc": {"_id": "A", "text": "hello"}},
                {"seq": "8-g1AAAB", "id": "B", "changes": [{"rev": "4-d"}], "deleted": true}
            ],
            "last_seq": "8-g1AAAB", "pending": 0
        }"#;
        let batch = parse_changes(body).unwrap();
        assert_eq!(batch.cursor, Some(SyncCursor::Token("8-g1AAAB".into())));
        assert_eq!(batch.records[0].id, "A");
        assert_eq!(batch.records[1], FeedRecord::tombstone("B"));
    }

    #[test]
    fn test_parse_empty_changes() {
        let batch = parse_changes(r#"{"results": [], "last_seq": 12}"#).unwrap();
        assert!(batch.records.is_empty());
        assert_eq!(batch.cursor, Some(SyncCursor::Seq(12)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_changes("<html>"),
            Err(Error::Deserialization(_))
        ));
        assert!(matches!(
            parse_all_docs(r#"{"rows": 5}"#),
            Err(Error::Deserialization(_))
        ));
    }

    #[test]
    fn test_new_normalizes_url() {
        let feed = CouchFeed::new("http://localhost:5984/quire/", 1000).unwrap();
        assert_eq!(feed.db_url(), "http://localhost:5984/quire");
        assert!(matches!(
            CouchFeed::new("", 1000),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            CouchFeed::from_config(&RemoteConfig::default()),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_json_key() {
        assert_eq!(json_key("topic:a"), "\"topic:a\"");
    }
}
