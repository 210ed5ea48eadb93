//! Remote change-feed abstraction
//!
//! A feed exposes two reads: the full current contents of a key range, and
//! the changes made after a cursor. Both return a cursor the next request
//! can resume from. Cursors are opaque and passed back verbatim.

use async_trait::async_trait;
use quire_common::{KeyRange, Result, SyncCursor};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One remote document or tombstone
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    /// Remote document id, becomes the local topic key
    pub id: String,
    /// Set for tombstones
    #[serde(default)]
    pub deleted: bool,
    /// Document body, absent for most tombstones
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

impl FeedRecord {
    /// Upserted document
    pub fn upsert(id: impl Into<String>, doc: Value) -> Self {
        Self {
            id: id.into(),
            deleted: false,
            doc: Some(doc),
        }
    }

    /// Deleted document
    pub fn tombstone(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted: true,
            doc: None,
        }
    }
}

/// Records of one feed response and the position to resume from
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeedBatch {
    pub records: Vec<FeedRecord>,
    /// Position after the last record; `None` when the remote reports none
    pub cursor: Option<SyncCursor>,
}

/// Source of remote changes
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Feed name for logging
    fn name(&self) -> &str;

    /// Every live document inside `range`, with the feed position it reflects
    async fn fetch_all(&self, range: &KeyRange) -> Result<FeedBatch>;

    /// Up to `limit` changes after `since` (from the start when `None`)
    async fn changes_since(&self, since: Option<&SyncCursor>, limit: usize) -> Result<FeedBatch>;
}
