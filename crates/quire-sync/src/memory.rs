//! In-process change feed
//!
//! An append-only change log with numeric sequences. Like CouchDB,
//! `changes_since` reports only the latest change of each document, at that
//! change's sequence. Clones share the log, so a test can keep appending
//! while a sync engine owns another handle.

use crate::feed::{ChangeFeed, FeedBatch, FeedRecord};
use async_trait::async_trait;
use parking_lot::RwLock;
use quire_common::{Error, KeyRange, Result, SyncCursor};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default)]
struct ChangeLog {
    /// `(seq, record)` in sequence order
    changes: Vec<(u64, FeedRecord)>,
    /// Transport error every request fails with while set
    unavailable: Option<String>,
    requests: usize,
}

impl ChangeLog {
    fn check_available(&mut self) -> Result<()> {
        self.requests += 1;
        match &self.unavailable {
            Some(reason) => Err(Error::SyncTransport(reason.clone())),
            None => Ok(()),
        }
    }

    fn last_seq(&self) -> u64 {
        self.changes.last().map_or(0, |(seq, _)| *seq)
    }

    /// Latest change of every document: id -> (seq, record)
    fn latest(&self) -> BTreeMap<&str, (u64, &FeedRecord)> {
        let mut latest = BTreeMap::new();
        for (seq, record) in &self.changes {
            latest.insert(record.id.as_str(), (*seq, record));
        }
        latest
    }
}

/// Shared in-memory change feed
#[derive(Clone, Debug, Default)]
pub struct MemoryFeed {
    log: Arc<RwLock<ChangeLog>>,
}

impl MemoryFeed {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append any record; returns its sequence
    pub fn append(&self, record: FeedRecord) -> u64 {
        let mut log = self.log.write();
        let seq = log.last_seq() + 1;
        log.changes.push((seq, record));
        seq
    }

    /// Append an upsert of `id`
    pub fn put(&self, id: &str, doc: Value) -> u64 {
        self.append(FeedRecord::upsert(id, doc))
    }

    /// Append a tombstone for `id`
    pub fn delete(&self, id: &str) -> u64 {
        self.append(FeedRecord::tombstone(id))
    }

    /// Current head sequence
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        self.log.read().last_seq()
    }

    /// Make every request fail (`Some`) or succeed again (`None`)
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.log.write().unavailable = reason.map(str::to_string);
    }

    /// Requests served or refused so far
    #[must_use]
    pub fn requests(&self) -> usize {
        self.log.read().requests
    }
}

fn since_seq(since: Option<&SyncCursor>) -> Result<u64> {
    match since {
        None => Ok(0),
        Some(SyncCursor::Seq(n)) => Ok(*n),
        Some(SyncCursor::Token(t)) => t
            .parse()
            .map_err(|_| Error::SyncTransport(format!("invalid since value {t:?}"))),
    }
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_all(&self, range: &KeyRange) -> Result<FeedBatch> {
        let mut log = self.log.write();
        log.check_available()?;
        let records = log
            .latest()
            .into_values()
            .filter(|(_, record)| !record.deleted && range.contains(&record.id))
            .map(|(_, record)| record.clone())
            .collect();
        Ok(FeedBatch {
            records,
            cursor: Some(SyncCursor::Seq(log.last_seq())),
        })
    }

    async fn changes_since(&self, since: Option<&SyncCursor>, limit: usize) -> Result<FeedBatch> {
        let mut log = self.log.write();
        log.check_available()?;
        let since = since_seq(since)?;

        let mut page: Vec<(u64, &FeedRecord)> = log
            .latest()
            .into_values()
            .filter(|(seq, _)| *seq > since)
            .collect();
        page.sort_by_key(|(seq, _)| *seq);
        page.truncate(limit);

        let cursor = page.last().map_or(since, |(seq, _)| *seq);
        Ok(FeedBatch {
            records: page.into_iter().map(|(_, record)| record.clone()).collect(),
            cursor: Some(SyncCursor::Seq(cursor)),
        })
    }
}
