//! Replication of a remote change feed into the local topic store.
//!
//! One run walks an explicit state machine:
//!
//! ```text
//! Uninitialized ──full──> FullImport ──> Steady
//!       │                                  │ ▲
//!       └──changes──> PageFetch <──────────┘ │
//!                         │                  │
//!                         └──> ApplyPage ────┘
//! ```
//!
//! The cursor is written only after the page it describes has been committed
//! to the primary namespace, so a crash between the two replays the page on
//! the next run. Replays are harmless: puts overwrite and index updates
//! rewrite the entries of the final value.

use crate::convert::translate;
use crate::feed::{ChangeFeed, FeedBatch, FeedRecord};
use quire_common::config::{InitialSync, RemoteConfig};
use quire_common::{Error, KeyRange, Result, SyncCursor, Topic};
use quire_store::{DocOp, StoreContext};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Tuning of a sync run
#[derive(Clone, Debug)]
pub struct SyncOptions {
    /// Changes requested per page
    pub page_size: usize,
    /// Remote ids that are topics
    pub key_range: KeyRange,
    /// Strategy when no cursor is stored
    pub initial: InitialSync,
    /// Upper bound on pages fetched by one run
    pub max_pages: Option<usize>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from(&RemoteConfig::default())
    }
}

impl From<&RemoteConfig> for SyncOptions {
    fn from(config: &RemoteConfig) -> Self {
        Self {
            page_size: config.page_size.max(1),
            key_range: config.key_range.clone(),
            initial: config.initial,
            max_pages: config.max_pages,
        }
    }
}

/// How a run obtained its data
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// One full read of the remote range, then catch-up
    Full,
    /// Change pages only
    #[default]
    Incremental,
}

/// A record the run could not translate
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConversionFailure {
    pub id: String,
    pub payload: String,
    pub reason: String,
}

/// Outcome of one sync run
#[derive(Clone, Debug, Default, Serialize)]
pub struct SyncReport {
    pub mode: SyncMode,
    /// Feed responses applied (the full import counts as one)
    pub pages: usize,
    /// Records written
    pub applied: usize,
    /// Records removed
    pub deleted: usize,
    /// Records outside the topic key range
    pub skipped: usize,
    pub failed: Vec<ConversionFailure>,
    /// Indexes left degraded by this run
    pub degraded_indexes: Vec<String>,
    /// Cursor persisted at the end of the run
    pub cursor: Option<SyncCursor>,
    /// Run stopped at `max_pages` before reaching the head of the feed
    pub truncated: bool,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            SyncMode::Full => "full",
            SyncMode::Incremental => "incremental",
        };
        write!(
            f,
            "{} sync: {} pages, {} applied, {} deleted, {} skipped, {} failed",
            mode,
            self.pages,
            self.applied,
            self.deleted,
            self.skipped,
            self.failed.len()
        )?;
        match &self.cursor {
            Some(cursor) => write!(f, ", cursor {cursor}")?,
            None => write!(f, ", no cursor")?,
        }
        if !self.degraded_indexes.is_empty() {
            write!(f, ", degraded indexes: {}", self.degraded_indexes.join(", "))?;
        }
        if self.truncated {
            write!(f, " (stopped at page limit)")?;
        }
        Ok(())
    }
}

/// Position of a run
#[derive(Debug)]
enum SyncState {
    /// No cursor stored
    Uninitialized,
    /// Reading the whole remote range
    FullImport,
    /// Applied up to `cursor`; `caught_up` ends the run
    Steady {
        cursor: Option<SyncCursor>,
        caught_up: bool,
    },
    /// Requesting the page after `cursor`
    PageFetch { cursor: Option<SyncCursor> },
    /// Applying a fetched page
    ApplyPage {
        batch: FeedBatch,
        previous: Option<SyncCursor>,
    },
}

/// Replicates a change feed into a [`StoreContext`]
pub struct ReplicationSync<F> {
    ctx: Arc<StoreContext>,
    feed: F,
    options: SyncOptions,
    /// Serializes runs against the same store
    running: Mutex<()>,
}

impl<F: ChangeFeed> ReplicationSync<F> {
    pub fn new(ctx: Arc<StoreContext>, feed: F, options: SyncOptions) -> Self {
        Self {
            ctx,
            feed,
            options,
            running: Mutex::new(()),
        }
    }

    #[must_use]
    pub const fn options(&self) -> &SyncOptions {
        &self.options
    }

    #[must_use]
    pub const fn feed(&self) -> &F {
        &self.feed
    }

    /// Run until the local store has caught up with the feed (or the page
    /// limit is hit).
    ///
    /// Feed errors abort the run with the cursor at the last committed page.
    pub async fn run(&self) -> Result<SyncReport> {
        let _running = self.running.lock().await;
        let mut report = SyncReport::default();
        let mut fetched = 0usize;

        let mut state = match self.ctx.cursor()? {
            Some(cursor) => SyncState::Steady {
                cursor: Some(cursor),
                caught_up: false,
            },
            None => SyncState::Uninitialized,
        };

        loop {
            debug!("Sync state: {:?}", state);
            state = match state {
                SyncState::Uninitialized => match self.options.initial {
                    InitialSync::Full => SyncState::FullImport,
                    InitialSync::Changes => {
                        info!("No sync cursor; replaying {} from the start", self.feed.name());
                        SyncState::PageFetch { cursor: None }
                    }
                },

                SyncState::FullImport => {
                    info!("No sync cursor; importing everything from {}", self.feed.name());
                    report.mode = SyncMode::Full;
                    let batch = self
                        .feed
                        .fetch_all(&self.options.key_range)
                        .await
                        .inspect_err(|e| warn!("Full import from {} failed: {}", self.feed.name(), e))?;
                    fetched += 1;
                    let stale = self.stale_topics(&batch.records)?;
                    let cursor = self.commit(batch, stale, None, &mut report)?;
                    SyncState::Steady {
                        cursor,
                        caught_up: false,
                    }
                }

                SyncState::Steady { cursor, caught_up } => {
                    if caught_up {
                        report.cursor = cursor;
                        break;
                    }
                    SyncState::PageFetch { cursor }
                }

                SyncState::PageFetch { cursor } => {
                    if self.options.max_pages.is_some_and(|max| fetched >= max) {
                        info!("Stopping sync after {} pages", fetched);
                        report.truncated = true;
                        SyncState::Steady {
                            cursor,
                            caught_up: true,
                        }
                    } else {
                        let batch = self
                            .feed
                            .changes_since(cursor.as_ref(), self.options.page_size)
                            .await
                            .inspect_err(|e| {
                                warn!(
                                    "Fetching changes from {} failed, cursor stays at {:?}: {}",
                                    self.feed.name(),
                                    cursor,
                                    e
                                );
                            })?;
                        fetched += 1;
                        SyncState::ApplyPage {
                            batch,
                            previous: cursor,
                        }
                    }
                }

                SyncState::ApplyPage { batch, previous } => {
                    if batch.records.is_empty() {
                        SyncState::Steady {
                            cursor: previous,
                            caught_up: true,
                        }
                    } else if batch.cursor.is_none() || batch.cursor == previous {
                        warn!(
                            "{} returned {} changes without advancing the cursor; stopping",
                            self.feed.name(),
                            batch.records.len()
                        );
                        let cursor = self.commit(batch, Vec::new(), previous.clone(), &mut report)?;
                        SyncState::Steady {
                            cursor,
                            caught_up: true,
                        }
                    } else {
                        let cursor = self.commit(batch, Vec::new(), previous, &mut report)?;
                        SyncState::Steady {
                            cursor,
                            caught_up: false,
                        }
                    }
                }
            };
        }

        info!("{}", report);
        Ok(report)
    }

    /// Local topics a full read did not list.
    ///
    /// A full listing omits deleted documents, so anything stored locally but
    /// absent from it was deleted remotely while no cursor was held.
    fn stale_topics(&self, records: &[FeedRecord]) -> Result<Vec<DocOp<Topic>>> {
        let listed: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let mut stale = Vec::new();
        for entry in self.ctx.topics().primary().iter_all()? {
            let (key, _) = entry?;
            if !listed.contains(key.as_str()) {
                stale.push(DocOp::del(key));
            }
        }
        if !stale.is_empty() {
            info!("Removing {} local topics missing from the full read", stale.len());
        }
        Ok(stale)
    }

    /// Apply one feed response plus `removals` and then persist its cursor.
    ///
    /// Returns the cursor now in effect.
    fn commit(
        &self,
        batch: FeedBatch,
        removals: Vec<DocOp<Topic>>,
        previous: Option<SyncCursor>,
        report: &mut SyncReport,
    ) -> Result<Option<SyncCursor>> {
        let mut ops = self.translate_page(&batch.records, report);
        report.deleted += removals.len();
        ops.extend(removals);
        let count = ops.len();

        match self.ctx.topics().batch(ops) {
            Ok(_) => {}
            Err(Error::IndexConsistency { indexes, reason }) => {
                warn!(
                    "Page committed but indexes {:?} are degraded: {}",
                    indexes, reason
                );
                for index in indexes {
                    if !report.degraded_indexes.contains(&index) {
                        report.degraded_indexes.push(index);
                    }
                }
            }
            Err(e) => return Err(e),
        }
        report.pages += 1;

        let Some(cursor) = batch.cursor.or(previous) else {
            return Ok(None);
        };
        self.ctx.set_cursor(&cursor)?;
        debug!("Committed {} ops, cursor now {}", count, cursor);
        Ok(Some(cursor))
    }

    fn translate_page(&self, records: &[FeedRecord], report: &mut SyncReport) -> Vec<DocOp<Topic>> {
        let mut ops = Vec::with_capacity(records.len());
        for record in records {
            match translate(record, &self.options.key_range) {
                Ok(Some(op)) => {
                    match op {
                        DocOp::Put { .. } => report.applied += 1,
                        DocOp::Del { .. } => report.deleted += 1,
                    }
                    ops.push(op);
                }
                Ok(None) => report.skipped += 1,
                Err(Error::Conversion {
                    id,
                    payload,
                    reason,
                }) => {
                    error!("Cannot convert record {}: {} (payload: {})", id, reason, payload);
                    report.failed.push(ConversionFailure {
                        id,
                        payload,
                        reason,
                    });
                }
                Err(e) => {
                    error!("Cannot convert record {}: {}", record.id, e);
                    report.failed.push(ConversionFailure {
                        id: record.id.clone(),
                        payload: record
                            .doc
                            .as_ref()
                            .map_or_else(|| "null".to_string(), ToString::to_string),
                        reason: e.to_string(),
                    });
                }
            }
        }
        ops
    }
}
