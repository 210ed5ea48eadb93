//! Store context: every namespace and index, built once at startup.
//!
//! Physical layout of the shared store:
//!
//! | namespace  | keys                         | values                   |
//! |------------|------------------------------|--------------------------|
//! | `topics`   | topic key                    | JSON [`Topic`]           |
//! | `backrefs` | `target!topic`               | topic key                |
//! | `terms`    | `word!topic`                 | topic key                |
//! | `configs`  | `lastSeq`, `storageVersion`  | JSON cursor, bincode u32 |
//!
//! The layout is not compatible across storage versions. Opening a store
//! written by another version wipes it so it can be rebuilt by a full sync.

use crate::backend::{BatchOp, OrderedStore, RangeOptions};
use crate::index::SecondaryIndex;
use crate::indexed::IndexedNamespace;
use crate::indexes;
use crate::namespace::Namespace;
use quire_common::{Error, Result, SyncCursor, Topic};
use std::sync::Arc;
use tracing::{info, warn};

/// Layout version this build reads and writes
pub const STORAGE_VERSION: u32 = 1;

/// `configs` key of the replication cursor
pub const CURSOR_KEY: &str = "lastSeq";

/// `configs` key of the storage version tag
pub const VERSION_KEY: &str = "storageVersion";

/// What `open` found and did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Store was empty and has been stamped with the current version
    Initialized,
    /// Store already carried the current version
    Current,
    /// Store carried another version (or none) and was wiped
    Rebuilt { found: u32 },
}

/// Namespaces and indexes shared by the sync engine and readers
pub struct StoreContext {
    store: Arc<dyn OrderedStore>,
    topics: IndexedNamespace<Topic>,
    configs: Namespace,
}

impl StoreContext {
    /// Build the namespaces without touching the store
    pub fn new(store: Arc<dyn OrderedStore>) -> Result<Self> {
        let primary = Namespace::root(store.clone(), "topics")?;
        let backrefs = SecondaryIndex::new(
            indexes::BACKREFS,
            Namespace::root(store.clone(), indexes::BACKREFS)?,
            primary.clone(),
            indexes::backrefs,
        );
        let terms = SecondaryIndex::new(
            indexes::TERMS,
            Namespace::root(store.clone(), indexes::TERMS)?,
            primary.clone(),
            indexes::terms,
        );
        let topics = IndexedNamespace::new(primary)
            .with_index(backrefs)
            .with_index(terms);
        let configs = Namespace::root(store.clone(), "configs")?;
        Ok(Self {
            store,
            topics,
            configs,
        })
    }

    /// Build the context and reconcile the storage version
    pub fn open(store: Arc<dyn OrderedStore>) -> Result<(Self, OpenOutcome)> {
        Self::open_with_version(store, STORAGE_VERSION)
    }

    /// As [`open`](Self::open), expecting layout version `expected`
    pub fn open_with_version(
        store: Arc<dyn OrderedStore>,
        expected: u32,
    ) -> Result<(Self, OpenOutcome)> {
        let ctx = Self::new(store)?;
        let outcome = match ctx.check_storage_version(expected) {
            Ok(outcome) => outcome,
            Err(Error::SchemaVersion { found, expected }) => {
                warn!(
                    "Storage version {} does not match expected {}; wiping local store for a full rebuild",
                    found, expected
                );
                let removed = ctx.wipe()?;
                ctx.write_storage_version(expected)?;
                info!("Local store wiped ({} keys); next sync performs a full import", removed);
                OpenOutcome::Rebuilt { found }
            }
            Err(e) => return Err(e),
        };
        Ok((ctx, outcome))
    }

    /// Indexed topics namespace
    #[must_use]
    pub const fn topics(&self) -> &IndexedNamespace<Topic> {
        &self.topics
    }

    /// Reverse-link index
    pub fn backrefs(&self) -> Result<&SecondaryIndex<Topic>> {
        self.topics.index(indexes::BACKREFS)
    }

    /// Full-text term index
    pub fn terms(&self) -> Result<&SecondaryIndex<Topic>> {
        self.topics.index(indexes::TERMS)
    }

    /// Small configuration values
    #[must_use]
    pub const fn configs(&self) -> &Namespace {
        &self.configs
    }

    /// Physical store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn OrderedStore> {
        &self.store
    }

    // ---- Replication cursor ----

    /// Last applied feed position, `None` before the first import
    pub fn cursor(&self) -> Result<Option<SyncCursor>> {
        let Some(bytes) = self.configs.try_get(CURSOR_KEY)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::CorruptCursor(e.to_string()))
    }

    /// Persist the feed position; call only after the matching batch committed
    pub fn set_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.configs.put_json(CURSOR_KEY, cursor)
    }

    /// Forget the feed position so the next sync starts from scratch
    pub fn reset_cursor(&self) -> Result<()> {
        self.configs.del(CURSOR_KEY)
    }

    // ---- Storage version ----

    /// Version tag stored in the database, if any
    pub fn storage_version(&self) -> Result<Option<u32>> {
        let Some(bytes) = self.configs.try_get(VERSION_KEY)? else {
            return Ok(None);
        };
        bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| Error::store("decode", self.configs.name(), VERSION_KEY, e))
    }

    fn write_storage_version(&self, version: u32) -> Result<()> {
        let bytes = bincode::serialize(&version)
            .map_err(|e| Error::store("encode", self.configs.name(), VERSION_KEY, e))?;
        self.configs.put(VERSION_KEY, &bytes)
    }

    /// Compare the stored version with `expected`; stamp an empty store.
    ///
    /// A non-empty store without a tag predates versioning and counts as
    /// version 0.
    pub fn check_storage_version(&self, expected: u32) -> Result<OpenOutcome> {
        match self.storage_version()? {
            Some(found) if found == expected => Ok(OpenOutcome::Current),
            Some(found) => Err(Error::SchemaVersion { found, expected }),
            None if self.is_empty()? => {
                self.write_storage_version(expected)?;
                Ok(OpenOutcome::Initialized)
            }
            None => Err(Error::SchemaVersion { found: 0, expected }),
        }
    }

    fn is_empty(&self) -> Result<bool> {
        let mut iter = self
            .store
            .iterate(&RangeOptions::all().limit(1))
            .map_err(|e| Error::store("iterate", "*", "", e))?;
        Ok(iter.next().is_none())
    }

    /// Delete every physical key, across all namespaces, in one batch
    fn wipe(&self) -> Result<usize> {
        let mut ops = Vec::new();
        for entry in self
            .store
            .iterate(&RangeOptions::all())
            .map_err(|e| Error::store("wipe", "*", "", e))?
        {
            let (key, _) = entry.map_err(|e| Error::store("wipe", "*", "", e))?;
            ops.push(BatchOp::Del { key });
        }
        let removed = ops.len();
        self.store
            .batch(ops)
            .map_err(|e| Error::store("wipe", "*", "", e))?;
        Ok(removed)
    }
}
