//! Secondary indexes.
//!
//! An index maps derived index keys back to primary keys. Each pair is one
//! physical entry `indexKey!primaryKey -> primaryKey` in the index's own
//! namespace, so a multi-valued index function simply produces several
//! entries, and all current matches for an index key are the range
//! `[indexKey!, indexKey!\xFF)`.
//!
//! Removing stale entries needs the index keys of the value being replaced.
//! Callers hand those prior values in explicitly; when they don't, the index
//! reads them from the primary namespace, which is only correct while the
//! primary write has not been committed yet.

use crate::backend::{BackendError, RangeOptions};
use crate::batch::BatchCoalescer;
use crate::namespace::{MAX_BYTE, Namespace, SEP};
use quire_common::{Error, Result};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// Derives zero or more index keys from a record
pub trait IndexFn<T>: Send + Sync {
    fn index_keys(&self, primary_key: &str, value: &T) -> Vec<String>;
}

impl<T, F> IndexFn<T> for F
where
    F: Fn(&str, &T) -> Vec<String> + Send + Sync,
{
    fn index_keys(&self, primary_key: &str, value: &T) -> Vec<String> {
        self(primary_key, value)
    }
}

/// A record-level write against an indexed namespace
#[derive(Clone, Debug, PartialEq)]
pub enum DocOp<T> {
    Put { key: String, value: T },
    Del { key: String },
}

impl<T> DocOp<T> {
    pub fn put(key: impl Into<String>, value: T) -> Self {
        Self::Put {
            key: key.into(),
            value,
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Del { key } => key,
        }
    }
}

/// Values records had before a batch, keyed by primary key (`None` = absent)
pub type PriorValues<T> = HashMap<String, Option<T>>;

/// A derived index over one primary namespace
pub struct SecondaryIndex<T> {
    name: String,
    entries: Namespace,
    primary: Namespace,
    index_fn: Box<dyn IndexFn<T>>,
}

impl<T: DeserializeOwned> SecondaryIndex<T> {
    /// Index `primary` into `entries` using `index_fn`
    pub fn new(
        name: impl Into<String>,
        entries: Namespace,
        primary: Namespace,
        index_fn: impl IndexFn<T> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            entries,
            primary,
            index_fn: Box::new(index_fn),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace holding the index entries
    #[must_use]
    pub const fn entries(&self) -> &Namespace {
        &self.entries
    }

    /// Distinct, storable index keys of one record
    pub fn keys_of(&self, primary_key: &str, value: &T) -> BTreeSet<String> {
        self.index_fn
            .index_keys(primary_key, value)
            .into_iter()
            .filter(|key| {
                let ok = !key.is_empty() && !key.as_bytes().contains(&SEP);
                if !ok {
                    warn!(
                        "Index {} dropping unstorable key {:?} for {}",
                        self.name, key, primary_key
                    );
                }
                ok
            })
            .collect()
    }

    fn entry_key(&self, index_key: &str, primary_key: &str) -> Vec<u8> {
        let mut local = String::with_capacity(index_key.len() + primary_key.len() + 1);
        local.push_str(index_key);
        local.push(char::from(SEP));
        local.push_str(primary_key);
        self.entries.encode_key(&local)
    }

    /// Primary keys currently matching `index_key`, in key order
    pub fn primary_keys(&self, index_key: &str) -> Result<Vec<String>> {
        let mut low = self.entries.encode_key(index_key);
        low.push(SEP);
        let mut high = low.clone();
        high.push(MAX_BYTE);
        let range = RangeOptions::all().gte(low).lt(high);

        let wrap = |e: BackendError| Error::store("scan", self.entries.name(), index_key, e);
        let mut keys = Vec::new();
        for entry in self.entries.store().iterate(&range).map_err(wrap)? {
            let (_, value) = entry.map_err(wrap)?;
            let key = String::from_utf8(value).map_err(|e| {
                Error::store("scan", self.entries.name(), index_key, e)
            })?;
            keys.push(key);
        }
        Ok(keys)
    }

    /// Records currently matching `index_key`, resolved from the primary namespace.
    ///
    /// Entries whose record has vanished are skipped; they only exist while the
    /// index is degraded.
    pub fn get(&self, index_key: &str) -> Result<Vec<(String, T)>> {
        let mut records = Vec::new();
        for key in self.primary_keys(index_key)? {
            match self.primary.try_get_json::<T>(&key)? {
                Some(value) => records.push((key, value)),
                None => warn!(
                    "Index {} has dangling entry {} -> {}",
                    self.name, index_key, key
                ),
            }
        }
        Ok(records)
    }

    fn current_keys(&self, primary_key: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .primary
            .try_get_json::<T>(primary_key)?
            .map(|value| self.keys_of(primary_key, &value))
            .unwrap_or_default())
    }

    /// Apply the index deltas implied by `ops` as one physical batch.
    ///
    /// Ops on the same key chain: the prior of a later op is the value the
    /// earlier one wrote. For each touched record every entry of its final
    /// value is (re)written and entries only its prior value implied are
    /// removed, so replaying a batch repairs rather than duplicates.
    pub fn update_index(&self, ops: &[DocOp<T>], prior: Option<&PriorValues<T>>) -> Result<usize> {
        // primary key -> (index keys before the batch, index keys after it)
        let mut deltas: BTreeMap<&str, (BTreeSet<String>, BTreeSet<String>)> = BTreeMap::new();
        for op in ops {
            let key = op.key();
            if !deltas.contains_key(key) {
                let before = match prior.and_then(|p| p.get(key)) {
                    Some(Some(value)) => self.keys_of(key, value),
                    Some(None) => BTreeSet::new(),
                    None => self.current_keys(key)?,
                };
                deltas.insert(key, (before, BTreeSet::new()));
            }
            let after = match op {
                DocOp::Put { value, .. } => self.keys_of(key, value),
                DocOp::Del { .. } => BTreeSet::new(),
            };
            if let Some(delta) = deltas.get_mut(key) {
                delta.1 = after;
            }
        }

        let mut batch = BatchCoalescer::new(self.entries.store().clone(), self.entries.name());
        for (primary_key, (before, after)) in &deltas {
            for stale in before.difference(after) {
                batch.del(self.entry_key(stale, primary_key));
            }
            for index_key in after {
                batch.put(
                    self.entry_key(index_key, primary_key),
                    primary_key.as_bytes().to_vec(),
                );
            }
        }
        let written = batch.flush()?;
        debug!(
            "Index {} applied {} entry ops for {} records",
            self.name,
            written,
            deltas.len()
        );
        Ok(written)
    }

    /// Drop every entry and recompute the index from the primary namespace
    pub fn rebuild(&self) -> Result<usize> {
        let removed = self.entries.clear()?;
        let mut batch = BatchCoalescer::new(self.entries.store().clone(), self.entries.name());
        for entry in self.primary.iter_all()? {
            let (key, bytes) = entry?;
            let value: T = self.primary.decode_json(&key, &bytes)?;
            for index_key in self.keys_of(&key, &value) {
                batch.put(self.entry_key(&index_key, &key), key.as_bytes().to_vec());
            }
        }
        let written = batch.flush()?;
        debug!(
            "Rebuilt index {}: removed {} entries, wrote {}",
            self.name, removed, written
        );
        Ok(written)
    }

    /// Every `(index key, primary key)` pair, in index order
    pub fn all_entries(&self) -> Result<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        for entry in self.entries.iter_all()? {
            let (local, value) = entry?;
            let primary_key = String::from_utf8(value)
                .map_err(|e| Error::store("scan", self.entries.name(), local.clone(), e))?;
            let index_key = local
                .strip_suffix(primary_key.as_str())
                .and_then(|rest| rest.strip_suffix(char::from(SEP)))
                .unwrap_or(local.as_str())
                .to_string();
            pairs.push((index_key, primary_key));
        }
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::OrderedStore;
    use crate::memory::MemoryStore;
    use std::sync::Arc;

    type Doc = Vec<String>;

    fn tags(_pk: &str, doc: &Doc) -> Vec<String> {
        doc.clone()
    }

    fn setup() -> (Arc<MemoryStore>, Namespace, SecondaryIndex<Doc>) {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn OrderedStore> = memory.clone();
        let primary = Namespace::root(store.clone(), "docs").unwrap();
        let entries = Namespace::root(store, "tags").unwrap();
        let index = SecondaryIndex::new("tags", entries, primary.clone(), tags);
        (memory, primary, index)
    }

    fn doc(tags: &[&str]) -> Doc {
        tags.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_put_then_lookup() {
        let (_, primary, index) = setup();
        let value = doc(&["red", "blue"]);
        let ops = vec![DocOp::put("d1", value.clone())];
        index.update_index(&ops, None).unwrap();
        primary.put_json("d1", &value).unwrap();

        assert_eq!(index.primary_keys("red").unwrap(), vec!["d1"]);
        assert_eq!(index.get("blue").unwrap(), vec![("d1".to_string(), value)]);
        assert!(index.get("green").unwrap().is_empty());
    }

    #[test]
    fn test_lookup_does_not_match_longer_keys() {
        let (_, primary, index) = setup();
        let ops = vec![
            DocOp::put("d1", doc(&["red"])),
            DocOp::put("d2", doc(&["redder"])),
        ];
        index.update_index(&ops, Some(&PriorValues::new())).unwrap();
        primary.put_json("d1", &doc(&["red"])).unwrap();
        primary.put_json("d2", &doc(&["redder"])).unwrap();

        assert_eq!(index.primary_keys("red").unwrap(), vec!["d1"]);
        assert_eq!(index.primary_keys("redder").unwrap(), vec!["d2"]);
    }

    #[test]
    fn test_update_removes_stale_entries() {
        let (_, primary, index) = setup();
        let old = doc(&["red", "blue"]);
        index.update_index(&[DocOp::put("d1", old.clone())], None).unwrap();
        primary.put_json("d1", &old).unwrap();

        // Prior value fetched from the primary before it is overwritten
        let new = doc(&["green"]);
        index.update_index(&[DocOp::put("d1", new.clone())], None).unwrap();
        primary.put_json("d1", &new).unwrap();

        assert!(index.primary_keys("red").unwrap().is_empty());
        assert!(index.primary_keys("blue").unwrap().is_empty());
        assert_eq!(index.primary_keys("green").unwrap(), vec!["d1"]);
        assert_eq!(
            index.all_entries().unwrap(),
            vec![("green".to_string(), "d1".to_string())]
        );
    }

    #[test]
    fn test_explicit_prior_values_are_used() {
        let (_, _, index) = setup();
        index.update_index(&[DocOp::put("d1", doc(&["red"]))], None).unwrap();

        // Primary never held d1, so only the explicit prior reveals "red"
        let mut prior = PriorValues::new();
        prior.insert("d1".to_string(), Some(doc(&["red"])));
        index.update_index(&[DocOp::del("d1")], Some(&prior)).unwrap();

        assert!(index.all_entries().unwrap().is_empty());
    }

    #[test]
    fn test_ops_on_same_key_chain() {
        let (_, _, index) = setup();
        let ops = vec![
            DocOp::put("d1", doc(&["a"])),
            DocOp::put("d1", doc(&["b"])),
            DocOp::put("d2", doc(&["a"])),
            DocOp::del("d2"),
        ];
        index.update_index(&ops, Some(&PriorValues::new())).unwrap();
        assert_eq!(
            index.all_entries().unwrap(),
            vec![("b".to_string(), "d1".to_string())]
        );
    }

    #[test]
    fn test_one_physical_batch_per_update() {
        let (memory, _, index) = setup();
        memory.reset_stats();
        let ops: Vec<_> = (0..4)
            .map(|i| DocOp::put(format!("d{i}"), doc(&["x", "y"])))
            .collect();
        index.update_index(&ops, Some(&PriorValues::new())).unwrap();
        let stats = memory.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.batch_ops, 8);
    }

    #[test]
    fn test_unstorable_keys_are_dropped() {
        let (_, _, index) = setup();
        let keys = index.keys_of("d1", &doc(&["ok", "", "bad!key", "ok"]));
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["ok"]);
    }

    #[test]
    fn test_rebuild_from_primary() {
        let (_, primary, index) = setup();
        primary.put_json("d1", &doc(&["a", "b"])).unwrap();
        primary.put_json("d2", &doc(&["b"])).unwrap();
        // A phantom entry the primary no longer justifies
        index.update_index(&[DocOp::put("gone", doc(&["a"]))], Some(&PriorValues::new())).unwrap();

        assert_eq!(index.rebuild().unwrap(), 3);
        assert_eq!(index.primary_keys("a").unwrap(), vec!["d1"]);
        assert_eq!(index.primary_keys("b").unwrap(), vec!["d1", "d2"]);
    }

    #[test]
    fn test_dangling_entries_are_skipped_on_get() {
        let (_, _, index) = setup();
        index.update_index(&[DocOp::put("ghost", doc(&["a"]))], Some(&PriorValues::new())).unwrap();
        assert_eq!(index.primary_keys("a").unwrap(), vec!["ghost"]);
        assert!(index.get("a").unwrap().is_empty());
    }
}
