//! A primary namespace with its secondary indexes behind one write surface.
//!
//! Every write goes to the primary namespace first, as one physical batch,
//! and is then fed through each index as one further batch per index. There
//! is no transaction spanning the two: if an index batch fails the primary
//! write stays committed, the index is marked degraded and the caller gets
//! [`Error::IndexConsistency`]. `rebuild_index` repairs a degraded index.

use crate::backend::RangeOptions;
use crate::batch::BatchCoalescer;
use crate::index::{DocOp, PriorValues, SecondaryIndex};
use crate::namespace::Namespace;
use parking_lot::Mutex;
use quire_common::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use tracing::{error, info};

/// Primary namespace plus named secondary indexes
pub struct IndexedNamespace<T> {
    primary: Namespace,
    indexes: Vec<SecondaryIndex<T>>,
    /// Serializes mutations: capture priors, write primary, update indexes
    write_lock: Mutex<()>,
    degraded: Mutex<BTreeSet<String>>,
}

impl<T: Serialize + DeserializeOwned> IndexedNamespace<T> {
    /// Wrap `primary` with no indexes attached yet
    #[must_use]
    pub fn new(primary: Namespace) -> Self {
        Self {
            primary,
            indexes: Vec::new(),
            write_lock: Mutex::new(()),
            degraded: Mutex::new(BTreeSet::new()),
        }
    }

    /// Attach an index; it must be built over this namespace
    #[must_use]
    pub fn with_index(mut self, index: SecondaryIndex<T>) -> Self {
        self.indexes.push(index);
        self
    }

    /// Primary namespace
    #[must_use]
    pub const fn primary(&self) -> &Namespace {
        &self.primary
    }

    /// Attached index by name
    pub fn index(&self, name: &str) -> Result<&SecondaryIndex<T>> {
        self.indexes
            .iter()
            .find(|index| index.name() == name)
            .ok_or_else(|| Error::UnknownIndex(name.to_string()))
    }

    /// Names of every attached index
    pub fn index_names(&self) -> Vec<&str> {
        self.indexes.iter().map(SecondaryIndex::name).collect()
    }

    /// Indexes whose last update failed and which have not been rebuilt since
    pub fn degraded_indexes(&self) -> Vec<String> {
        self.degraded.lock().iter().cloned().collect()
    }

    // ---- Reads ----

    /// Read a record, failing with `NotFound` when absent
    pub fn get(&self, key: &str) -> Result<T> {
        self.primary.get_json(key)
    }

    /// Read a record, `None` when absent
    pub fn try_get(&self, key: &str) -> Result<Option<T>> {
        self.primary.try_get_json(key)
    }

    /// Iterate decoded records within `range`
    pub fn iterate<'a>(
        &'a self,
        range: &RangeOptions<String>,
    ) -> Result<impl Iterator<Item = Result<(String, T)>> + use<'a, T>> {
        let inner = self.primary.iterate(range)?;
        Ok(inner.map(move |entry| {
            let (key, bytes) = entry?;
            let value = self.primary.decode_json(&key, &bytes)?;
            Ok((key, value))
        }))
    }

    // ---- Writes ----

    /// Write one record and index it
    pub fn put(&self, key: &str, value: T) -> Result<()> {
        self.batch(vec![DocOp::put(key, value)]).map(|_| ())
    }

    /// Remove one record and its index entries
    pub fn del(&self, key: &str) -> Result<()> {
        self.batch(vec![DocOp::del(key)]).map(|_| ())
    }

    /// Apply `ops` to the primary namespace in one physical batch, then to
    /// every index. Returns the number of primary ops written.
    pub fn batch(&self, ops: Vec<DocOp<T>>) -> Result<usize> {
        if ops.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock();

        let prior = self.capture_prior(&ops)?;

        let mut batch = BatchCoalescer::new(self.primary.store().clone(), self.primary.name());
        for op in &ops {
            match op {
                DocOp::Put { key, value } => {
                    let bytes = serde_json::to_vec(value)
                        .map_err(|e| Error::store("encode", self.primary.name(), key.clone(), e))?;
                    self.primary.stage_put(&mut batch, key, bytes)?;
                }
                DocOp::Del { key } => self.primary.stage_del(&mut batch, key)?,
            }
        }
        let written = batch.flush()?;

        let mut failed = Vec::new();
        let mut reasons = Vec::new();
        for index in &self.indexes {
            if let Err(e) = index.update_index(&ops, Some(&prior)) {
                error!(
                    "Index {} update failed after primary write to {}: {}",
                    index.name(),
                    self.primary.name(),
                    e
                );
                failed.push(index.name().to_string());
                reasons.push(e.to_string());
            }
        }
        if !failed.is_empty() {
            self.degraded.lock().extend(failed.iter().cloned());
            return Err(Error::IndexConsistency {
                indexes: failed,
                reason: reasons.join("; "),
            });
        }
        Ok(written)
    }

    /// Values the touched records hold before the batch is applied
    fn capture_prior(&self, ops: &[DocOp<T>]) -> Result<PriorValues<T>> {
        let mut prior = PriorValues::new();
        if self.indexes.is_empty() {
            return Ok(prior);
        }
        for op in ops {
            if !prior.contains_key(op.key()) {
                let value = self.primary.try_get_json(op.key())?;
                prior.insert(op.key().to_string(), value);
            }
        }
        Ok(prior)
    }

    // ---- Repair ----

    /// Recompute one index from the primary namespace and clear its degraded mark
    pub fn rebuild_index(&self, name: &str) -> Result<usize> {
        let _guard = self.write_lock.lock();
        let index = self.index(name)?;
        let written = index.rebuild()?;
        self.degraded.lock().remove(name);
        info!(
            "Rebuilt index {} over {} ({} entries)",
            name,
            self.primary.name(),
            written
        );
        Ok(written)
    }

    /// Recompute every attached index
    pub fn rebuild_all(&self) -> Result<usize> {
        let names: Vec<String> = self.index_names().into_iter().map(String::from).collect();
        let mut total = 0;
        for name in names {
            total += self.rebuild_index(&name)?;
        }
        Ok(total)
    }
}
