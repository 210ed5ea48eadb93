//! In-memory ordered store.
//!
//! Used by tests and by tooling that needs a throwaway keyspace. It counts
//! every physical call so write coalescing can be observed, and can be told
//! to reject batches touching a key prefix to exercise partial-failure paths.

use crate::backend::{BackendError, BackendResult, BatchOp, KvPair, OrderedStore, RangeOptions, StoreIter};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;

/// Counters of physical calls made against a [`MemoryStore`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Single-key puts
    pub puts: usize,
    /// Single-key deletes
    pub dels: usize,
    /// Atomic batch calls
    pub batches: usize,
    /// Ops submitted through batches
    pub batch_ops: usize,
}

impl StoreStats {
    /// Every physical mutation call, whatever its kind
    #[must_use]
    pub const fn writes(&self) -> usize {
        self.puts + self.dels + self.batches
    }
}

/// `BTreeMap`-backed ordered store
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    stats: Mutex<StoreStats>,
    fail_prefix: RwLock<Option<Vec<u8>>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the call counters
    pub fn stats(&self) -> StoreStats {
        *self.stats.lock()
    }

    /// Reset the call counters
    pub fn reset_stats(&self) {
        *self.stats.lock() = StoreStats::default();
    }

    /// Number of physical keys
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// True when no key is stored
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Reject every write whose key starts with `prefix` (`None` clears it)
    pub fn fail_writes_with_prefix(&self, prefix: Option<&[u8]>) {
        *self.fail_prefix.write() = prefix.map(<[u8]>::to_vec);
    }

    fn check_writable(&self, key: &[u8]) -> BackendResult<()> {
        match self.fail_prefix.read().as_deref() {
            Some(prefix) if key.starts_with(prefix) => Err(BackendError::Unavailable(format!(
                "writes rejected for {}",
                String::from_utf8_lossy(key)
            ))),
            _ => Ok(()),
        }
    }
}

impl OrderedStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> BackendResult<()> {
        self.check_writable(key)?;
        self.stats.lock().puts += 1;
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> BackendResult<()> {
        self.check_writable(key)?;
        self.stats.lock().dels += 1;
        self.data.write().remove(key);
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> BackendResult<()> {
        // Validate everything first so a rejected batch leaves no trace
        for op in &ops {
            self.check_writable(op.key())?;
        }
        {
            let mut stats = self.stats.lock();
            stats.batches += 1;
            stats.batch_ops += ops.len();
        }
        let mut data = self.data.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Del { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn iterate(&self, range: &RangeOptions<Vec<u8>>) -> BackendResult<StoreIter> {
        if range.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let data = self.data.read();
        let matching = data.range(range.bounds()).map(|(k, v)| (k.clone(), v.clone()));
        let limit = range.limit.unwrap_or(usize::MAX);
        let snapshot: Vec<KvPair> = if range.reverse {
            matching.rev().take(limit).collect()
        } else {
            matching.take(limit).collect()
        };
        Ok(Box::new(snapshot.into_iter().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_count_physical_calls() {
        let store = MemoryStore::new();
        store.put(b"a", b"1").unwrap();
        store.del(b"a").unwrap();
        store
            .batch(vec![
                BatchOp::Put {
                    key: b"b".to_vec(),
                    value: b"2".to_vec(),
                },
                BatchOp::Del { key: b"c".to_vec() },
            ])
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.puts, 1);
        assert_eq!(stats.dels, 1);
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.batch_ops, 2);
        assert_eq!(stats.writes(), 3);
    }

    #[test]
    fn test_rejected_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.fail_writes_with_prefix(Some(b"x"));
        let err = store.batch(vec![
            BatchOp::Put {
                key: b"a".to_vec(),
                value: b"1".to_vec(),
            },
            BatchOp::Put {
                key: b"xy".to_vec(),
                value: b"2".to_vec(),
            },
        ]);
        assert!(err.is_err());
        assert!(store.is_empty());

        store.fail_writes_with_prefix(None);
        store.put(b"xy", b"2").unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_iterate_reverse_and_limit() {
        let store = MemoryStore::new();
        for k in [b"a", b"b", b"c", b"d"] {
            store.put(k, b"").unwrap();
        }
        let keys: Vec<_> = store
            .iterate(&RangeOptions::all().gte(b"b".to_vec()).reverse().limit(2))
            .unwrap()
            .map(|e| e.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"d".to_vec(), b"c".to_vec()]);
    }
}
