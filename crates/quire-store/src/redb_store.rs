//! Persistent ordered store backed by redb.
//!
//! All namespaces share the single [`tables::KV`] table. Every write is one
//! redb write transaction, so a batch commits atomically. Iteration keeps a
//! read transaction open for its whole lifetime (a consistent snapshot) and
//! pulls entries from it in chunks.

use crate::backend::{BackendResult, BatchOp, KvPair, OrderedStore, RangeOptions, StoreIter};
use crate::tables;
use redb::{Database, ReadOnlyTable};
use std::collections::VecDeque;
use std::ops::Bound;
use std::path::Path;
use tracing::debug;

/// Default number of entries pulled from a snapshot per chunk
pub const DEFAULT_SCAN_CHUNK: usize = 256;

/// Ordered store backed by a redb database file.
pub struct RedbStore {
    db: Database,
    scan_chunk: usize,
}

impl RedbStore {
    /// Open (or create) the redb database at the given path.
    pub fn open(path: impl AsRef<Path>) -> BackendResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Create the table eagerly so later read txns don't fail
        let write_txn = db.begin_write()?;
        {
            let _t = write_txn.open_table(tables::KV)?;
        }
        write_txn.commit()?;

        debug!("Opened redb store at {}", path.display());
        Ok(Self {
            db,
            scan_chunk: DEFAULT_SCAN_CHUNK,
        })
    }

    /// Set how many entries an iterator pulls per chunk
    #[must_use]
    pub fn with_scan_chunk(mut self, scan_chunk: usize) -> Self {
        self.scan_chunk = scan_chunk.max(1);
        self
    }
}

impl OrderedStore for RedbStore {
    fn name(&self) -> &str {
        "redb"
    }

    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::KV)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> BackendResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::KV)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn del(&self, key: &[u8]) -> BackendResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::KV)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn batch(&self, ops: Vec<BatchOp>) -> BackendResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(tables::KV)?;
            for op in &ops {
                match op {
                    BatchOp::Put { key, value } => {
                        table.insert(key.as_slice(), value.as_slice())?;
                    }
                    BatchOp::Del { key } => {
                        table.remove(key.as_slice())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn iterate(&self, range: &RangeOptions<Vec<u8>>) -> BackendResult<StoreIter> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(tables::KV)?;
        let (lower, upper) = range.bounds();
        Ok(Box::new(RedbIter {
            table,
            lower,
            upper,
            reverse: range.reverse,
            remaining: range.limit,
            chunk: self.scan_chunk,
            buf: VecDeque::new(),
            exhausted: range.is_empty(),
        }))
    }
}

/// Chunked cursor over one read snapshot
struct RedbIter {
    table: ReadOnlyTable<&'static [u8], &'static [u8]>,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
    reverse: bool,
    remaining: Option<usize>,
    chunk: usize,
    buf: VecDeque<KvPair>,
    exhausted: bool,
}

impl RedbIter {
    fn fill(&mut self) -> BackendResult<()> {
        let want = self
            .remaining
            .map_or(self.chunk, |left| left.min(self.chunk));
        let bounds = (
            self.lower.as_ref().map(Vec::as_slice),
            self.upper.as_ref().map(Vec::as_slice),
        );

        let mut pulled: Vec<KvPair> = Vec::with_capacity(want);
        {
            let range = self.table.range::<&[u8]>(bounds)?;
            let entries: Box<dyn Iterator<Item = _> + '_> = if self.reverse {
                Box::new(range.rev())
            } else {
                Box::new(range)
            };
            for entry in entries.take(want) {
                let (k, v) = entry?;
                pulled.push((k.value().to_vec(), v.value().to_vec()));
            }
        }

        if pulled.len() < want {
            self.exhausted = true;
        }
        // Resume strictly past the last key seen
        if let Some((last, _)) = pulled.last() {
            if self.reverse {
                self.upper = Bound::Excluded(last.clone());
            } else {
                self.lower = Bound::Excluded(last.clone());
            }
        }
        self.buf.extend(pulled);
        Ok(())
    }
}

impl Iterator for RedbIter {
    type Item = BackendResult<KvPair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == Some(0) {
            return None;
        }
        if self.buf.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let item = self.buf.pop_front()?;
        if let Some(left) = self.remaining.as_mut() {
            *left -= 1;
        }
        Some(Ok(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn collect_keys(store: &RedbStore, range: &RangeOptions<Vec<u8>>) -> Vec<Vec<u8>> {
        store
            .iterate(range)
            .unwrap()
            .map(|e| e.unwrap().0)
            .collect()
    }

    #[test]
    fn test_put_get_del() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("kv.redb")).unwrap();

        store.put(b"alpha", b"1").unwrap();
        assert_eq!(store.get(b"alpha").unwrap(), Some(b"1".to_vec()));

        store.del(b"alpha").unwrap();
        assert_eq!(store.get(b"alpha").unwrap(), None);
        // Deleting an absent key is fine
        store.del(b"alpha").unwrap();
    }

    #[test]
    fn test_batch_is_applied_in_order() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("kv.redb")).unwrap();

        store
            .batch(vec![
                BatchOp::Put {
                    key: b"a".to_vec(),
                    value: b"1".to_vec(),
                },
                BatchOp::Put {
                    key: b"b".to_vec(),
                    value: b"2".to_vec(),
                },
                BatchOp::Del { key: b"a".to_vec() },
            ])
            .unwrap();

        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_iterate_across_chunks() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("kv.redb"))
            .unwrap()
            .with_scan_chunk(3);

        let ops = (0..10u8)
            .map(|i| BatchOp::Put {
                key: vec![b'k', b'0' + i],
                value: vec![i],
            })
            .collect();
        store.batch(ops).unwrap();

        let all = collect_keys(&store, &RangeOptions::all());
        assert_eq!(all.len(), 10);

        let mut rev = collect_keys(&store, &RangeOptions::all().reverse());
        rev.reverse();
        assert_eq!(all, rev);

        let bounded = collect_keys(
            &store,
            &RangeOptions::all().gt(b"k2".to_vec()).lte(b"k8".to_vec()).limit(4),
        );
        assert_eq!(bounded, vec![b"k3".to_vec(), b"k4".to_vec(), b"k5".to_vec(), b"k6".to_vec()]);
    }

    #[test]
    fn test_iterate_is_a_snapshot() {
        let dir = tempdir().unwrap();
        let store = RedbStore::open(dir.path().join("kv.redb"))
            .unwrap()
            .with_scan_chunk(1);
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();

        let mut iter = store.iterate(&RangeOptions::all()).unwrap();
        assert_eq!(iter.next().unwrap().unwrap().0, b"a".to_vec());
        store.put(b"c", b"3").unwrap();
        let rest: Vec<_> = iter.map(|e| e.unwrap().0).collect();
        assert_eq!(rest, vec![b"b".to_vec()]);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("kv.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.put(b"persisted", b"yes").unwrap();
        }
        let store = RedbStore::open(&path).unwrap();
        assert_eq!(store.get(b"persisted").unwrap(), Some(b"yes".to_vec()));
    }
}
