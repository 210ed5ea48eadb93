//! Write coalescing.
//!
//! A [`BatchCoalescer`] collects physical puts and deletes in memory and
//! submits them as one atomic batch on [`flush`](BatchCoalescer::flush).
//! Nothing is written before the flush and reads do not see pending ops.
//! There is no size or time trigger: callers flush once per unit of work.

use crate::backend::{BatchOp, OrderedStore};
use quire_common::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pending physical ops for one unit of work
pub struct BatchCoalescer {
    store: Arc<dyn OrderedStore>,
    label: String,
    pending: Vec<BatchOp>,
}

impl BatchCoalescer {
    /// Create an empty batch against `store`; `label` names it in errors and logs
    pub fn new(store: Arc<dyn OrderedStore>, label: impl Into<String>) -> Self {
        Self {
            store,
            label: label.into(),
            pending: Vec::new(),
        }
    }

    /// Queue a put of a physical key
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending.push(BatchOp::Put { key, value });
    }

    /// Queue a delete of a physical key
    pub fn del(&mut self, key: Vec<u8>) {
        self.pending.push(BatchOp::Del { key });
    }

    /// Number of queued ops
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Store this batch writes to
    #[must_use]
    pub fn store(&self) -> &Arc<dyn OrderedStore> {
        &self.store
    }

    /// Submit every queued op as one atomic physical batch and clear the queue.
    ///
    /// Returns the number of ops written. An empty batch makes no physical
    /// call. On failure the queue is discarded: the store applied none of it.
    pub fn flush(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let ops = std::mem::take(&mut self.pending);
        let count = ops.len();
        let first_key = String::from_utf8_lossy(ops[0].key()).into_owned();
        self.store
            .batch(ops)
            .map_err(|e| Error::store("batch", self.label.clone(), first_key, e))?;
        debug!("Flushed {} ops for {}", count, self.label);
        Ok(count)
    }
}

impl Drop for BatchCoalescer {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(
                "Dropping batch for {} with {} unflushed ops",
                self.label,
                self.pending.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    #[test]
    fn test_nothing_written_before_flush() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = BatchCoalescer::new(store.clone(), "test");

        for i in 0..5u8 {
            batch.put(vec![b'k', i], vec![i]);
        }
        assert_eq!(batch.len(), 5);
        assert_eq!(store.stats().writes(), 0);
        // Reads go to the physical store, which has nothing yet
        assert_eq!(store.get(&[b'k', 0]).unwrap(), None);

        assert_eq!(batch.flush().unwrap(), 5);
        let stats = store.stats();
        assert_eq!(stats.batches, 1);
        assert_eq!(stats.batch_ops, 5);
        assert_eq!(stats.writes(), 1);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_empty_flush_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let mut batch = BatchCoalescer::new(store.clone(), "test");
        assert_eq!(batch.flush().unwrap(), 0);
        assert_eq!(store.stats().writes(), 0);
    }

    #[test]
    fn test_failed_flush_reports_context() {
        let store = Arc::new(MemoryStore::new());
        store.fail_writes_with_prefix(Some(b"bad"));
        let mut batch = BatchCoalescer::new(store.clone(), "terms");
        batch.put(b"bad-key".to_vec(), Vec::new());

        let err = batch.flush().unwrap_err();
        assert!(err.to_string().contains("terms/bad-key"));
        assert!(batch.is_empty());
        assert!(store.is_empty());
    }
}
