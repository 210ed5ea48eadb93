//! The ordered storage primitive everything else is layered on.
//!
//! An [`OrderedStore`] is a flat, byte-ordered key-value map with atomic
//! multi-key batches and bounded range iteration. Namespaces, indexes and the
//! replication cursor all live inside one such store, separated by key prefix.

use std::ops::Bound;

/// Error type for physical store operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<redb::TransactionError> for BackendError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A physical key/value pair
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Lazy, ordered sequence of physical entries
pub type StoreIter = Box<dyn Iterator<Item = BackendResult<KvPair>>>;

/// One operation of an atomic batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Del { key: Vec<u8> },
}

impl BatchOp {
    /// Key the operation targets
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Put { key, .. } | Self::Del { key } => key,
        }
    }
}

/// Range selection for iteration.
///
/// `gte`/`gt` bound the low end and `lte`/`lt` the high end regardless of
/// direction; `reverse` only flips the order entries are yielded in. When both
/// forms of a bound are set the exclusive one wins.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeOptions<K> {
    pub gte: Option<K>,
    pub gt: Option<K>,
    pub lte: Option<K>,
    pub lt: Option<K>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl<K> Default for RangeOptions<K> {
    fn default() -> Self {
        Self {
            gte: None,
            gt: None,
            lte: None,
            lt: None,
            reverse: false,
            limit: None,
        }
    }
}

impl<K> RangeOptions<K> {
    /// Everything, ascending
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Range given in iteration order: `start` is where iteration begins.
    ///
    /// For a reverse scan `start` is therefore the high bound, so the two
    /// are swapped before being stored as `lte`/`gte`.
    #[must_use]
    pub fn between(start: K, end: K, reverse: bool) -> Self {
        let (low, high) = if reverse { (end, start) } else { (start, end) };
        Self {
            gte: Some(low),
            lte: Some(high),
            reverse,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn gte(mut self, key: impl Into<K>) -> Self {
        self.gte = Some(key.into());
        self
    }

    #[must_use]
    pub fn gt(mut self, key: impl Into<K>) -> Self {
        self.gt = Some(key.into());
        self
    }

    #[must_use]
    pub fn lte(mut self, key: impl Into<K>) -> Self {
        self.lte = Some(key.into());
        self
    }

    #[must_use]
    pub fn lt(mut self, key: impl Into<K>) -> Self {
        self.lt = Some(key.into());
        self
    }

    #[must_use]
    pub const fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Effective low bound
    pub fn lower(&self) -> Bound<&K> {
        match (&self.gt, &self.gte) {
            (Some(k), _) => Bound::Excluded(k),
            (None, Some(k)) => Bound::Included(k),
            (None, None) => Bound::Unbounded,
        }
    }

    /// Effective high bound
    pub fn upper(&self) -> Bound<&K> {
        match (&self.lt, &self.lte) {
            (Some(k), _) => Bound::Excluded(k),
            (None, Some(k)) => Bound::Included(k),
            (None, None) => Bound::Unbounded,
        }
    }
}

impl RangeOptions<Vec<u8>> {
    /// Check whether a physical key falls inside the range
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        let above = match self.lower() {
            Bound::Included(k) => key >= k.as_slice(),
            Bound::Excluded(k) => key > k.as_slice(),
            Bound::Unbounded => true,
        };
        let below = match self.upper() {
            Bound::Included(k) => key <= k.as_slice(),
            Bound::Excluded(k) => key < k.as_slice(),
            Bound::Unbounded => true,
        };
        above && below
    }

    /// True when no key can satisfy both bounds (or the limit is zero)
    #[must_use]
    pub fn is_empty(&self) -> bool {
        if self.limit == Some(0) {
            return true;
        }
        match (self.lower(), self.upper()) {
            (Bound::Included(lo), Bound::Included(hi)) => lo > hi,
            (Bound::Included(lo) | Bound::Excluded(lo), Bound::Excluded(hi))
            | (Bound::Excluded(lo), Bound::Included(hi)) => lo >= hi,
            _ => false,
        }
    }

    /// Owned copies of both bounds
    #[must_use]
    pub fn bounds(&self) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        (self.lower().cloned(), self.upper().cloned())
    }
}

/// Ordered key-value primitive.
///
/// Implementations must make `batch` atomic: after a crash either every op of
/// the batch is visible or none is. `iterate` returns a snapshot-like cursor
/// that is released when dropped.
pub trait OrderedStore: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Read one key
    fn get(&self, key: &[u8]) -> BackendResult<Option<Vec<u8>>>;

    /// Write one key
    fn put(&self, key: &[u8], value: &[u8]) -> BackendResult<()>;

    /// Remove one key (absent keys are not an error)
    fn del(&self, key: &[u8]) -> BackendResult<()>;

    /// Apply every op atomically, in order
    fn batch(&self, ops: Vec<BatchOp>) -> BackendResult<()>;

    /// Iterate a range of keys
    fn iterate(&self, range: &RangeOptions<Vec<u8>>) -> BackendResult<StoreIter>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> RangeOptions<Vec<u8>> {
        RangeOptions::all()
    }

    #[test]
    fn test_between_swaps_for_reverse() {
        let fwd: RangeOptions<Vec<u8>> = RangeOptions::between(b"a".to_vec(), b"m".to_vec(), false);
        assert_eq!(fwd.gte.as_deref(), Some(&b"a"[..]));
        assert_eq!(fwd.lte.as_deref(), Some(&b"m"[..]));

        let rev: RangeOptions<Vec<u8>> = RangeOptions::between(b"m".to_vec(), b"a".to_vec(), true);
        assert_eq!(rev.gte.as_deref(), Some(&b"a"[..]));
        assert_eq!(rev.lte.as_deref(), Some(&b"m"[..]));
        assert!(rev.reverse);
    }

    #[test]
    fn test_exclusive_bound_wins() {
        let r = range().gte(b"a".to_vec()).gt(b"b".to_vec());
        assert!(!r.contains(b"b"));
        assert!(r.contains(b"c"));
    }

    #[test]
    fn test_contains() {
        let r = range().gte(b"b".to_vec()).lt(b"d".to_vec());
        assert!(!r.contains(b"a"));
        assert!(r.contains(b"b"));
        assert!(r.contains(b"c\xff"));
        assert!(!r.contains(b"d"));
    }

    #[test]
    fn test_empty_ranges() {
        assert!(range().gte(b"b".to_vec()).lt(b"b".to_vec()).is_empty());
        assert!(range().gt(b"c".to_vec()).lte(b"a".to_vec()).is_empty());
        assert!(!range().gte(b"b".to_vec()).lte(b"b".to_vec()).is_empty());
        assert!(range().limit(0).is_empty());
        assert!(!range().is_empty());
    }
}
