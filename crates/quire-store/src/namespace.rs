//! Prefix-virtualized keyspaces.
//!
//! A [`Namespace`] presents one logical key-value map carved out of the shared
//! physical store. Local key `k` in namespace `p` lives at `!p!k`; a child
//! namespace `c` of `p` lives under `!p!!c!`. Local keys must not contain the
//! separator, so:
//!
//! * sibling namespaces whose names are string prefixes of each other (`a`
//!   and `ab`) cannot overlap: after `!a` comes `!` for one and `b` for the
//!   other;
//! * a parent's own keys always start with a byte above the separator, so its
//!   scans never reach into a child namespace.

use crate::backend::{OrderedStore, RangeOptions, StoreIter};
use crate::batch::BatchCoalescer;
use quire_common::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::ops::Bound;
use std::sync::Arc;
use tracing::debug;

/// Separator between prefix segments and keys; sorts before every valid key byte.
pub const SEP: u8 = b'!';

/// Byte sorting after every byte of a UTF-8 key; used as an exclusive upper bound.
pub const MAX_BYTE: u8 = 0xFF;

/// One op of a namespace batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NsOp {
    Put { key: String, value: Vec<u8> },
    Del { key: String },
}

impl NsOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self::Put {
            key: key.into(),
            value: value.into(),
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

/// Reject keys the prefix encoding cannot represent unambiguously
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidKey {
            key: key.to_string(),
            reason: "key is empty",
        });
    }
    if key.as_bytes().contains(&SEP) {
        return Err(Error::InvalidKey {
            key: key.to_string(),
            reason: "key contains the separator '!'",
        });
    }
    Ok(())
}

/// A logical keyspace inside a shared ordered store
#[derive(Clone)]
pub struct Namespace {
    store: Arc<dyn OrderedStore>,
    name: String,
    base: Vec<u8>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("store", &self.store.name())
            .finish()
    }
}

impl Namespace {
    /// Top-level namespace `name`
    pub fn root(store: Arc<dyn OrderedStore>, name: &str) -> Result<Self> {
        validate_key(name)?;
        let mut base = Vec::with_capacity(name.len() + 2);
        base.push(SEP);
        base.extend_from_slice(name.as_bytes());
        base.push(SEP);
        Ok(Self {
            store,
            name: name.to_string(),
            base,
        })
    }

    /// Child namespace `name` nested inside this one
    pub fn sub(&self, name: &str) -> Result<Self> {
        validate_key(name)?;
        let mut base = self.base.clone();
        base.push(SEP);
        base.extend_from_slice(name.as_bytes());
        base.push(SEP);
        Ok(Self {
            store: self.store.clone(),
            name: format!("{}/{}", self.name, name),
            base,
        })
    }

    /// Path of this namespace, `/`-joined for nested ones
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical prefix every key of this namespace starts with
    #[must_use]
    pub fn prefix(&self) -> &[u8] {
        &self.base
    }

    /// Shared physical store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn OrderedStore> {
        &self.store
    }

    /// Physical key for local key `key`
    #[must_use]
    pub fn encode_key(&self, key: &str) -> Vec<u8> {
        let mut physical = Vec::with_capacity(self.base.len() + key.len());
        physical.extend_from_slice(&self.base);
        physical.extend_from_slice(key.as_bytes());
        physical
    }

    /// Local key for a physical key of this namespace, `None` if it belongs elsewhere
    #[must_use]
    pub fn decode_key(&self, physical: &[u8]) -> Option<String> {
        let local = physical.strip_prefix(self.base.as_slice())?;
        if local.first().is_none_or(|b| *b == SEP) {
            return None;
        }
        String::from_utf8(local.to_vec()).ok()
    }

    /// Lowest physical key a local key can have (children sort below it)
    fn first_key(&self) -> Vec<u8> {
        let mut key = self.base.clone();
        key.push(SEP + 1);
        key
    }

    /// Exclusive physical upper bound of the whole namespace, children included
    fn end_key(&self) -> Vec<u8> {
        let mut key = self.base.clone();
        key.push(MAX_BYTE);
        key
    }

    fn wrap(&self, op: &'static str, key: &str) -> impl FnOnce(crate::BackendError) -> Error {
        let namespace = self.name.clone();
        let key = key.to_string();
        move |e| Error::store(op, namespace, key, e)
    }

    /// Read `key`, failing with `NotFound` when absent
    pub fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.try_get(key)?
            .ok_or_else(|| Error::not_found(&self.name, key))
    }

    /// Read `key`, `None` when absent
    pub fn try_get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        self.store
            .get(&self.encode_key(key))
            .map_err(self.wrap("get", key))
    }

    /// Write `key`
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.store
            .put(&self.encode_key(key), value)
            .map_err(self.wrap("put", key))
    }

    /// Remove `key`
    pub fn del(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.store
            .del(&self.encode_key(key))
            .map_err(self.wrap("del", key))
    }

    /// Apply `ops` as one atomic physical batch
    pub fn batch(&self, ops: Vec<NsOp>) -> Result<usize> {
        let mut batch = BatchCoalescer::new(self.store.clone(), self.name.clone());
        for op in ops {
            match op {
                NsOp::Put { key, value } => self.stage_put(&mut batch, &key, value)?,
                NsOp::Del { key } => self.stage_del(&mut batch, &key)?,
            }
        }
        batch.flush()
    }

    /// Queue a put of `key` into a pending batch
    pub fn stage_put(&self, batch: &mut BatchCoalescer, key: &str, value: Vec<u8>) -> Result<()> {
        validate_key(key)?;
        batch.put(self.encode_key(key), value);
        Ok(())
    }

    /// Queue a delete of `key` into a pending batch
    pub fn stage_del(&self, batch: &mut BatchCoalescer, key: &str) -> Result<()> {
        validate_key(key)?;
        batch.del(self.encode_key(key));
        Ok(())
    }

    /// Iterate local keys within `range`, in key order (or reverse)
    pub fn iterate(&self, range: &RangeOptions<String>) -> Result<NamespaceIter> {
        let physical = self.physical_range(range);
        let inner = self
            .store
            .iterate(&physical)
            .map_err(self.wrap("iterate", range_start(range)))?;
        Ok(NamespaceIter {
            inner,
            namespace: self.clone(),
        })
    }

    /// Every entry of the namespace in ascending order
    pub fn iter_all(&self) -> Result<NamespaceIter> {
        self.iterate(&RangeOptions::all())
    }

    /// Rewrite local bounds into physical ones, clamped to this namespace
    fn physical_range(&self, range: &RangeOptions<String>) -> RangeOptions<Vec<u8>> {
        let first = self.first_key();
        let mut physical = RangeOptions {
            reverse: range.reverse,
            limit: range.limit,
            ..RangeOptions::default()
        };
        match range.lower() {
            Bound::Included(k) if self.encode_key(k) >= first => {
                physical.gte = Some(self.encode_key(k));
            }
            Bound::Excluded(k) if self.encode_key(k) >= first => {
                physical.gt = Some(self.encode_key(k));
            }
            _ => physical.gte = Some(first),
        }
        match range.upper() {
            Bound::Included(k) => physical.lte = Some(self.encode_key(k)),
            Bound::Excluded(k) => physical.lt = Some(self.encode_key(k)),
            Bound::Unbounded => physical.lt = Some(self.end_key()),
        }
        physical
    }

    /// Delete every key of this namespace and of its children
    pub fn clear(&self) -> Result<usize> {
        let range = RangeOptions::all()
            .gte(self.base.clone())
            .lt(self.end_key());
        let mut batch = BatchCoalescer::new(self.store.clone(), self.name.clone());
        for entry in self.store.iterate(&range).map_err(self.wrap("clear", ""))? {
            let (key, _) = entry.map_err(self.wrap("clear", ""))?;
            batch.del(key);
        }
        let removed = batch.flush()?;
        debug!("Cleared {} keys from namespace {}", removed, self.name);
        Ok(removed)
    }

    // ---- JSON documents ----

    /// Read and decode a JSON document
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let bytes = self.get(key)?;
        self.decode_json(key, &bytes)
    }

    /// Read and decode a JSON document, `None` when absent
    pub fn try_get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.try_get(key)?
            .map(|bytes| self.decode_json(key, &bytes))
            .transpose()
    }

    /// Encode and write a JSON document
    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| Error::store("encode", self.name.clone(), key, e))?;
        self.put(key, &bytes)
    }

    /// Decode a JSON document read from this namespace
    pub fn decode_json<T: DeserializeOwned>(&self, key: &str, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::store("decode", self.name.clone(), key, e))
    }
}

fn range_start(range: &RangeOptions<String>) -> &str {
    match range.lower() {
        Bound::Included(k) | Bound::Excluded(k) => k,
        Bound::Unbounded => "",
    }
}

/// Lazy cursor over one namespace; yields local keys
pub struct NamespaceIter {
    inner: StoreIter,
    namespace: Namespace,
}

impl Iterator for NamespaceIter {
    type Item = Result<(String, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some(match entry {
            Ok((physical, value)) => match self.namespace.decode_key(&physical) {
                Some(key) => Ok((key, value)),
                None => Err(Error::Deserialization(format!(
                    "physical key {} is not a key of namespace {}",
                    String::from_utf8_lossy(&physical),
                    self.namespace.name
                ))),
            },
            Err(e) => Err(Error::store("iterate", self.namespace.name.clone(), "", e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn store() -> Arc<dyn OrderedStore> {
        Arc::new(MemoryStore::new())
    }

    fn keys(ns: &Namespace, range: &RangeOptions<String>) -> Vec<String> {
        ns.iterate(range)
            .unwrap()
            .map(|e| e.unwrap().0)
            .collect()
    }

    #[test]
    fn test_key_roundtrip() {
        let ns = Namespace::root(store(), "topics").unwrap();
        for key in ["a", "Zebra", "topic:alpha beta", "日本語"] {
            let physical = ns.encode_key(key);
            assert!(physical.starts_with(b"!topics!"));
            assert_eq!(ns.decode_key(&physical).as_deref(), Some(key));
        }
        assert_eq!(ns.decode_key(b"!other!a"), None);
    }

    #[test]
    fn test_get_put_del() {
        let ns = Namespace::root(store(), "configs").unwrap();
        assert!(ns.get("missing").unwrap_err().is_not_found());
        assert_eq!(ns.try_get("missing").unwrap(), None);

        ns.put("k", b"v").unwrap();
        assert_eq!(ns.get("k").unwrap(), b"v".to_vec());
        ns.del("k").unwrap();
        assert!(ns.get("k").unwrap_err().is_not_found());
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let ns = Namespace::root(store(), "topics").unwrap();
        assert!(matches!(ns.put("a!b", b""), Err(Error::InvalidKey { .. })));
        assert!(matches!(ns.put("", b""), Err(Error::InvalidKey { .. })));
        assert!(matches!(ns.try_get("a!b"), Err(Error::InvalidKey { .. })));
        assert!(matches!(ns.get_json::<u32>("a!b"), Err(Error::InvalidKey { .. })));
        assert!(Namespace::root(store(), "bad!name").is_err());
    }

    #[test]
    fn test_sibling_prefixes_do_not_bleed() {
        let shared = store();
        let a = Namespace::root(shared.clone(), "a").unwrap();
        let ab = Namespace::root(shared.clone(), "ab").unwrap();
        a.put("x", b"1").unwrap();
        a.put("zz", b"2").unwrap();
        ab.put("x", b"3").unwrap();
        ab.put("a", b"4").unwrap();

        assert_eq!(keys(&a, &RangeOptions::all()), vec!["x", "zz"]);
        assert_eq!(keys(&ab, &RangeOptions::all()), vec!["a", "x"]);
        assert_eq!(a.get("x").unwrap(), b"1".to_vec());
        assert_eq!(ab.get("x").unwrap(), b"3".to_vec());
    }

    #[test]
    fn test_nested_namespaces() {
        let shared = store();
        let parent = Namespace::root(shared.clone(), "topics").unwrap();
        let child = parent.sub("archive").unwrap();
        assert_eq!(child.name(), "topics/archive");
        assert_eq!(child.prefix(), b"!topics!!archive!");

        parent.put("live", b"1").unwrap();
        child.put("old", b"2").unwrap();

        assert_eq!(keys(&parent, &RangeOptions::all()), vec!["live"]);
        assert_eq!(keys(&child, &RangeOptions::all()), vec!["old"]);
        assert_eq!(keys(&parent, &RangeOptions::all().reverse()), vec!["live"]);
        // Bounds below every valid key are clamped to the namespace
        assert_eq!(keys(&parent, &RangeOptions::all().gte("")), vec!["live"]);
        // A parent cannot address a child's physical key through a local key
        assert!(matches!(
            parent.try_get("!archive!old"),
            Err(Error::InvalidKey { .. })
        ));
        assert!(matches!(parent.get("!archive!old"), Err(Error::InvalidKey { .. })));

        assert_eq!(parent.clear().unwrap(), 2);
        assert!(child.try_get("old").unwrap().is_none());
    }

    #[test]
    fn test_reverse_matches_reversed_ascending() {
        let ns = Namespace::root(store(), "topics").unwrap();
        for key in ["b", "d", "a", "e", "c"] {
            ns.put(key, key.as_bytes()).unwrap();
        }

        let bounded = RangeOptions::all().gte("b").lt("e");
        let mut ascending = keys(&ns, &bounded);
        let descending = keys(&ns, &bounded.clone().reverse());
        ascending.reverse();
        assert_eq!(ascending, descending);
        assert_eq!(descending, vec!["d", "c", "b"]);

        // Iteration-order bounds are swapped for reverse scans
        let rev = RangeOptions::between("d".to_string(), "b".to_string(), true);
        assert_eq!(keys(&ns, &rev), vec!["d", "c", "b"]);
        assert_eq!(keys(&ns, &RangeOptions::all().reverse().limit(2)), vec!["e", "d"]);
    }

    #[test]
    fn test_batch_is_one_physical_call() {
        let memory = Arc::new(MemoryStore::new());
        let ns = Namespace::root(memory.clone(), "topics").unwrap();
        let written = ns
            .batch(vec![NsOp::put("a", "1"), NsOp::put("b", "2"), NsOp::del("a")])
            .unwrap();
        assert_eq!(written, 3);
        assert_eq!(memory.stats().batches, 1);
        assert_eq!(keys(&ns, &RangeOptions::all()), vec!["b"]);
    }

    #[test]
    fn test_json_helpers() {
        let ns = Namespace::root(store(), "configs").unwrap();
        ns.put_json("answer", &42u32).unwrap();
        assert_eq!(ns.get_json::<u32>("answer").unwrap(), 42);
        assert_eq!(ns.try_get_json::<u32>("nothing").unwrap(), None);

        ns.put("garbled", b"{not json").unwrap();
        let err = ns.get_json::<u32>("garbled").unwrap_err();
        assert!(err.to_string().contains("configs/garbled"));
    }
}
