//! Quire Store - Local knowledge-base data layer
//!
//! This crate layers prefix-virtualized namespaces, write coalescing and
//! secondary indexes over a single ordered key-value store (redb on disk,
//! a `BTreeMap` in tests).

pub mod backend;
pub mod batch;
pub mod context;
pub mod index;
pub mod indexed;
pub mod indexes;
pub mod memory;
pub mod namespace;
pub mod redb_store;
mod tables;

// Re-exports
pub use backend::{BackendError, BatchOp, OrderedStore, RangeOptions};
pub use batch::BatchCoalescer;
pub use context::{OpenOutcome, StoreContext};
pub use index::{DocOp, IndexFn, PriorValues, SecondaryIndex};
pub use indexed::IndexedNamespace;
pub use memory::MemoryStore;
pub use namespace::{Namespace, NsOp};
pub use redb_store::RedbStore;
