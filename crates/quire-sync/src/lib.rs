//! Quire Sync - Change-feed replication
//!
//! This crate pulls documents from a remote change feed (CouchDB-style HTTP
//! or in-memory) and applies them to the local topic store, persisting the
//! feed cursor after every committed page.

pub mod convert;
pub mod couch;
pub mod feed;
pub mod memory;
pub mod sync;

// Re-exports
pub use couch::CouchFeed;
pub use feed::{ChangeFeed, FeedBatch, FeedRecord};
pub use memory::MemoryFeed;
pub use sync::{ConversionFailure, ReplicationSync, SyncMode, SyncOptions, SyncReport};
