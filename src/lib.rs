//! An in-process associative container that maps opaque keys to reference-counted values.
//!
//! Multiple logical owners can share a cached resource (a connection handle, a parsed artifact,
//! a decoded asset) keyed by identity. Value destruction is deferred until the last holder
//! releases it, but any holder may also request eviction ahead of that moment — "mark for
//! removal" — without disturbing holders that already acquired a reference.
//!
//! Two variants are exposed:
//!
//! - [`RefCountedMap`] — single-threaded, no locking overhead.
//! - [`SyncRefCountedMap`] — thread-safe, built on a map-wide lock plus a per-entry lock so that
//!   value destructors never run while the table-wide lock is held.
//!
//! Both are built on [`table::ChainedHashTable`], an incremental (split-phase) chained hash
//! table: it amortizes the cost of a resize by keeping two backing tables alive at once and
//! migrating a bounded number of buckets per subsequent operation, rather than stopping the
//! world for a full rehash.
//!
//! Hashing and key equality are the caller's responsibility: every call takes an already-computed
//! hash alongside the key, and `K: Eq` stands in for the comparator the caller would otherwise
//! supply.

mod cell;
mod config;
mod entry;
mod error;
mod map;
mod sync;
mod table;

pub use cell::{ReferenceCell, RefdecOutcome};
pub use config::TableConfig;
pub use error::MapError;
pub use map::{DeleteResult, RefCountedMap, RefdecResult};
pub use sync::SyncRefCountedMap;
pub use table::{ChainedHashTable, InsertOutcome};
