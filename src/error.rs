//! Error types for the map's public API.

use quick_error::quick_error;

quick_error! {
    /// An error returned by a `RefCountedMap`/`SyncRefCountedMap` operation.
    #[derive(Debug, PartialEq, Eq)]
    pub enum MapError {
        /// `insert` was called with a key already live in the map.
        KeyExists {
            display("key already exists in the map")
        }
        /// `refdec`, `delete`, or `remove` was called with a key not present in the map.
        KeyNotFound {
            display("key not found in the map")
        }
    }
}

/// Error returned by the hash table's own `insert`, crate-internal.
///
/// Kept distinct from `MapError` because the table has no notion of reference counting or
/// sealing — only key presence.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TableError {
    KeyExists,
}
