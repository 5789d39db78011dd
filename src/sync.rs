//! The synchronized variant of [`RefCountedMap`](crate::map::RefCountedMap).
//!
//! A map-wide lock `M` guards the table structure (bucket arrays, chains, `nelems`, migration
//! state). Each entry is stored behind its own `Arc<Mutex<_>>`, call it `E`, which protects the
//! reference count and the seal flag independently of `M` — this is what lets the value's
//! finalizer run without holding the table lock.
//!
//! Lock order is always `M` then `E`. The source this is modeled on (`RCHashTable_sync.c`)
//! releases `E` before re-acquiring `M` to perform a final removal, which leaves a window where
//! another thread can find and lock the same, about-to-be-destroyed entry (see `SPEC_FULL.md` §9,
//! Open Question 2). Re-acquiring `M` while still holding `E` to close that window head-on would
//! introduce a different hazard: another thread doing `M` (held) → blocked-on-`E` would deadlock
//! against this thread's `E` (held) → blocked-on-`M`. Instead, this implementation tombstones the
//! entry (a `removed` flag inside `E`) before releasing `E`; any thread that subsequently acquires
//! `E` for the same entry sees the tombstone and backs off immediately, so nothing ever touches
//! the entry between its refcount reaching zero and its removal from the table.

use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::cell::{RefdecOutcome, ReferenceCell};
use crate::config::TableConfig;
use crate::error::MapError;
use crate::map::{DeleteResult, RefdecResult};
use crate::table::{ChainedHashTable, InsertOutcome};

/// The value a [`SyncRefCountedMap`] stores per key: a cell, the seal flag, and the tombstone
/// used to close the removal race described above.
struct SyncEntry<V> {
    cell: ReferenceCell<V>,
    marked_for_removal: bool,
    removed: bool,
}

impl<V> SyncEntry<V> {
    fn new(value: V, finalizer: Option<Box<dyn FnOnce(V) + Send>>) -> SyncEntry<V> {
        SyncEntry {
            cell: ReferenceCell::new(value, finalizer),
            marked_for_removal: false,
            removed: false,
        }
    }
}

type Slot<V> = Arc<Mutex<SyncEntry<V>>>;

/// A thread-safe reference-counted map.
///
/// `V: Clone` is required because `refinc` must hand back the object after releasing the table
/// lock `M` — the returned value can no longer borrow from the table the way a single-threaded
/// lookup could. In practice `V` is usually itself a cheap-to-clone handle (an `Arc<T>`, a file
/// descriptor wrapper, …), so this mirrors the source's own semantics of handing back a shared
/// pointer rather than a deep copy.
pub struct SyncRefCountedMap<K, V> {
    table: Mutex<ChainedHashTable<K, Slot<V>>>,
}

impl<K: Eq, V: Clone> SyncRefCountedMap<K, V> {
    pub fn new(initial_capacity: usize) -> SyncRefCountedMap<K, V> {
        SyncRefCountedMap::with_config(initial_capacity, TableConfig::new())
    }

    pub fn with_config(initial_capacity: usize, config: TableConfig) -> SyncRefCountedMap<K, V> {
        SyncRefCountedMap {
            table: Mutex::new(ChainedHashTable::new(initial_capacity, config)),
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    pub fn load_factor(&self) -> f64 {
        self.table.lock().load_factor()
    }

    /// Change the upper load-factor bound (percent) after construction.
    pub fn set_max_load_pct(&self, pct: u32) {
        self.table.lock().set_max_load_pct(pct);
    }

    /// Change the lower load-factor bound (percent) after construction.
    pub fn set_min_load_pct(&self, pct: u32) {
        self.table.lock().set_min_load_pct(pct);
    }

    /// Change the migration step budget after construction. Setting this to 0 disables resizing.
    pub fn set_max_rehashes_per_op(&self, n: u32) {
        self.table.lock().set_max_rehashes_per_op(n);
    }

    /// Insert a new key with count 1. The entry (and its mutex) is allocated before `M` is
    /// acquired, so construction never happens while the table lock is held.
    pub fn insert(
        &self,
        key: K,
        hash: u64,
        value: V,
        finalizer: Option<Box<dyn FnOnce(V) + Send>>,
    ) -> Result<(), MapError> {
        let slot: Slot<V> = Arc::new(Mutex::new(SyncEntry::new(value, finalizer)));

        let mut table = self.table.lock();
        match table.insert(key, hash, slot) {
            Ok(()) => Ok(()),
            Err(InsertOutcome::KeyExists) => Err(MapError::KeyExists),
            Err(InsertOutcome::RehashDegraded) => Ok(()),
        }
    }

    /// Find the slot for `key` under `M`, cloning the `Arc` so the table lock can be released
    /// while the entry lock does the refcount work.
    fn find_slot(&self, key: &K, hash: u64) -> Option<Slot<V>> {
        let mut table = self.table.lock();
        table.get_mut(key, hash).map(|slot| slot.clone())
    }

    /// Look up `key` and, if present, not sealed, and not tombstoned, increment its count and
    /// return a clone of the value.
    pub fn refinc(&self, key: &K, hash: u64) -> Option<V> {
        let slot = self.find_slot(key, hash)?;
        let mut entry = slot.lock();
        if entry.marked_for_removal || entry.removed {
            return None;
        }
        if !entry.cell.refinc() {
            return None;
        }
        entry.cell.get_object().cloned()
    }

    /// Release one reference. Removes the entry (running its finalizer) if this was the last
    /// one.
    pub fn refdec(&self, key: &K, hash: u64) -> Result<RefdecResult, MapError> {
        let slot = self.find_slot(key, hash).ok_or(MapError::KeyNotFound)?;
        let released = {
            let mut entry = slot.lock();
            if entry.removed {
                // Another thread's concurrent call already won the race to finalize this entry.
                return Err(MapError::KeyNotFound);
            }
            match entry.cell.refdec() {
                RefdecOutcome::Released => {
                    entry.removed = true;
                    true
                }
                RefdecOutcome::StillAlive(n) => {
                    return Ok(RefdecResult::StillAlive(n));
                }
            }
        };

        if released {
            let mut table = self.table.lock();
            table.remove(key, hash);
            Ok(RefdecResult::Released)
        } else {
            unreachable!()
        }
    }

    /// Soft-evict `key`. See [`RefCountedMap::delete`](crate::map::RefCountedMap::delete) for
    /// the semantics; the synchronized protocol is described in the module-level docs.
    pub fn delete(&self, key: &K, hash: u64) -> Result<DeleteResult, MapError> {
        let slot = self.find_slot(key, hash).ok_or(MapError::KeyNotFound)?;
        enum Step {
            Released,
            Sealed(usize),
        }
        let step = {
            let mut entry = slot.lock();
            if entry.removed {
                return Err(MapError::KeyNotFound);
            }
            match entry.cell.refdec() {
                RefdecOutcome::Released => {
                    entry.removed = true;
                    Step::Released
                }
                RefdecOutcome::StillAlive(n) => {
                    entry.marked_for_removal = true;
                    Step::Sealed(n)
                }
            }
        };

        match step {
            Step::Released => {
                let mut table = self.table.lock();
                table.remove(key, hash);
                Ok(DeleteResult::Released)
            }
            Step::Sealed(n) => Ok(DeleteResult::Sealed(n)),
        }
    }

    /// Detach `key` without destroying its value. Suppresses the finalizer and hands ownership
    /// of the object back to the caller.
    pub fn remove(&self, key: &K, hash: u64) -> Option<V> {
        let slot = self.find_slot(key, hash)?;
        let object = {
            let mut entry = slot.lock();
            if entry.removed {
                return None;
            }
            entry.removed = true;
            entry.cell.set_finalizer(None);
            entry.cell.take_object()
        };

        let mut table = self.table.lock();
        table.remove(key, hash);
        object
    }
}

/// Mirrors `RCHashTable_free_sync` in the source, which itself just delegates to
/// `RCHashTable_free`. The source's caveat that destroying the synchronized map while operations
/// are in flight is the caller's responsibility (`SPEC_FULL.md` §9, Open Question 4) is upgraded
/// here from a documentation note to a compiler-enforced one: `Drop::drop` takes `&mut self`, so
/// no other thread can be holding a `&SyncRefCountedMap` (and thus racing a lookup against this
/// teardown) while this runs. The actual finalization of any still-live entries happens a layer
/// down: dropping `self.table` drops every remaining `Arc<Mutex<SyncEntry<V>>>` slot, and once a
/// slot's last `Arc` goes away its `ReferenceCell` is force-finalized by its own `Drop`.
impl<K: Eq, V: Clone> Drop for SyncRefCountedMap<K, V> {
    fn drop(&mut self) {
        debug!("dropping SyncRefCountedMap with {} live entries", self.table.lock().len());
    }
}
