//! The reference-counted cell that backs every entry in the map.
//!
//! A `ReferenceCell` is the indirection between a key lookup and a value: it holds the value,
//! an optional one-shot finalizer, and a count of outstanding holders. The cell outlives the
//! value it protects, so inspecting `count` after a final release never touches freed memory.

/// Outcome of [`ReferenceCell::refdec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefdecOutcome {
    /// The count reached zero; the finalizer (if any) has already run.
    Released,
    /// The count is still positive; the object is still alive.
    StillAlive(usize),
}

/// A value, an optional finalizer, and a non-negative reference count.
///
/// Invariants:
/// - `count == 0` implies `object` is `None`.
/// - once `count` reaches zero it never rises again; `refinc` on an exhausted cell fails.
/// - `refdec` on an already-zero cell is a no-op, not an underflow.
pub struct ReferenceCell<V> {
    object: Option<V>,
    finalizer: Option<Box<dyn FnOnce(V) + Send>>,
    count: usize,
}

impl<V> ReferenceCell<V> {
    /// Create a cell holding `object` with count 1 and an optional finalizer.
    pub fn new(object: V, finalizer: Option<Box<dyn FnOnce(V) + Send>>) -> ReferenceCell<V> {
        ReferenceCell {
            object: Some(object),
            finalizer,
            count: 1,
        }
    }

    /// Raise the count by one. Fails (returns `false`) if the cell is already exhausted.
    pub fn refinc(&mut self) -> bool {
        if self.count == 0 {
            false
        } else {
            self.count += 1;
            true
        }
    }

    /// Lower the count by one.
    ///
    /// If the count reaches zero, the finalizer runs on the object and the object slot is
    /// cleared. Calling this on an already-zero cell is a benign no-op.
    pub fn refdec(&mut self) -> RefdecOutcome {
        if self.count == 0 {
            return RefdecOutcome::Released;
        }

        self.count -= 1;
        if self.count == 0 {
            self.free_object();
            RefdecOutcome::Released
        } else {
            RefdecOutcome::StillAlive(self.count)
        }
    }

    /// The current object, if any.
    pub fn get_object(&self) -> Option<&V> {
        self.object.as_ref()
    }

    /// The current count.
    pub fn get_count(&self) -> usize {
        self.count
    }

    /// Replace the finalizer. Setting it to `None` before the entry is dropped transfers
    /// ownership of the object out without running the finalizer on it.
    pub fn set_finalizer(&mut self, finalizer: Option<Box<dyn FnOnce(V) + Send>>) {
        self.finalizer = finalizer;
    }

    /// Take the object out of the cell, leaving it empty, without running the finalizer or
    /// touching `count`. Used by `remove`'s detach-without-destroy protocol.
    pub fn take_object(&mut self) -> Option<V> {
        self.object.take()
    }

    /// Force destruction of the object: run the finalizer (if both it and the object are
    /// present) and clear the object slot. Does not change `count`.
    pub fn free_object(&mut self) {
        if let (Some(object), Some(finalizer)) = (self.object.take(), self.finalizer.take()) {
            finalizer(object);
        } else {
            self.object = None;
        }
    }
}

/// Mirrors `RC_free` in the source: a cell's teardown unconditionally runs its finalizer on
/// whatever object remains, regardless of `count`. This is what makes the table-wide teardown in
/// `ChainedHashTable`/`RefCountedMap`/`SyncRefCountedMap` — and an implicit drop of a container
/// with still-live entries — finalize every remaining value exactly once rather than leaking the
/// boxed finalizer unexecuted.
impl<V> Drop for ReferenceCell<V> {
    fn drop(&mut self) {
        self.free_object();
    }
}
