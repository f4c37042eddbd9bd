//! The explicit root set: handles an embedder has pinned directly.
//!
//! Long-lived references the embedder wants the collector to always treat
//! as reachable (the global object, an interned-atom table, anything that
//! does not sit on a mutator's C stack and so can't be covered by the
//! [`crate::shadow_stack::ShadowStack`]) are registered here.

use alloc::vec::Vec;

use crate::handle::Handle;

/// A capacity-bounded set of root handles, scanned in full on every
/// collection.
pub struct RootSet {
    handles: Vec<Handle>,
    capacity: usize,
}

impl RootSet {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        RootSet {
            handles: Vec::with_capacity(capacity.min(1 << 16)),
            capacity,
        }
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Registers `handle` as a permanent root. Idempotent: adding an
    /// already-registered handle again is a no-op rather than a duplicate
    /// entry, so unbalanced add/remove calls cannot silently grow the set.
    ///
    /// Returns `false` if the set is at capacity and `handle` was not
    /// already present.
    pub fn add(&mut self, handle: Handle) -> bool {
        if handle.is_null() || self.handles.contains(&handle) {
            return true;
        }
        if self.handles.len() >= self.capacity {
            return false;
        }
        self.handles.push(handle);
        true
    }

    /// Unregisters `handle`. A no-op if it was never registered.
    pub fn remove(&mut self, handle: Handle) {
        if let Some(pos) = self.handles.iter().position(|h| *h == handle) {
            self.handles.swap_remove(pos);
        }
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.handles.contains(&handle)
    }

    /// Iterates every registered root, for the mark phase.
    pub fn iter(&self) -> impl Iterator<Item = Handle> + '_ {
        self.handles.iter().copied()
    }

    /// Drops every registered root, used by `reset`/`full_reset`.
    pub fn clear(&mut self) {
        self.handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_contains() {
        let mut roots = RootSet::new(4);
        let h = Handle::from_raw(1);
        assert!(roots.add(h));
        assert!(roots.contains(h));
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn add_is_idempotent() {
        let mut roots = RootSet::new(4);
        let h = Handle::from_raw(1);
        roots.add(h);
        roots.add(h);
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn null_handle_never_added() {
        let mut roots = RootSet::new(4);
        roots.add(Handle::NULL);
        assert_eq!(roots.len(), 0);
    }

    #[test]
    fn remove_is_a_no_op_when_absent() {
        let mut roots = RootSet::new(4);
        roots.remove(Handle::from_raw(9));
        assert_eq!(roots.len(), 0);
    }

    #[test]
    fn add_fails_past_capacity() {
        let mut roots = RootSet::new(1);
        assert!(roots.add(Handle::from_raw(1)));
        assert!(!roots.add(Handle::from_raw(2)));
    }

    #[test]
    fn clear_empties_the_set() {
        let mut roots = RootSet::new(4);
        roots.add(Handle::from_raw(1));
        roots.add(Handle::from_raw(2));
        roots.clear();
        assert!(roots.is_empty());
    }
}
