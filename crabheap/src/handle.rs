//! The handle table: the level of indirection that makes compaction
//! transparent to the engine.
//!
//! Every reference the engine holds into the heap is a [`Handle`], never a
//! raw pointer. Compaction moves payloads and rewrites this table; it never
//! needs to find and patch pointers scattered through engine data
//! structures.

use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::error::HandleError;

/// A 32-bit handle naming a live heap object. Stable across relocation.
///
/// Handle `0` is reserved and never names a live object.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// The reserved null handle.
    pub const NULL: Handle = Handle(0);

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Handle(raw)
    }

    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    const fn index(self) -> usize {
        self.0 as usize
    }
}

impl Default for Handle {
    fn default() -> Self {
        Handle::NULL
    }
}

/// One slot of the handle table.
#[derive(Debug, Clone, Copy)]
struct HandleEntry {
    /// Current payload location, or `None` if the slot is free.
    ptr: Option<NonNull<u8>>,
    /// Bumped every time the slot is freed. Debug-only aid: lets tests and
    /// assertions notice a handle that outlived the object it named, even
    /// though the slot may since have been recycled for something else.
    generation: u32,
}

impl HandleEntry {
    const fn free() -> Self {
        HandleEntry {
            ptr: None,
            generation: 0,
        }
    }
}

/// Maps handles to current payload addresses.
///
/// Capacity is fixed at construction and must be chosen large enough that
/// the workload never exhausts it. Free slots are found
/// by scanning from a rotating cursor rather than always restarting at index
/// 1; this keeps allocation amortized O(1) while preserving the same
/// observable free-slot-reuse behavior (see DESIGN.md).
pub struct HandleTable {
    entries: Vec<HandleEntry>,
    capacity: usize,
    /// Where the next free-slot scan should start.
    next_hint: u32,
}

impl HandleTable {
    /// Creates a table with room for `capacity` live handles (plus the
    /// reserved null slot at index 0).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity.saturating_add(1).min(1 << 20));
        entries.push(HandleEntry::free()); // index 0: the null handle, never allocated
        HandleTable {
            entries,
            capacity,
            next_hint: 1,
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently in use (excludes the reserved null slot).
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.entries.iter().skip(1).filter(|e| e.ptr.is_some()).count()
    }

    /// Finds a free slot and binds it to `ptr`, returning the new handle.
    pub fn alloc(&mut self, ptr: NonNull<u8>) -> Result<Handle, HandleError> {
        let len = self.entries.len();

        // Scan the already-materialized slots once around from the hint.
        for offset in 0..len.saturating_sub(1) {
            let idx = 1 + ((self.next_hint as usize - 1 + offset) % (len - 1));
            if self.entries[idx].ptr.is_none() {
                self.entries[idx].ptr = Some(ptr);
                self.next_hint = (idx as u32) + 1;
                return Ok(Handle(idx as u32));
            }
        }

        // No free slot among existing entries; grow if capacity allows.
        if len <= self.capacity {
            let idx = len as u32;
            self.entries.push(HandleEntry {
                ptr: Some(ptr),
                generation: 0,
            });
            self.next_hint = idx + 1;
            return Ok(Handle(idx));
        }

        Err(HandleError::TableFull)
    }

    /// Returns the current payload pointer for `handle`, or `None` if the
    /// handle is null, out of range, or names a freed slot.
    #[inline]
    #[must_use]
    pub fn dereference(&self, handle: Handle) -> Option<NonNull<u8>> {
        if handle.is_null() {
            return None;
        }
        self.entries.get(handle.index())?.ptr
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self, handle: Handle) -> bool {
        self.dereference(handle).is_some()
    }

    /// The debug-only generation counter for `handle`'s slot.
    #[must_use]
    pub fn generation(&self, handle: Handle) -> Option<u32> {
        self.entries.get(handle.index()).map(|e| e.generation)
    }

    /// Repoints `handle` at a new payload address. Used exclusively by
    /// compaction: the object itself never moves without the collector
    /// calling this.
    ///
    /// # Panics
    /// Panics if `handle` does not name a currently-occupied slot; compaction
    /// only ever calls this for handles it just confirmed are live.
    pub fn update(&mut self, handle: Handle, new_ptr: NonNull<u8>) {
        let entry = &mut self.entries[handle.index()];
        debug_assert!(entry.ptr.is_some(), "update() on a freed handle");
        entry.ptr = Some(new_ptr);
    }

    /// Frees `handle`'s slot, making it available for reuse, and bumps its
    /// generation so any surviving copy of the old handle is debuggably
    /// stale.
    pub fn free(&mut self, handle: Handle) {
        if handle.is_null() {
            return;
        }
        if let Some(entry) = self.entries.get_mut(handle.index()) {
            entry.ptr = None;
            entry.generation = entry.generation.wrapping_add(1);
        }
    }

    /// Reuses the header's recorded handle if the table still agrees it
    /// points at `ptr`;
    /// otherwise the handle is stale (most commonly after a `full_reset`)
    /// and a fresh one is allocated. Returns `(handle, reused)`.
    pub fn get_or_create(
        &mut self,
        header_handle: Handle,
        ptr: NonNull<u8>,
    ) -> Result<(Handle, bool), HandleError> {
        if !header_handle.is_null() {
            if let Some(existing) = self.dereference(header_handle) {
                if existing == ptr {
                    return Ok((header_handle, true));
                }
            }
            log::debug!(
                "stale handle {:?} in header does not match payload; allocating fresh handle",
                header_handle
            );
        }
        self.alloc(ptr).map(|h| (h, false))
    }

    /// Clears every slot except the reserved null slot, used between
    /// independent script executions. Generation counters are
    /// left untouched so stale handles from before the reset remain
    /// debuggably distinguishable.
    pub fn reset(&mut self) {
        for entry in self.entries.iter_mut().skip(1) {
            entry.ptr = None;
        }
        self.next_hint = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_ptr(offset: usize) -> NonNull<u8> {
        NonNull::new(offset.max(1) as *mut u8).unwrap()
    }

    #[test]
    fn handle_zero_is_always_invalid() {
        let table = HandleTable::new(8);
        assert!(!table.is_valid(Handle::NULL));
    }

    #[test]
    fn alloc_and_dereference_roundtrip() {
        let mut table = HandleTable::new(8);
        let p = dummy_ptr(0x1000);
        let h = table.alloc(p).unwrap();
        assert!(!h.is_null());
        assert_eq!(table.dereference(h), Some(p));
    }

    #[test]
    fn free_then_reuse_bumps_generation() {
        let mut table = HandleTable::new(8);
        let h1 = table.alloc(dummy_ptr(0x1000)).unwrap();
        let gen1 = table.generation(h1).unwrap();
        table.free(h1);
        assert!(!table.is_valid(h1));

        let h2 = table.alloc(dummy_ptr(0x2000)).unwrap();
        assert_eq!(h1, h2, "freed slot should be recycled");
        assert_eq!(table.generation(h2).unwrap(), gen1 + 1);
    }

    #[test]
    fn table_full_when_capacity_exhausted() {
        let mut table = HandleTable::new(2);
        table.alloc(dummy_ptr(0x1000)).unwrap();
        table.alloc(dummy_ptr(0x2000)).unwrap();
        assert_eq!(table.alloc(dummy_ptr(0x3000)), Err(HandleError::TableFull));
    }

    #[test]
    fn update_repoints_without_changing_handle() {
        let mut table = HandleTable::new(4);
        let h = table.alloc(dummy_ptr(0x1000)).unwrap();
        table.update(h, dummy_ptr(0x2000));
        assert_eq!(table.dereference(h), Some(dummy_ptr(0x2000)));
    }

    #[test]
    fn get_or_create_reuses_matching_handle() {
        let mut table = HandleTable::new(4);
        let p = dummy_ptr(0x1000);
        let h = table.alloc(p).unwrap();
        let (h2, reused) = table.get_or_create(h, p).unwrap();
        assert_eq!(h, h2);
        assert!(reused);
    }

    #[test]
    fn get_or_create_replaces_stale_handle() {
        let mut table = HandleTable::new(4);
        // Simulate a header whose handle field survived a full_reset: the
        // table has no memory of index 7 at all.
        let stale = Handle::from_raw(7);
        let p = dummy_ptr(0x9000);
        let (fresh, reused) = table.get_or_create(stale, p).unwrap();
        assert!(!reused);
        assert_ne!(fresh, stale);
        assert_eq!(table.dereference(fresh), Some(p));
    }

    #[test]
    fn get_or_create_replaces_handle_pointing_elsewhere() {
        let mut table = HandleTable::new(4);
        let other = table.alloc(dummy_ptr(0x1000)).unwrap();
        let p = dummy_ptr(0x5000);
        let (fresh, reused) = table.get_or_create(other, p).unwrap();
        assert!(!reused);
        assert_ne!(fresh, other);
    }

    #[test]
    fn reset_clears_all_but_preserves_capacity() {
        let mut table = HandleTable::new(4);
        let h = table.alloc(dummy_ptr(0x1000)).unwrap();
        table.reset();
        assert!(!table.is_valid(h));
        assert_eq!(table.capacity(), 4);
    }

    #[test]
    fn live_count_tracks_occupied_slots() {
        let mut table = HandleTable::new(8);
        assert_eq!(table.live_count(), 0);
        let h1 = table.alloc(dummy_ptr(0x1000)).unwrap();
        let _h2 = table.alloc(dummy_ptr(0x2000)).unwrap();
        assert_eq!(table.live_count(), 2);
        table.free(h1);
        assert_eq!(table.live_count(), 1);
    }
}
