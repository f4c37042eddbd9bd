//! The owning facade: wires the arena, handle table, root set, shadow
//! stack, and collector into the single object an embedder holds.

use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::arena::Arena;
use crate::config::HeapConfig;
use crate::error::{ArenaError, HandleError};
use crate::gc::{CollectionStats, GarbageCollector, TraceCallback};
use crate::handle::Handle;
use crate::header::TypeTag;
use crate::roots::RootSet;
use crate::shadow_stack::{ScopedRoot, ShadowStack};
use crate::value::TaggedValue;

/// Called when a finalizable object is reclaimed, with its payload address.
/// The object's bytes are still intact at the time of the call; they are
/// overwritten or moved immediately after it returns.
pub type FinalizerFn = fn(NonNull<u8>);

/// Point-in-time occupancy snapshot, returned by [`Heap::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub used_bytes: usize,
    pub available_bytes: usize,
    pub total_bytes: usize,
    pub handle_count: usize,
    pub root_count: usize,
    pub shadow_depth: usize,
}

/// A complete garbage-collected heap: one arena, one handle table, one root
/// set, one shadow stack, and the collector that ties them together.
///
/// Nothing about `Heap` is `Sync`; it is used by exactly one mutator thread
/// at a time.
pub struct Heap {
    arena: Arena,
    handles: crate::handle::HandleTable,
    roots: RootSet,
    shadow: ShadowStack,
    gc: GarbageCollector,
    finalizers: Vec<Option<FinalizerFn>>,
}

impl Heap {
    /// Builds a heap with every knob at its default.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HeapConfig::new())
    }

    /// Builds a heap from an explicit [`HeapConfig`].
    #[must_use]
    pub fn with_config(config: HeapConfig) -> Self {
        Heap {
            arena: Arena::new(config.arena_capacity),
            handles: crate::handle::HandleTable::new(config.handle_capacity),
            roots: RootSet::new(config.root_capacity),
            shadow: ShadowStack::new(),
            gc: GarbageCollector::new(config.collection_threshold),
            finalizers: Vec::new(),
        }
    }

    /// Always `true` once constructed; kept for parity with the embedder
    /// API's explicit `is_initialized` query, which other embedders in
    /// this family use to guard against using a heap before `init`.
    #[inline]
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        true
    }

    /// Registers the embedder's trace callback, invoked once per reachable
    /// object during marking.
    pub fn set_embedder_trace(&mut self, trace: TraceCallback) {
        self.gc.set_trace_callback(Some(trace));
    }

    /// Sets the allocation-threshold at which [`Self::should_run`] starts
    /// reporting `true`.
    pub fn set_threshold(&mut self, bytes: usize) {
        self.gc.set_threshold(bytes);
    }

    /// Allocates `size` bytes tagged `tag`, publishing a handle for it.
    /// Equivalent to `alloc_zeroed`: every fresh block starts zero-filled.
    pub fn alloc(&mut self, size: usize, tag: TypeTag) -> Result<Handle, ArenaError> {
        let payload = self.arena.alloc(size, tag)?;
        let handle = self
            .handles
            .alloc(payload)
            .map_err(|_| ArenaError::OutOfMemory)?;
        // SAFETY: `payload` was just returned by `self.arena.alloc`.
        unsafe { &mut *self.arena.header_of(payload).as_ptr() }.set_handle(handle);
        Ok(handle)
    }

    /// Identical to [`Self::alloc`]; kept as a distinct name because the
    /// embedder API historically distinguishes the two, even though this
    /// arena never hands back uninitialized memory.
    pub fn alloc_zeroed(&mut self, size: usize, tag: TypeTag) -> Result<Handle, ArenaError> {
        self.alloc(size, tag)
    }

    /// Grows or shrinks the allocation named by `handle`. The bump arena
    /// cannot resize in place except for the most recently allocated block,
    /// so in general this allocates a fresh block, copies the lesser of the
    /// old and new sizes, frees the old handle, and returns a new one; the
    /// caller must update every place it stored the old handle.
    pub fn realloc(&mut self, handle: Handle, new_size: usize) -> Result<Handle, ArenaError> {
        let Some(old_payload) = self.handles.dereference(handle) else {
            return Err(ArenaError::OutOfMemory);
        };
        // SAFETY: `old_payload` came from this arena's handle table.
        let (tag, old_usable) = unsafe {
            let header = self.arena.header_of(old_payload);
            (
                header.as_ref().tag().unwrap_or(TypeTag::RawData),
                self.arena.usable_size(old_payload),
            )
        };
        // SAFETY: `old_payload` is still the live payload for `handle`.
        if cfg!(feature = "canary") && !unsafe { self.arena.check_canaries(old_payload) } {
            log::warn!(
                "canary check failed for handle {:?} at realloc(): buffer overflow suspected",
                handle
            );
        }

        let new_payload = self.arena.alloc(new_size, tag)?;
        let copy_len = old_usable.min(new_size);
        // SAFETY: both ranges are `copy_len` bytes of live, non-overlapping
        // arena allocations.
        unsafe { core::ptr::copy_nonoverlapping(old_payload.as_ptr(), new_payload.as_ptr(), copy_len) };

        self.handles.free(handle);
        let new_handle = self
            .handles
            .alloc(new_payload)
            .map_err(|_| ArenaError::OutOfMemory)?;
        // SAFETY: `new_payload` was just returned by `self.arena.alloc`.
        unsafe { &mut *self.arena.header_of(new_payload).as_ptr() }.set_handle(new_handle);
        Ok(new_handle)
    }

    /// Like [`Self::realloc`], but also reports how many bytes of slack the
    /// 16-byte alignment left beyond `new_size` in the new block.
    pub fn realloc_with_slack(
        &mut self,
        handle: Handle,
        new_size: usize,
    ) -> Result<(Handle, usize), ArenaError> {
        let new_handle = self.realloc(handle, new_size)?;
        let slack = self.usable_size(new_handle).unwrap_or(new_size) - new_size;
        Ok((new_handle, slack))
    }

    /// Usable payload size for `handle`'s current allocation.
    #[must_use]
    pub fn usable_size(&self, handle: Handle) -> Option<usize> {
        let payload = self.handles.dereference(handle)?;
        // SAFETY: `payload` came from this arena's handle table.
        Some(unsafe { self.arena.usable_size(payload) })
    }

    /// Copies a byte string into a fresh `String`-tagged allocation.
    pub fn strdup(&mut self, bytes: &[u8]) -> Result<Handle, ArenaError> {
        self.strndup(bytes, bytes.len())
    }

    /// Like `strdup`, copying at most `max_len` bytes of `bytes`.
    pub fn strndup(&mut self, bytes: &[u8], max_len: usize) -> Result<Handle, ArenaError> {
        let len = bytes.len().min(max_len);
        let handle = self.alloc(len, TypeTag::String)?;
        let payload = self.handles.dereference(handle).expect("just allocated");
        // SAFETY: `payload` has at least `len` usable bytes, just allocated.
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), payload.as_ptr(), len) };
        Ok(handle)
    }

    /// Resolves `handle` to its current payload address. The embedder must
    /// not hold the returned pointer across any call that can allocate or
    /// collect.
    #[must_use]
    pub fn open(&self, handle: Handle) -> Option<NonNull<u8>> {
        self.handles.dereference(handle)
    }

    /// Wraps a raw payload pointer back into a [`TaggedValue::Reference`]
    /// by resolving the handle recorded in its header, allocating a fresh
    /// handle if the header's own handle field no longer agrees with the
    /// table.
    pub fn wrap(&mut self, payload: NonNull<u8>) -> Result<TaggedValue, HandleError> {
        // SAFETY: callers of `wrap` only ever pass pointers obtained from
        // `open` or from the embedder's own trace callback, both of which
        // originate from this arena.
        let header_handle = unsafe { self.arena.header_of(payload).as_ref().handle() };
        let (handle, _reused) = self.handles.get_or_create(header_handle, payload)?;
        // SAFETY: same as above.
        unsafe { &mut *self.arena.header_of(payload).as_ptr() }.set_handle(handle);
        Ok(TaggedValue::Reference(handle))
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self, handle: Handle) -> bool {
        self.handles.is_valid(handle)
    }

    /// The type tag recorded for `handle`'s object.
    #[must_use]
    pub fn type_of(&self, handle: Handle) -> Option<TypeTag> {
        let payload = self.handles.dereference(handle)?;
        // SAFETY: `payload` came from this arena's handle table.
        unsafe { self.arena.header_of(payload).as_ref() }.tag()
    }

    /// True iff `ptr` lies within this heap's arena.
    #[must_use]
    pub fn ptr_in_heap(&self, ptr: *const u8) -> bool {
        self.arena.ptr_in_heap(ptr)
    }

    /// Registers `handle` as a permanent root. Returns `false` if the root
    /// set is already at capacity.
    pub fn add_root(&mut self, handle: Handle) -> bool {
        self.roots.add(handle)
    }

    /// Unregisters a previously-added root.
    pub fn remove_root(&mut self, handle: Handle) {
        self.roots.remove(handle);
    }

    /// Pushes `value` onto the shadow stack for the returned guard's
    /// lifetime, expressed as RAII rather than a manual pair of calls.
    #[track_caller]
    #[must_use]
    pub fn push(&self, value: TaggedValue) -> ScopedRoot {
        ScopedRoot::new(&self.shadow, value)
    }

    /// Direct access to the underlying shadow stack, for the
    /// [`crate::shadow_scope`] macro and embedders that need the raw
    /// `push`/`pop_slot` entry points instead of the `ScopedRoot` guard
    /// directly.
    #[must_use]
    pub fn shadow_stack(&self) -> &ShadowStack {
        &self.shadow
    }

    /// Shadow-stack occupancy and pool statistics.
    #[must_use]
    pub fn shadow_stack_stats(&self) -> crate::shadow_stack::ShadowStackStats {
        self.shadow.stats()
    }

    /// Installs a finalizer for `handle`'s object, called exactly once when
    /// the object is reclaimed.
    pub fn set_finalizer(&mut self, handle: Handle, finalizer: FinalizerFn) -> Result<(), HandleError> {
        let payload = self.handles.dereference(handle).ok_or(HandleError::Invalid)?;
        let id = self.finalizers.len() as u32;
        self.finalizers.push(Some(finalizer));
        // SAFETY: `payload` came from this arena's handle table.
        unsafe { &mut *self.arena.header_of(payload).as_ptr() }.set_finalizer_id(Some(id));
        Ok(())
    }

    /// Returns the finalizer installed on `handle`'s object, if any.
    #[must_use]
    pub fn get_finalizer(&self, handle: Handle) -> Option<FinalizerFn> {
        let payload = self.handles.dereference(handle)?;
        // SAFETY: `payload` came from this arena's handle table.
        let id = unsafe { self.arena.header_of(payload).as_ref() }.finalizer_id()?;
        self.finalizers.get(id as usize).copied().flatten()
    }

    /// Whether the collector's allocation threshold has been crossed since
    /// the last cycle.
    #[must_use]
    pub fn should_run(&self) -> bool {
        self.gc.should_run(&self.arena)
    }

    /// Runs one mark-compact cycle unconditionally.
    pub fn collect(&mut self) -> CollectionStats {
        let finalizers = &self.finalizers;
        let mut invoke = |id: u32, payload: NonNull<u8>| {
            if let Some(Some(f)) = finalizers.get(id as usize) {
                f(payload);
            }
        };
        self.gc.collect(
            &self.arena,
            &mut self.handles,
            &self.roots,
            &self.shadow,
            Some(&mut invoke),
        )
    }

    /// Runs `collect` only if [`Self::should_run`] reports `true`. Returns
    /// `None` if no collection ran.
    pub fn collect_if_needed(&mut self) -> Option<CollectionStats> {
        if self.should_run() {
            Some(self.collect())
        } else {
            None
        }
    }

    /// Empties the object region, handle table, and root set, but keeps the
    /// arena's backing allocation. The shadow stack is left
    /// untouched: it tracks native call frames, which a script reset does
    /// not unwind.
    pub fn reset(&mut self) {
        self.arena.reset();
        self.handles.reset();
        self.roots.clear();
        self.finalizers.clear();
    }

    /// Frees and reallocates the arena's backing buffer, for recovering
    /// from state a plain `reset` cannot express.
    pub fn full_reset(&mut self) {
        self.arena.full_reset();
        self.handles.reset();
        self.roots.clear();
        self.finalizers.clear();
    }

    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.arena.used_bytes()
    }

    #[must_use]
    pub fn available_bytes(&self) -> usize {
        self.arena.available_bytes()
    }

    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.arena.capacity()
    }

    /// A point-in-time occupancy snapshot.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            used_bytes: self.arena.used_bytes(),
            available_bytes: self.arena.available_bytes(),
            total_bytes: self.arena.capacity(),
            handle_count: self.handles.live_count(),
            root_count: self.roots.len(),
            shadow_depth: self.shadow.depth(),
        }
    }

    /// Checks the shadow stack's internal bookkeeping for consistency.
    pub fn validate(&self) -> Result<(), crate::error::ValidationError> {
        self.shadow.validate()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_then_open_round_trips_bytes() {
        let mut heap = Heap::with_config(HeapConfig::new().arena_capacity(4096));
        let h = heap.strdup(b"hello").unwrap();
        let payload = heap.open(h).unwrap();
        let slice = unsafe { core::slice::from_raw_parts(payload.as_ptr(), 5) };
        assert_eq!(slice, b"hello");
    }

    #[test]
    fn unrooted_allocation_is_collected() {
        let mut heap = Heap::with_config(HeapConfig::new().arena_capacity(4096));
        let h = heap.alloc(16, TypeTag::Object).unwrap();
        heap.collect();
        assert!(!heap.is_valid(h));
    }

    #[test]
    fn rooted_allocation_survives_collection() {
        let mut heap = Heap::with_config(HeapConfig::new().arena_capacity(4096));
        let h = heap.alloc(16, TypeTag::Object).unwrap();
        heap.add_root(h);
        heap.collect();
        assert!(heap.is_valid(h));
    }

    #[test]
    fn finalizer_runs_exactly_once_on_reclaim() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        fn finalizer(_payload: NonNull<u8>) {
            CALLS.fetch_add(1, Ordering::SeqCst);
        }

        let mut heap = Heap::with_config(HeapConfig::new().arena_capacity(4096));
        let h = heap.alloc(16, TypeTag::Object).unwrap();
        heap.set_finalizer(h, finalizer).unwrap();
        heap.collect();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        heap.collect();
        assert_eq!(CALLS.load(Ordering::SeqCst), 1, "finalizer must not re-run");
    }

    #[test]
    fn reset_invalidates_every_handle() {
        let mut heap = Heap::with_config(HeapConfig::new().arena_capacity(4096));
        let h = heap.alloc(16, TypeTag::Object).unwrap();
        heap.add_root(h);
        heap.reset();
        assert!(!heap.is_valid(h));
        assert_eq!(heap.used_bytes(), 0);
    }

    #[test]
    fn scoped_root_keeps_reference_alive_across_collection() {
        let mut heap = Heap::with_config(HeapConfig::new().arena_capacity(4096));
        let h = heap.alloc(16, TypeTag::Object).unwrap();
        let root = heap.push(TaggedValue::Reference(h));
        heap.collect();
        assert!(heap.is_valid(h));
        drop(root);
    }

    #[test]
    fn shadow_scope_macro_roots_for_the_block() {
        let mut heap = Heap::with_config(HeapConfig::new().arena_capacity(4096));
        let h = heap.alloc(16, TypeTag::Object).unwrap();
        {
            crate::shadow_scope!(&heap, guard = TaggedValue::Reference(h));
            heap.collect();
            assert!(heap.is_valid(h));
            let _ = guard.get();
        }
        assert_eq!(heap.shadow_stack().depth(), 0);
    }

    #[test]
    fn shadow_root_macro_roots_only_for_the_wrapped_expression() {
        let mut heap = Heap::with_config(HeapConfig::new().arena_capacity(4096));
        let h = heap.alloc(16, TypeTag::Object).unwrap();

        let survived = crate::shadow_root!(&heap, TaggedValue::Reference(h), {
            heap.collect();
            heap.is_valid(h)
        });

        assert!(survived);
        assert_eq!(heap.shadow_stack().depth(), 0);
        heap.collect();
        assert!(!heap.is_valid(h), "root must not outlive the macro's expression");
    }

    #[test]
    fn should_run_reflects_threshold() {
        let mut heap =
            Heap::with_config(HeapConfig::new().arena_capacity(4096).collection_threshold(32));
        assert!(!heap.should_run());
        heap.alloc(64, TypeTag::Object).unwrap();
        assert!(heap.should_run());
    }

    #[test]
    fn wrap_reassigns_a_stale_handle_recorded_in_the_header() {
        let mut heap = Heap::with_config(HeapConfig::new().arena_capacity(4096));
        let h = heap.alloc(16, TypeTag::Object).unwrap();
        let payload = heap.open(h).unwrap();
        // Corrupt the header's own handle field to name a handle that does
        // not resolve back to this payload (the shape a payload's header
        // would be in after a `full_reset` reused the arena's backing bytes
        // without ever rewriting this particular header).
        unsafe {
            (&mut *heap.arena.header_of(payload).as_ptr()).set_handle(Handle::from_raw(12345));
        }

        let wrapped = heap.wrap(payload).unwrap();

        let fresh = wrapped.as_handle().unwrap();
        assert_ne!(fresh.raw(), 12345);
        assert!(heap.is_valid(fresh));
        assert_eq!(heap.open(fresh), Some(payload));
    }

    #[test]
    fn stats_reports_handle_and_root_counts() {
        let mut heap = Heap::with_config(HeapConfig::new().arena_capacity(4096));
        let h = heap.alloc(16, TypeTag::Object).unwrap();
        heap.add_root(h);
        let stats = heap.stats();
        assert_eq!(stats.handle_count, 1);
        assert_eq!(stats.root_count, 1);
    }
}
