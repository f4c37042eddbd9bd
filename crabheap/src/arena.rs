//! The bump-allocated object region.
//!
//! `Arena` owns one contiguous, fixed-capacity byte buffer and hands out
//! 16-byte-aligned blocks by advancing a `frontier` offset. It knows nothing
//! about handles; callers give it a [`TypeTag`] and a size and get back a
//! payload pointer; wiring that pointer into the handle table is the
//! [`crate::Heap`]'s job. Keeping the handle table and root set as
//! separately-owned structures rather than sub-slices of this buffer is a
//! deliberate adaptation from the C-level "three sub-regions, one buffer"
//! layout (see DESIGN.md).

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::ArenaError;
use crate::header::{align16, ObjectHeader, TypeTag, HEADER_SIZE};

/// Default arena capacity: 512 MiB.
pub const DEFAULT_CAPACITY: usize = 512 * 1024 * 1024;

/// Minimum number of bytes the sweep/compact walk advances over a hole or a
/// corrupt header, guaranteeing forward progress even when `size` cannot be
/// trusted.
pub const MIN_STEP: usize = HEADER_SIZE;

#[cfg(feature = "canary")]
const CANARY_SIZE: usize = 8;
#[cfg(feature = "canary")]
const CANARY_PAD: usize = 2 * CANARY_SIZE;
#[cfg(feature = "canary")]
const CANARY_MAGIC: u64 = 0xC0FF_EE15_CA4E_BABE;
#[cfg(not(feature = "canary"))]
const CANARY_PAD: usize = 0;

/// Bump allocator over a single fixed-size buffer.
///
/// The object region starts at offset 0 of this buffer and grows upward;
/// `frontier` is the boundary between used and free space. Allocation uses a
/// compare-and-swap loop on `frontier`, not because the collector expects
/// concurrent mutators today, but so the allocator stays crash-safe against
/// signal-handler re-entrancy and can grow into a multi-threaded allocator
/// later without a rewrite.
pub struct Arena {
    buffer: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    frontier: AtomicUsize,
}

// SAFETY: `Arena` owns its buffer exclusively; shared access to the `&self`
// methods is limited to the atomic frontier bump, which is the only field
// mutated without `&mut self`.
unsafe impl Send for Arena {}

impl Arena {
    /// Allocates a fresh buffer of `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let layout = Layout::from_size_align(capacity.max(1), 16)
            .expect("arena capacity overflowed a valid Layout");
        // SAFETY: `layout` has non-zero size (capacity is `max(1)`-ed above).
        // Left uninitialized: every block handed out by `alloc` is zeroed
        // individually, so eagerly zeroing the whole (potentially huge)
        // backing buffer up front would be wasted work.
        let raw = unsafe { alloc::alloc::alloc(layout) };
        let buffer = NonNull::new(raw).unwrap_or_else(|| alloc::alloc::handle_alloc_error(layout));
        Arena {
            buffer,
            layout,
            capacity,
            frontier: AtomicUsize::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.frontier.load(Ordering::Acquire)
    }

    #[inline]
    #[must_use]
    pub fn available_bytes(&self) -> usize {
        self.capacity - self.used_bytes()
    }

    /// Bump-allocates `user_size` bytes tagged `tag`. Returns the payload
    /// pointer (immediately after the header, 16-byte aligned).
    pub fn alloc(&self, user_size: usize, tag: TypeTag) -> Result<NonNull<u8>, ArenaError> {
        let payload_region = align16(user_size.checked_add(CANARY_PAD).ok_or(ArenaError::SizeOverflow)?);
        let total = HEADER_SIZE
            .checked_add(payload_region)
            .ok_or(ArenaError::SizeOverflow)?;

        let mut cur = self.frontier.load(Ordering::Relaxed);
        let base = loop {
            let new_frontier = cur.checked_add(total).ok_or(ArenaError::SizeOverflow)?;
            if new_frontier > self.capacity {
                return Err(ArenaError::OutOfMemory);
            }
            match self.frontier.compare_exchange_weak(
                cur,
                new_frontier,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(prev) => break prev,
                Err(observed) => cur = observed,
            }
        };

        // SAFETY: [base, base+total) was just reserved exclusively by the
        // CAS above and lies within `self.buffer`'s `capacity` bytes.
        unsafe {
            let block = self.buffer.as_ptr().add(base);
            core::ptr::write_bytes(block, 0, total);
            block.cast::<ObjectHeader>().write(ObjectHeader::new(tag, total));

            let payload = block.add(Self::payload_offset());

            #[cfg(feature = "canary")]
            {
                block
                    .add(HEADER_SIZE)
                    .cast::<u64>()
                    .write_unaligned(CANARY_MAGIC);
                block
                    .add(HEADER_SIZE + payload_region - CANARY_SIZE)
                    .cast::<u64>()
                    .write_unaligned(CANARY_MAGIC);
            }

            // Release fence: the header (and canaries) must be fully visible
            // to any reader that later observes this pointer published into
            // a handle.
            core::sync::atomic::fence(Ordering::Release);

            Ok(NonNull::new_unchecked(payload))
        }
    }

    #[inline]
    pub(crate) const fn payload_offset() -> usize {
        #[cfg(feature = "canary")]
        {
            HEADER_SIZE + CANARY_SIZE
        }
        #[cfg(not(feature = "canary"))]
        {
            HEADER_SIZE
        }
    }

    /// Number of usable bytes at `payload` (excludes the header and, when
    /// the `canary` feature is active, the two 8-byte guard words).
    ///
    /// # Safety
    /// `payload` must have been returned by this arena's `alloc`/`header_of`
    /// machinery and must still name a live block.
    #[must_use]
    pub unsafe fn usable_size(&self, payload: NonNull<u8>) -> usize {
        let header = self.header_of(payload);
        header.as_ref().size() - HEADER_SIZE - CANARY_PAD
    }

    /// Recovers the header immediately preceding `payload`.
    ///
    /// # Safety
    /// `payload` must point inside this arena's object region at an offset
    /// previously returned by `alloc` (i.e. exactly `Self::payload_offset()`
    /// bytes after some block's base).
    #[must_use]
    pub unsafe fn header_of(&self, payload: NonNull<u8>) -> NonNull<ObjectHeader> {
        let block = payload.as_ptr().sub(Self::payload_offset());
        NonNull::new_unchecked(block.cast())
    }

    /// Verifies both guard words around `payload` are intact. Always `true`
    /// when the `canary` feature is disabled.
    ///
    /// # Safety
    /// Same preconditions as [`Self::header_of`].
    #[must_use]
    pub unsafe fn check_canaries(&self, payload: NonNull<u8>) -> bool {
        #[cfg(feature = "canary")]
        {
            let header = self.header_of(payload);
            let size = header.as_ref().size();
            let block = payload.as_ptr().sub(HEADER_SIZE);
            let front = block.cast::<u64>().read_unaligned();
            let back = block
                .add(size - HEADER_SIZE - CANARY_SIZE)
                .cast::<u64>()
                .read_unaligned();
            front == CANARY_MAGIC && back == CANARY_MAGIC
        }
        #[cfg(not(feature = "canary"))]
        {
            let _ = payload;
            true
        }
    }

    /// True iff `ptr` lies inside this arena's backing buffer.
    #[must_use]
    pub fn ptr_in_heap(&self, ptr: *const u8) -> bool {
        let base = self.buffer.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + self.capacity
    }

    /// Raw pointer to offset `offset` in the object region. Used by the
    /// collector's linear scans.
    ///
    /// # Safety
    /// `offset` must be `<= self.used_bytes()`.
    #[must_use]
    pub unsafe fn at_offset(&self, offset: usize) -> *mut u8 {
        self.buffer.as_ptr().add(offset)
    }

    /// Moves `size` bytes from `src_offset` to `dst_offset` within the
    /// arena, tolerating overlap (compaction always moves objects toward the
    /// base, so ranges can overlap).
    ///
    /// # Safety
    /// `[src_offset, src_offset+size)` and `[dst_offset, dst_offset+size)`
    /// must both lie within the arena.
    pub unsafe fn move_block(&self, src_offset: usize, dst_offset: usize, size: usize) {
        let src = self.buffer.as_ptr().add(src_offset);
        let dst = self.buffer.as_ptr().add(dst_offset);
        core::ptr::copy(src, dst, size);
    }

    /// Sets the frontier directly. Used by the collector once compaction has
    /// computed the new live-region boundary, and by `reset`.
    pub fn set_frontier(&self, offset: usize) {
        self.frontier.store(offset, Ordering::Release);
    }

    /// Restores the arena to an empty object region, without reallocating
    /// the backing buffer.
    pub fn reset(&mut self) {
        // SAFETY: the whole buffer is ours and `capacity` bytes long.
        unsafe { core::ptr::write_bytes(self.buffer.as_ptr(), 0, self.capacity) };
        self.frontier.store(0, Ordering::Release);
    }

    /// Frees and reallocates the backing buffer at its original capacity.
    /// Used to recover from state that may have
    /// survived a prior execution in a way `reset` cannot express.
    pub fn full_reset(&mut self) {
        // SAFETY: `self.buffer`/`self.layout` describe the allocation made
        // in `new`/the previous `full_reset`, and nothing else aliases it.
        unsafe { alloc::alloc::dealloc(self.buffer.as_ptr(), self.layout) };
        let fresh = Arena::new(self.capacity);
        self.buffer = fresh.buffer;
        self.layout = fresh.layout;
        self.frontier.store(0, Ordering::Release);
        core::mem::forget(fresh);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        // SAFETY: `self.buffer`/`self.layout` describe the live allocation
        // from `new`/`full_reset`, and this is the only owner.
        unsafe { alloc::alloc::dealloc(self.buffer.as_ptr(), self.layout) };
    }
}
