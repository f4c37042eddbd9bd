//! Stop-the-world mark-compact collection.
//!
//! Collection never runs on its own thread or signal handler; the embedder
//! calls [`GarbageCollector::collect`] between bytecode instructions at a
//! point where the mutator's entire live state is reachable from the root
//! set, the shadow stack, or is mid-trace from one of those. All object
//! metadata the collector needs (mark bit, size, handle back-link) lives in
//! the [`ObjectHeader`] written at the front of every block, so the
//! collector itself is stateless between cycles beyond its trigger policy.

use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::arena::{Arena, MIN_STEP};
use crate::handle::{Handle, HandleTable};
use crate::header::{ObjectHeader, TypeTag};
use crate::roots::RootSet;
use crate::shadow_stack::ShadowStack;
use crate::value::TaggedValue;

/// Called once per reachable object during the mark phase so the embedder
/// can report its outgoing references. The core has no idea how a `Shape`
/// or a `Context` lays out its fields; `tag` selects which of the
/// embedder's own tracers to run, and `payload` is the object's base
/// address.
pub type TraceCallback = fn(tag: TypeTag, payload: NonNull<u8>, push: &mut dyn FnMut(Handle));

/// Outcome of one collection cycle, surfaced through `Heap::stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionStats {
    pub live_objects: usize,
    pub live_bytes: usize,
    pub reclaimed_bytes: usize,
}

/// Owns the collector's trigger policy and embedder trace hook. Holds no
/// per-object state: that all lives in the arena's headers.
pub struct GarbageCollector {
    threshold_bytes: usize,
    trace: Option<TraceCallback>,
}

impl GarbageCollector {
    #[must_use]
    pub fn new(threshold_bytes: usize) -> Self {
        GarbageCollector {
            threshold_bytes,
            trace: None,
        }
    }

    pub fn set_threshold(&mut self, bytes: usize) {
        self.threshold_bytes = bytes;
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold_bytes
    }

    pub fn set_trace_callback(&mut self, trace: Option<TraceCallback>) {
        self.trace = trace;
    }

    /// Whether the arena has grown enough since the last cycle to warrant
    /// another one, based on an allocation threshold.
    #[must_use]
    pub fn should_run(&self, arena: &Arena) -> bool {
        arena.used_bytes() >= self.threshold_bytes
    }

    /// Runs a full clear-mark / mark / sweep-and-compact cycle.
    ///
    /// `finalize`, if given, is called once for every object reclaimed this
    /// cycle that carries a finalizer id, before its bytes are overwritten
    /// or moved past.
    pub fn collect(
        &self,
        arena: &Arena,
        handles: &mut HandleTable,
        roots: &RootSet,
        shadow: &ShadowStack,
        mut finalize: Option<&mut dyn FnMut(u32, NonNull<u8>)>,
    ) -> CollectionStats {
        log::debug!(
            "collection starting: {} bytes used of {} capacity",
            arena.used_bytes(),
            arena.capacity()
        );
        self.clear_marks(arena);
        self.mark(arena, handles, roots, shadow);
        let stats = self.sweep_and_compact(arena, handles, finalize.as_deref_mut());
        log::debug!(
            "collection finished: {} live objects, {} live bytes, {} reclaimed",
            stats.live_objects,
            stats.live_bytes,
            stats.reclaimed_bytes
        );
        stats
    }

    /// Clears every object's mark bit before tracing. Also where the
    /// `canary` build checks every live payload's guard words, since this
    /// walk already visits every header before anything moves.
    fn clear_marks(&self, arena: &Arena) {
        let used = arena.used_bytes();
        let mut offset = 0usize;
        while offset < used {
            // SAFETY: `offset` stays within `[0, used)` and always lands on
            // a header boundary, advancing by that header's own recorded
            // size (or the minimum step for a hole/corrupt header).
            let header = unsafe { &mut *arena.at_offset(offset).cast::<ObjectHeader>() };
            if header.is_hole() || header.is_corrupt() {
                offset += MIN_STEP;
                continue;
            }
            if cfg!(feature = "canary") {
                let payload = unsafe { arena.at_offset(offset).add(Arena::payload_offset()) };
                // SAFETY: `payload` is this header's own live payload.
                let intact = unsafe { arena.check_canaries(NonNull::new_unchecked(payload)) };
                if !intact {
                    log::warn!(
                        "canary check failed for handle {:?} at collect() start: buffer overflow suspected",
                        header.handle()
                    );
                }
            }
            header.set_marked(false);
            offset += header.size();
        }
    }

    /// Traces from every root source to find everything reachable: the
    /// explicit root set, the shadow stack, and (transitively, via the
    /// embedder trace callback) every object already marked.
    fn mark(&self, arena: &Arena, handles: &HandleTable, roots: &RootSet, shadow: &ShadowStack) {
        let mut worklist: Vec<Handle> = Vec::new();
        worklist.extend(roots.iter());
        worklist.extend(shadow.iter().filter_map(TaggedValue::as_handle));

        while let Some(handle) = worklist.pop() {
            if handle.is_null() {
                continue;
            }
            let Some(payload) = handles.dereference(handle) else {
                log::debug!("mark: handle {:?} no longer resolves; skipping", handle);
                continue;
            };
            // SAFETY: every pointer stored in the handle table was returned
            // by `arena.alloc` for this same arena.
            let header = unsafe { &mut *arena.header_of(payload).as_ptr() };
            if header.is_hole() || header.is_corrupt() {
                log::error!(
                    "mark: handle {:?} points at a dead or corrupt header",
                    handle
                );
                continue;
            }
            if header.is_marked() {
                continue;
            }
            header.set_marked(true);

            if let (Some(tag), Some(trace)) = (header.tag(), self.trace) {
                trace(tag, payload, &mut |child| worklist.push(child));
            }
        }
    }

    /// Reclaims everything left unmarked and slides survivors toward the
    /// base of the arena, rewriting the handle table as objects move. A
    /// pinned object never moves; any gap its immobility leaves behind is
    /// filled with a dead placeholder header so the next cycle's linear
    /// walk stays well-formed.
    fn sweep_and_compact(
        &self,
        arena: &Arena,
        handles: &mut HandleTable,
        mut finalize: Option<&mut dyn FnMut(u32, NonNull<u8>)>,
    ) -> CollectionStats {
        let used = arena.used_bytes();
        let mut read = 0usize;
        let mut write = 0usize;
        let mut live_objects = 0usize;
        let mut live_bytes = 0usize;

        while read < used {
            // SAFETY: see `clear_marks`.
            let header = unsafe { &mut *arena.at_offset(read).cast::<ObjectHeader>() };

            if header.is_hole() {
                read += MIN_STEP;
                continue;
            }
            if header.is_corrupt() {
                log::error!("sweep: corrupt header at offset {read}; skipping minimum step");
                read += MIN_STEP;
                continue;
            }

            let size = header.size();

            if !header.is_marked() {
                if let (Some(id), Some(cb)) = (header.finalizer_id(), finalize.as_deref_mut()) {
                    let payload = unsafe { arena.at_offset(read).add(Arena::payload_offset()) };
                    // SAFETY: `payload` is this block's live payload address,
                    // not yet overwritten or moved.
                    cb(id, unsafe { NonNull::new_unchecked(payload) });
                }
                handles.free(header.handle());
                read += size;
                continue;
            }

            live_objects += 1;
            live_bytes += size;
            header.set_marked(false);
            let pinned = header.is_pinned();
            let handle = header.handle();

            if pinned {
                if write < read {
                    self.write_gap_filler(arena, write, read - write);
                }
                write = read;
            } else if write != read {
                // SAFETY: `[write, write+size)` and `[read, read+size)` both
                // lie within the arena; the destination always ends before
                // the source's own end (`write < read`), so this can only
                // ever overlap with this object's own bytes, which
                // `Arena::move_block`'s underlying `ptr::copy` handles
                // correctly regardless of direction.
                unsafe { arena.move_block(read, write, size) };
                if !handle.is_null() {
                    // SAFETY: `write + payload_offset` is inside the block
                    // just copied to `write`.
                    let new_payload = unsafe {
                        NonNull::new_unchecked(arena.at_offset(write).add(Arena::payload_offset()))
                    };
                    handles.update(handle, new_payload);
                }
            }

            read += size;
            write += size;
        }

        arena.set_frontier(write);

        CollectionStats {
            live_objects,
            live_bytes,
            reclaimed_bytes: used - write,
        }
    }

    /// Writes a dead, unmarked, unreferenced header spanning `size` bytes at
    /// `offset`, so a future cycle's linear walk treats it as ordinary
    /// garbage and reclaims it once nothing forces it to stay in place.
    fn write_gap_filler(&self, arena: &Arena, offset: usize, size: usize) {
        // SAFETY: `[offset, offset+size)` was the source range of one or
        // more objects already fully copied elsewhere by the time this
        // runs; nothing else may alias it.
        unsafe {
            arena
                .at_offset(offset)
                .cast::<ObjectHeader>()
                .write(ObjectHeader::new(TypeTag::RawData, size));
        }
    }
}
