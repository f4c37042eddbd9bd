//! Per-allocation header: type tag, mark bit, size, and handle back-link.
//!
//! Every block in the arena's object region is prefixed by a `ObjectHeader`.
//! The header is fixed at 16 bytes so that `header_size + align16(payload)`
//! keeps the frontier, and therefore every payload address, 16-byte aligned.

use crate::handle::Handle;

/// Alignment every payload is padded to.
pub const ALIGNMENT: usize = 16;

/// Size in bytes of [`ObjectHeader`]. Kept a compile-time constant so callers
/// can reason about offsets without reading the struct's layout.
pub const HEADER_SIZE: usize = 16;

/// Rounds `size` up to the next multiple of [`ALIGNMENT`].
#[inline]
#[must_use]
pub const fn align16(size: usize) -> usize {
    (size + (ALIGNMENT - 1)) & !(ALIGNMENT - 1)
}

/// Closed set of object classes the core dispatches on during tracing.
///
/// The core does not know these types' layouts; the tag only selects which
/// entry of the embedder's trace table to call during marking.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    /// Plain JS object (property table + prototype handle).
    Object = 0,
    /// Compiled function bytecode.
    FunctionBytecode = 1,
    /// Shape descriptor (hidden class).
    Shape = 2,
    /// Variable-reference cell (captured closure variable).
    VarRef = 3,
    /// Suspended async function state.
    AsyncFunctionState = 4,
    /// An execution context.
    Context = 5,
    /// The runtime singleton.
    Runtime = 6,
    /// A loaded module record.
    Module = 7,
    /// A pending microtask/job queue entry.
    JobEntry = 8,
    /// Flat UTF-8/UTF-16 string.
    String = 9,
    /// Rope-concatenated string.
    StringRope = 10,
    /// Arbitrary-precision integer.
    BigInt = 11,
    /// Untyped byte buffer with no outgoing references.
    RawData = 12,
}

impl TypeTag {
    const MAX_TAG: u8 = TypeTag::RawData as u8;

    /// Reconstructs a tag from its raw bit pattern, if it names a known
    /// variant. Used when reading back headers from raw arena bytes, where
    /// corruption is always possible.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(TypeTag::Object),
            1 => Some(TypeTag::FunctionBytecode),
            2 => Some(TypeTag::Shape),
            3 => Some(TypeTag::VarRef),
            4 => Some(TypeTag::AsyncFunctionState),
            5 => Some(TypeTag::Context),
            6 => Some(TypeTag::Runtime),
            7 => Some(TypeTag::Module),
            8 => Some(TypeTag::JobEntry),
            9 => Some(TypeTag::String),
            10 => Some(TypeTag::StringRope),
            11 => Some(TypeTag::BigInt),
            12 => Some(TypeTag::RawData),
            _ => None,
        }
    }
}

const TAG_MASK: u32 = 0x1F; // 5 bits: fits MAX_TAG = 12
const MARK_BIT: u32 = 1 << 5;
const PINNED_BIT: u32 = 1 << 6;

/// Fixed-size prelude written immediately before every payload.
///
/// Packed into 16 bytes total:
/// - `size`: total allocation size in bytes, including this header. Zero
///   marks a hole (a dead, reclaimed block) left behind by a previous sweep.
/// - `handle`: back-link to the handle table slot naming this object, so
///   compaction can rewrite the table in O(1) per surviving object.
/// - `flags`: bits 0-4 the [`TypeTag`], bit 5 the GC mark bit, bit 6 the
///   pinned bit, bits 7-31 reserved.
/// - `finalizer_id`: 0 means "no finalizer"; otherwise an index (biased by
///   one) into the heap's side table of finalizer functions. Function
///   pointers are register-width and would have forced this header past 16
///   bytes with padding, so finalizers are handle-indirected exactly like
///   object references are (see DESIGN.md).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ObjectHeader {
    size: u32,
    handle: u32,
    flags: u32,
    finalizer_id: u32,
}

impl ObjectHeader {
    /// Builds a fresh header for a newly bump-allocated block. The handle
    /// field starts at the null handle; the allocator fills it in once the
    /// handle table has assigned a slot. The tag must be visible before the
    /// object is ever reachable; the handle need not be.
    #[inline]
    #[must_use]
    pub const fn new(tag: TypeTag, total_size: usize) -> Self {
        ObjectHeader {
            size: total_size as u32,
            handle: 0,
            flags: tag as u32,
            finalizer_id: 0,
        }
    }

    /// A cleared, zero-sized header representing a hole left by sweep.
    #[inline]
    #[must_use]
    pub const fn hole() -> Self {
        ObjectHeader {
            size: 0,
            handle: 0,
            flags: 0,
            finalizer_id: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size as usize
    }

    #[inline]
    pub fn set_size(&mut self, size: usize) {
        self.size = size as u32;
    }

    /// True for a hole: a dead object's size field cleared to zero. No
    /// other metadata may be read from a hole.
    #[inline]
    #[must_use]
    pub const fn is_hole(&self) -> bool {
        self.size == 0
    }

    #[inline]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        Handle::from_raw(self.handle)
    }

    #[inline]
    pub fn set_handle(&mut self, handle: Handle) {
        self.handle = handle.raw();
    }

    #[inline]
    #[must_use]
    pub const fn raw_tag(&self) -> u8 {
        (self.flags & TAG_MASK) as u8
    }

    /// Returns the tag, or `None` if the bits don't name a known variant
    /// (the header is corrupt).
    #[inline]
    #[must_use]
    pub const fn tag(&self) -> Option<TypeTag> {
        TypeTag::from_raw(self.raw_tag())
    }

    #[inline]
    pub fn set_tag(&mut self, tag: TypeTag) {
        self.flags = (self.flags & !TAG_MASK) | (tag as u32);
    }

    #[inline]
    #[must_use]
    pub const fn is_marked(&self) -> bool {
        (self.flags & MARK_BIT) != 0
    }

    #[inline]
    pub fn set_marked(&mut self, marked: bool) {
        if marked {
            self.flags |= MARK_BIT;
        } else {
            self.flags &= !MARK_BIT;
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_pinned(&self) -> bool {
        (self.flags & PINNED_BIT) != 0
    }

    #[inline]
    pub fn set_pinned(&mut self, pinned: bool) {
        if pinned {
            self.flags |= PINNED_BIT;
        } else {
            self.flags &= !PINNED_BIT;
        }
    }

    #[inline]
    #[must_use]
    pub const fn finalizer_id(&self) -> Option<u32> {
        if self.finalizer_id == 0 {
            None
        } else {
            Some(self.finalizer_id - 1)
        }
    }

    #[inline]
    pub fn set_finalizer_id(&mut self, id: Option<u32>) {
        self.finalizer_id = match id {
            Some(id) => id + 1,
            None => 0,
        };
    }

    /// A header whose tag byte is out of the closed set is corrupt. Sweep
    /// treats this as the "corruption sentinel" case: log and skip by the
    /// minimum step, never trust `size` from a corrupt header.
    #[inline]
    #[must_use]
    pub const fn is_corrupt(&self) -> bool {
        !self.is_hole() && self.raw_tag() > TypeTag::MAX_TAG
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_sixteen_bytes() {
        assert_eq!(core::mem::size_of::<ObjectHeader>(), HEADER_SIZE);
    }

    #[test]
    fn align16_rounds_up() {
        assert_eq!(align16(0), 0);
        assert_eq!(align16(1), 16);
        assert_eq!(align16(16), 16);
        assert_eq!(align16(17), 32);
        assert_eq!(align16(255), 256);
    }

    #[test]
    fn tag_roundtrip() {
        let mut h = ObjectHeader::new(TypeTag::String, 64);
        assert_eq!(h.tag(), Some(TypeTag::String));
        h.set_tag(TypeTag::Object);
        assert_eq!(h.tag(), Some(TypeTag::Object));
    }

    #[test]
    fn mark_bit_preserves_tag_and_size() {
        let mut h = ObjectHeader::new(TypeTag::BigInt, 128);
        assert!(!h.is_marked());
        h.set_marked(true);
        assert!(h.is_marked());
        assert_eq!(h.tag(), Some(TypeTag::BigInt));
        assert_eq!(h.size(), 128);
        h.set_marked(false);
        assert!(!h.is_marked());
    }

    #[test]
    fn pinned_bit_independent_of_mark_bit() {
        let mut h = ObjectHeader::new(TypeTag::Object, 32);
        h.set_pinned(true);
        h.set_marked(true);
        assert!(h.is_pinned());
        assert!(h.is_marked());
        h.set_marked(false);
        assert!(h.is_pinned());
    }

    #[test]
    fn finalizer_id_biased_by_one() {
        let mut h = ObjectHeader::new(TypeTag::Object, 32);
        assert_eq!(h.finalizer_id(), None);
        h.set_finalizer_id(Some(0));
        assert_eq!(h.finalizer_id(), Some(0));
        h.set_finalizer_id(Some(41));
        assert_eq!(h.finalizer_id(), Some(41));
        h.set_finalizer_id(None);
        assert_eq!(h.finalizer_id(), None);
    }

    #[test]
    fn hole_has_zero_size() {
        let h = ObjectHeader::hole();
        assert!(h.is_hole());
        assert_eq!(h.size(), 0);
    }

    #[test]
    fn corrupt_tag_detected() {
        let mut h = ObjectHeader::new(TypeTag::Object, 32);
        // Poke an out-of-range tag directly, simulating memory corruption.
        h.flags |= TAG_MASK;
        assert!(h.is_corrupt());
    }
}
