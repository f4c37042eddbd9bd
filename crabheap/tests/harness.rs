//! Shared helpers for the integration test suite.

#![cfg(test)]

use crabheap::{Heap, HeapConfig, TypeTag};

/// A heap sized for fast, deterministic tests rather than real workloads.
pub fn fresh_heap(arena_capacity: usize) -> Heap {
    Heap::with_config(
        HeapConfig::new()
            .arena_capacity(arena_capacity)
            .handle_capacity(4096)
            .root_capacity(256)
            // Tests trigger collection explicitly; keep the automatic
            // threshold out of the way.
            .collection_threshold(usize::MAX),
    )
}

/// Allocates `count` plain objects of `size` bytes each, returning their
/// handles in allocation order.
pub fn alloc_batch(heap: &mut Heap, count: usize, size: usize) -> alloc::vec::Vec<crabheap::Handle> {
    (0..count)
        .map(|_| heap.alloc(size, TypeTag::Object).expect("arena has room"))
        .collect()
}

extern crate alloc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_builds_a_usable_heap() {
        let mut heap = fresh_heap(4096);
        let h = heap.alloc(16, TypeTag::Object).unwrap();
        assert!(heap.is_valid(h));
    }
}
