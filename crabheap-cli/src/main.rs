//! Stress/inspection driver for `crabheap`.
//!
//! Allocates a batch of synthetic objects, roots a configurable fraction of
//! them, runs one collection cycle, and prints the resulting heap stats.
//! This is not a JS host (crabheap has no bytecode interpreter attached);
//! it is a standalone way to exercise the allocator and collector under a
//! realistic churn pattern.

use crabheap::{Heap, HeapConfig, TypeTag};

struct RunArgs {
    object_count: usize,
    object_size: usize,
    root_fraction: u32,
    cycles: usize,
}

impl RunArgs {
    fn from_env() -> Self {
        let mut args = RunArgs {
            object_count: 10_000,
            object_size: 64,
            root_fraction: 10,
            cycles: 3,
        };
        for arg in std::env::args().skip(1) {
            if let Some(v) = arg.strip_prefix("--objects=") {
                args.object_count = v.parse().unwrap_or(args.object_count);
            } else if let Some(v) = arg.strip_prefix("--size=") {
                args.object_size = v.parse().unwrap_or(args.object_size);
            } else if let Some(v) = arg.strip_prefix("--root-fraction=") {
                args.root_fraction = v.parse().unwrap_or(args.root_fraction);
            } else if let Some(v) = arg.strip_prefix("--cycles=") {
                args.cycles = v.parse().unwrap_or(args.cycles);
            }
        }
        args
    }
}

fn main() {
    env_logger::init();
    let args = RunArgs::from_env();

    let mut heap = Heap::with_config(
        HeapConfig::new()
            .arena_capacity(256 * 1024 * 1024)
            .collection_threshold(16 * 1024 * 1024),
    );

    for cycle in 0..args.cycles {
        log::info!("cycle {cycle}: allocating {} objects", args.object_count);
        for i in 0..args.object_count {
            match heap.alloc(args.object_size, TypeTag::Object) {
                Ok(handle) => {
                    if args.root_fraction > 0 && i as u32 % args.root_fraction == 0 {
                        heap.add_root(handle);
                    }
                }
                Err(err) => {
                    log::warn!("allocation {i} failed: {err}");
                    break;
                }
            }
        }

        let stats = heap.collect();
        let snapshot = heap.stats();
        println!(
            "cycle {cycle}: collected {} live objects ({} bytes), reclaimed {} bytes; heap now {}/{} bytes, {} roots",
            stats.live_objects,
            stats.live_bytes,
            stats.reclaimed_bytes,
            snapshot.used_bytes,
            snapshot.total_bytes,
            snapshot.root_count
        );
    }
}
