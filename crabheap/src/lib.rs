//! A handle-indirected, mark-compact garbage collector for embedded
//! language runtimes.
//!
//! The engine never touches a raw pointer into the managed heap. It holds
//! [`Handle`]s, roots them through [`Heap::add_root`] or a [`ScopedRoot`]
//! guard, and asks the [`Heap`] to [`Heap::open`] a handle only for the
//! duration of the current operation. Collection moves objects freely
//! because nothing outside this crate remembers where they live.
#![cfg_attr(all(not(test), not(feature = "std")), no_std)]

extern crate alloc;

mod arena;
mod config;
mod error;
mod gc;
mod handle;
mod header;
mod heap;
mod roots;
mod shadow_stack;
mod value;

pub use arena::{Arena, DEFAULT_CAPACITY};
pub use config::HeapConfig;
pub use error::{ArenaError, HandleError, ValidationError};
pub use gc::{CollectionStats, GarbageCollector, TraceCallback};
pub use handle::Handle;
pub use header::{align16, TypeTag, ALIGNMENT, HEADER_SIZE};
pub use heap::{FinalizerFn, Heap, HeapStats};
pub use roots::RootSet;
pub use shadow_stack::{ScopedRoot, ShadowSiteInfo, ShadowStack, ShadowStackIter, ShadowStackStats};
pub use value::TaggedValue;

/// Re-exports the pieces most embedders need with a single `use
/// crabheap::prelude::*;`.
pub mod prelude {
    pub use crate::{shadow_root, shadow_scope, Handle, Heap, HeapConfig, TaggedValue, TypeTag};
}
