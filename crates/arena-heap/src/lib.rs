//! Deterministic block allocators over a caller-supplied byte arena.
//!
//! This crate provides two allocators for environments without a system heap,
//! such as firmware, kernels and real-time tasks. Both carve variable-sized
//! blocks out of one fixed region, keep their bookkeeping inside that region
//! and never grow it. The allocators are `no_std` compatible and never panic
//! on exhaustion.
//!
//! # Available Allocators
//!
//! ## [`FreeListAllocator`]
//!
//! A minimal allocator that keeps a free list and an allocated list, both
//! sorted by address. Best suited for:
//!
//! - Small arenas where simplicity beats speed
//! - Workloads that need every live block enumerable
//!
//! **Performance**: O(n) allocation, O(n) deallocation followed by a full
//! coalescing pass over the free list.
//!
//! ## [`CoalescingHeap`]
//!
//! A first-fit heap that merges a freed block with its neighbours on the spot.
//! Block headers carry an allocation tag and canary-protected links so that
//! corruption and double frees are caught. Best suited for:
//!
//! - Long-running systems with mixed allocation sizes
//! - Code that wants low-water-mark statistics and an out-of-memory hook
//!
//! **Performance**: O(n) allocation and deallocation where n is the number of
//! free blocks.
//!
//! # Usage Examples
//!
//! ## Basic `CoalescingHeap` Usage
//!
//! ```rust
//! use arena_heap::{ArenaBuffer, CoalescingHeap, HeapConfig};
//!
//! let mut buffer = ArenaBuffer::<1024>::new();
//! let config = HeapConfig::new().with_alignment(16);
//! let mut heap = CoalescingHeap::with_config(buffer.as_mut_slice(), config).unwrap();
//!
//! let ptr = heap.allocate(100).unwrap();
//! assert_eq!(ptr.addr() % 16, 0);
//! unsafe { heap.deallocate(ptr) };
//!
//! let stats = heap.heap_stats();
//! assert_eq!(stats.free_block_count, 1);
//! assert_eq!(stats.successful_frees, 1);
//! ```
//!
//! ## Basic `FreeListAllocator` Usage
//!
//! ```rust
//! use arena_heap::FreeListAllocator;
//!
//! let mut arena = vec![0u8; 1024];
//! let mut allocator = FreeListAllocator::new(&mut arena).unwrap();
//!
//! let ptr = allocator.allocate(64).unwrap();
//! unsafe { allocator.deallocate(ptr) };
//! assert!(allocator.check_invariant());
//! ```
//!
//! # Design Considerations
//!
//! ## Memory Safety
//!
//! The arena is borrowed mutably for the lifetime of the allocator, so it
//! cannot be touched or dropped behind the allocator's back. Returning a block
//! is `unsafe`; users must ensure:
//!
//! - The pointer came from the same allocator
//! - No use-after-free or double-free bugs
//!
//! The [`CoalescingHeap`] panics on double frees and on pointers it never
//! handed out; the [`FreeListAllocator`] ignores unknown pointers.
//!
//! ## Thread Safety
//!
//! The allocators are `Send` but not `Sync`. Wrap one in a [`LockedHeap`] for
//! shared access; the lock spans one whole allocate or deallocate call.
//!
//! ## Performance Characteristics
//!
//! | Allocator | Allocation | Deallocation | Memory Overhead | Best Use Case |
//! |-----------|------------|--------------|-----------------|---------------|
//! | `FreeListAllocator` | O(n) | O(n) | 2 words/block | Simple, small arenas |
//! | `CoalescingHeap` | O(n) | O(n) | 2 words/block, rounded to alignment | General purpose |
//!
//! ## Integration with Global Allocator
//!
//! [`LockedHeap`] implements `GlobalAlloc`, so an engine over a static buffer
//! can serve as the system allocator:
//!
//! ```rust,ignore
//! use arena_heap::{CoalescingHeap, LockedHeap};
//!
//! #[global_allocator]
//! static ALLOCATOR: LockedHeap<CoalescingHeap<'static>> = /* initialized at startup */;
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use snafu::{Location, Snafu};

pub use self::{
    adapter::{AllocError, TypedAllocator},
    arena::ArenaBuffer,
    coalescing::{BlockState, CoalescingHeap},
    config::HeapConfig,
    engine::{BlockEngine, FailureHook},
    free_list::FreeListAllocator,
    locked::LockedHeap,
    stats::HeapStats,
};

pub mod adapter;
pub mod arena;
pub mod coalescing;
pub mod config;
pub mod engine;
pub mod free_list;
pub mod locked;
pub mod stats;

/// Errors reported while setting up an allocator.
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum ConfigError {
    #[snafu(display(
        "alignment {alignment} is not a power of two in 1..={}",
        config::MAX_ALIGNMENT
    ))]
    InvalidAlignment {
        alignment: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena of {size} bytes is too small, at least {required} bytes are needed"))]
    ArenaTooSmall {
        size: usize,
        required: usize,
        #[snafu(implicit)]
        location: Location,
    },
}
