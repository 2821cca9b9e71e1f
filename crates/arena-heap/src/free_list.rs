//! Sorted free-list allocator implementation.
//!
//! This module provides a block allocator that keeps every block of its arena
//! on exactly one of two singly linked lists: the free list or the allocated
//! list. Both lists are kept sorted by address so that physically adjacent
//! free blocks can be detected and merged.
//!
//! # Algorithm
//!
//! - **Allocation**: Searches the free list from the lowest address for the
//!   first block of at least the requested size. A block larger than the
//!   request plus one header is split and the remainder stays in the free
//!   list; otherwise the whole block is handed out and any leftover bytes stay
//!   inside it.
//! - **Deallocation**: Finds the block in the allocated list by its data
//!   pointer, moves it to the free list in address order and then runs a
//!   coalescing pass over the entire free list.
//!
//! # Memory Layout
//!
//! ```text
//! Block Layout:
//! ┌───────────────────────────────────┬──────────────────────┐
//! │ Header (2 words)                  │ size bytes of data   │
//! │ ┌──────────────┬────────────────┐ │                      │
//! │ │ next: offset │ size: usize    │ │                      │
//! │ └──────────────┴────────────────┘ │                      │
//! └───────────────────────────────────┴──────────────────────┘
//! ```
//!
//! Blocks are not aligned beyond one byte, so headers are read and written
//! unaligned.
//!
//! # Usage Example
//!
//! ```rust
//! use arena_heap::FreeListAllocator;
//!
//! let mut heap = [0u8; 256];
//! let mut allocator = FreeListAllocator::new(&mut heap).unwrap();
//!
//! let ptr = allocator.allocate(32).unwrap();
//! assert!(allocator.check_invariant());
//! unsafe {
//!     allocator.deallocate(ptr);
//! }
//! assert!(allocator.check_invariant());
//! ```
//!
//! # Performance Characteristics
//!
//! - **Allocation**: O(n + m) where n is the number of free blocks and m the
//!   number of allocated blocks
//! - **Deallocation**: O(n + m)
//! - **Memory Overhead**: two machine words per block, free or allocated

use log::{debug, trace, warn};

use crate::{
    ConfigError,
    arena::{Arena, NIL, WORD_SIZE},
    config_error,
    engine::BlockEngine,
    stats::{ByteAccounting, FreeBlockSummary, HeapStats, UsageCounters},
};

const NEXT_FIELD: usize = 0;
const SIZE_FIELD: usize = WORD_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Free,
    Allocated,
}

/// A first-fit allocator over two address-sorted block lists.
///
/// # Thread Safety
///
/// This allocator is `Send` but not `Sync`. Wrap it in a
/// [`LockedHeap`](crate::LockedHeap) for shared access.
pub struct FreeListAllocator<'a> {
    arena: Arena<'a>,
    free_head: usize,
    allocated_head: usize,
    counters: UsageCounters,
}

unsafe impl Send for FreeListAllocator<'_> {}

impl<'a> FreeListAllocator<'a> {
    /// Bytes of bookkeeping placed in front of every block.
    pub const HEADER_SIZE: usize = 2 * WORD_SIZE;

    /// Creates an allocator that formats `arena` as a single free block.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ArenaTooSmall`] if the arena cannot hold one
    /// header and at least one byte of data.
    pub fn new(arena: &'a mut [u8]) -> Result<Self, ConfigError> {
        let mut arena = Arena::new(arena);
        let required = Self::HEADER_SIZE + 1;
        if arena.len() < required {
            return config_error::ArenaTooSmallSnafu {
                size: arena.len(),
                required,
            }
            .fail();
        }

        let size = arena.len() - Self::HEADER_SIZE;
        arena.write_word(NEXT_FIELD, NIL);
        arena.write_word(SIZE_FIELD, size);
        debug!(
            "free-list allocator formatted {} bytes, {size} usable",
            arena.len()
        );

        Ok(Self {
            arena,
            free_head: 0,
            allocated_head: NIL,
            counters: UsageCounters::new(size),
        })
    }

    /// Allocates a block of at least `size` bytes.
    ///
    /// Returns `None` if `size` is zero or no free block is large enough.
    pub fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }

        let mut prev_node = NIL;
        let mut current_node = self.free_head;
        while current_node != NIL {
            let block_size = self.size(current_node);
            if block_size >= size {
                let split_limit = size.checked_add(Self::HEADER_SIZE);
                if split_limit.is_some_and(|limit| block_size > limit) {
                    self.split(prev_node, current_node, size);
                } else {
                    // Leftover bytes too small for a header stay in the block.
                    self.unlink(List::Free, prev_node, current_node);
                    self.counters.record_allocation(block_size);
                }
                self.insert_sorted(List::Allocated, current_node);

                let ptr = self.arena.ptr_at(Self::data_offset(current_node));
                trace!(
                    "free-list allocate({size}) -> {ptr:p} ({} bytes)",
                    self.size(current_node)
                );
                return Some(ptr);
            }
            prev_node = current_node;
            current_node = self.next(current_node);
        }

        debug!("free-list allocate({size}) failed: no free block is large enough");
        None
    }

    /// Returns a block to the free list and merges adjacent free blocks.
    ///
    /// Pointers that do not belong to an allocated block are logged and
    /// ignored.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by [`allocate`](Self::allocate) on this allocator
    /// - `ptr` has not been deallocated before
    /// - The memory block is not accessed after this call
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        let Some(node) = self
            .arena
            .offset_of(ptr)
            .and_then(|offset| offset.checked_sub(Self::HEADER_SIZE))
        else {
            warn!("free-list deallocate({ptr:p}) ignored: pointer is outside the arena");
            return;
        };

        let mut prev_node = NIL;
        let mut current_node = self.allocated_head;
        while current_node != NIL && current_node != node {
            prev_node = current_node;
            current_node = self.next(current_node);
        }
        if current_node == NIL {
            warn!("free-list deallocate({ptr:p}) ignored: not an allocated block");
            return;
        }

        self.unlink(List::Allocated, prev_node, node);
        let size = self.size(node);
        self.insert_sorted(List::Free, node);
        self.counters.record_free(size);
        trace!("free-list deallocate({ptr:p}) returned {size} bytes");

        self.coalesce_free_list();
    }

    /// Checks that every byte of the arena is accounted for by a block.
    ///
    /// Sums the sizes and headers of both lists and compares the result with
    /// the arena size. Walks both lists, so keep it off hot paths.
    #[must_use]
    pub fn check_invariant(&self) -> bool {
        let mut accounting = ByteAccounting::default();
        for (_, size) in self.nodes(List::Free) {
            accounting.free_bytes = accounting.free_bytes.saturating_add(size);
            accounting.free_blocks += 1;
        }
        for (_, size) in self.nodes(List::Allocated) {
            accounting.allocated_bytes = accounting.allocated_bytes.saturating_add(size);
            accounting.allocated_blocks += 1;
        }
        accounting.balances(self.arena.len(), Self::HEADER_SIZE)
            && accounting.free_bytes == self.counters.free_bytes_remaining
    }

    /// Returns current statistics, walking the free list.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut summary = FreeBlockSummary::default();
        for (_, size) in self.nodes(List::Free) {
            summary.observe(size);
        }
        HeapStats::new(&summary, &self.counters)
    }

    /// Returns the number of free bytes, excluding headers.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.counters.free_bytes_remaining
    }

    /// Returns the size of the arena in bytes.
    #[must_use]
    pub fn arena_size(&self) -> usize {
        self.arena.len()
    }

    const fn data_offset(node: usize) -> usize {
        node + Self::HEADER_SIZE
    }

    fn next(&self, node: usize) -> usize {
        self.arena.read_word(node + NEXT_FIELD)
    }

    fn set_next(&mut self, node: usize, next: usize) {
        self.arena.write_word(node + NEXT_FIELD, next);
    }

    fn size(&self, node: usize) -> usize {
        self.arena.read_word(node + SIZE_FIELD)
    }

    fn set_size(&mut self, node: usize, size: usize) {
        self.arena.write_word(node + SIZE_FIELD, size);
    }

    /// Offset one past the last data byte of `node`.
    fn end(&self, node: usize) -> usize {
        Self::data_offset(node) + self.size(node)
    }

    fn head(&self, list: List) -> usize {
        match list {
            List::Free => self.free_head,
            List::Allocated => self.allocated_head,
        }
    }

    /// Points `prev_node`, or the list head if it is `NIL`, at `node`.
    fn set_successor(&mut self, list: List, prev_node: usize, node: usize) {
        if prev_node != NIL {
            self.set_next(prev_node, node);
            return;
        }
        match list {
            List::Free => self.free_head = node,
            List::Allocated => self.allocated_head = node,
        }
    }

    fn unlink(&mut self, list: List, prev_node: usize, node: usize) {
        let next = self.next(node);
        self.set_successor(list, prev_node, next);
    }

    fn insert_sorted(&mut self, list: List, node: usize) {
        let mut prev_node = NIL;
        let mut current_node = self.head(list);
        while current_node != NIL && current_node < node {
            prev_node = current_node;
            current_node = self.next(current_node);
        }
        self.set_next(node, current_node);
        self.set_successor(list, prev_node, node);
    }

    /// Shrinks the free block `node` to `size` bytes and leaves the remainder
    /// in its place in the free list.
    fn split(&mut self, prev_node: usize, node: usize, size: usize) {
        let remainder = Self::data_offset(node) + size;
        let remainder_size = self.size(node) - size - Self::HEADER_SIZE;

        self.set_size(remainder, remainder_size);
        self.set_next(remainder, self.next(node));
        self.set_successor(List::Free, prev_node, remainder);
        self.set_size(node, size);

        self.counters.record_allocation(size + Self::HEADER_SIZE);
    }

    /// Merges every pair of physically contiguous blocks in the free list.
    fn coalesce_free_list(&mut self) {
        let mut current_node = self.free_head;
        while current_node != NIL {
            let next_node = self.next(current_node);
            if next_node != NIL && self.end(current_node) == next_node {
                let merged_size = self.size(current_node) + Self::HEADER_SIZE + self.size(next_node);
                self.set_size(current_node, merged_size);
                self.set_next(current_node, self.next(next_node));
                self.counters.reclaim(Self::HEADER_SIZE);
                // Stay on the merged block: it may also touch the new successor.
                continue;
            }
            current_node = next_node;
        }
    }

    fn nodes(&self, list: List) -> Nodes<'_, 'a> {
        Nodes {
            allocator: self,
            current_node: self.head(list),
        }
    }
}

/// Iterator over `(offset, size)` pairs of one list.
struct Nodes<'s, 'a> {
    allocator: &'s FreeListAllocator<'a>,
    current_node: usize,
}

impl Iterator for Nodes<'_, '_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_node == NIL {
            return None;
        }
        let node = self.current_node;
        self.current_node = self.allocator.next(node);
        Some((node, self.allocator.size(node)))
    }
}

impl BlockEngine for FreeListAllocator<'_> {
    fn try_allocate(&mut self, size: usize) -> Option<*mut u8> {
        self.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: *mut u8) {
        unsafe { FreeListAllocator::deallocate(self, ptr) }
    }

    fn alignment(&self) -> usize {
        1
    }
}
