//! Coalescing first-fit heap implementation.
//!
//! This module provides a heap in the style of the classic embedded-RTOS
//! "heap 4" scheme: a single address-ordered list of free blocks bounded by a
//! start sentinel and an end sentinel, first-fit allocation with block
//! splitting, and immediate merging of a freed block with its physical
//! neighbours.
//!
//! # Algorithm
//!
//! - **Allocation**: The request is grown by one header and rounded up to the
//!   configured alignment, using checked arithmetic that fails closed. The
//!   free list is walked from the lowest address until a block of adequate
//!   size or the end sentinel is found. A block whose leftover exceeds two
//!   headers is split and the leftover is linked in right where the found
//!   block was.
//! - **Deallocation**: The block is validated as allocated, untagged, and
//!   inserted into the free list at its address position. It is merged with
//!   the preceding and the following free block when they touch, but never
//!   with the end sentinel.
//!
//! # Memory Layout
//!
//! Block sizes include the header. The top bit of the stored size word
//! records [`BlockState::Allocated`]; every stored link is an arena offset
//! XORed with the configured canary and is validated whenever it is read.
//!
//! ```text
//! Heap Layout:
//! ┌───────────────┬────────────────────────────────┬────────────┬─────────┐
//! │ alignment pad │ blocks (header + payload) ...   │ end marker │ tail pad│
//! └───────────────┴────────────────────────────────┴────────────┴─────────┘
//!
//! Block Header:
//! ┌──────────────────────────┬──────────────────────────────┐
//! │ link: offset ^ canary    │ size | allocated bit         │
//! └──────────────────────────┴──────────────────────────────┘
//! ```
//!
//! # Usage Example
//!
//! ```rust
//! use arena_heap::{ArenaBuffer, CoalescingHeap};
//!
//! let mut buffer = ArenaBuffer::<256>::new();
//! let mut heap = CoalescingHeap::new(buffer.as_mut_slice()).unwrap();
//!
//! let first = heap.allocate(8).unwrap();
//! let second = heap.allocate(8).unwrap();
//! unsafe {
//!     heap.deallocate(first);
//!     heap.deallocate(second);
//! }
//!
//! // Both blocks merged back, so the first address is handed out again.
//! assert_eq!(heap.allocate(7), Some(first));
//! ```

use log::{debug, trace};

use crate::{
    ConfigError,
    arena::{Arena, NIL, WORD_SIZE},
    config::HeapConfig,
    config_error,
    engine::{BlockEngine, FailureHook},
    stats::{FreeBlockSummary, HeapStats, UsageCounters},
};

const LINK_FIELD: usize = 0;
const SIZE_FIELD: usize = WORD_SIZE;

/// Size-word bit marking a block as owned by the application.
const ALLOCATED_BIT: usize = 1 << (usize::BITS - 1);

/// Ownership of a heap block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::IsVariant)]
pub enum BlockState {
    /// The block is linked into the free list.
    Free,
    /// The block is owned by the application and has no link.
    Allocated,
}

/// A position in the free list from which the next link is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// The start sentinel, which lives outside the arena.
    Head,
    Block(usize),
}

/// A coalescing first-fit heap over one arena.
///
/// # Thread Safety
///
/// This heap is `Send` but not `Sync`. Wrap it in a
/// [`LockedHeap`](crate::LockedHeap) to get a critical section around each
/// call.
pub struct CoalescingHeap<'a> {
    arena: Arena<'a>,
    config: HeapConfig,
    header_size: usize,
    heap_start: usize,
    end_marker: usize,
    head_link: usize,
    counters: UsageCounters,
    failure_hook: Option<FailureHook>,
}

unsafe impl Send for CoalescingHeap<'_> {}

impl<'a> CoalescingHeap<'a> {
    /// Creates a heap over `arena` with the default [`HeapConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ArenaTooSmall`] if the arena cannot hold the
    /// end marker and one minimal block.
    pub fn new(arena: &'a mut [u8]) -> Result<Self, ConfigError> {
        Self::with_config(arena, HeapConfig::new())
    }

    /// Creates a heap over `arena` using `config`.
    ///
    /// The start of the arena is skipped up to the first aligned address, the
    /// end marker is placed in the last aligned header slot and everything in
    /// between becomes one free block.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidAlignment`] for an invalid alignment and
    /// [`ConfigError::ArenaTooSmall`] if the arena cannot hold the end marker
    /// and one minimal block.
    pub fn with_config(arena: &'a mut [u8], config: HeapConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let arena = Arena::new(arena);
        let alignment = config.alignment;
        let header_size = (2 * WORD_SIZE).next_multiple_of(alignment);
        let heap_start = arena.align_offset(alignment);

        let required = heap_start
            .checked_add(2 * header_size + alignment)
            .unwrap_or(usize::MAX);
        if arena.len() < required {
            return config_error::ArenaTooSmallSnafu {
                size: arena.len(),
                required,
            }
            .fail();
        }

        let usable = (arena.len() - heap_start - header_size) & !(alignment - 1);
        let end_marker = heap_start + usable;
        let first_block_size = end_marker - heap_start;

        let mut heap = Self {
            arena,
            config,
            header_size,
            heap_start,
            end_marker,
            head_link: 0,
            counters: UsageCounters::new(first_block_size),
            failure_hook: None,
        };

        heap.write_size(end_marker, 0, BlockState::Free);
        heap.set_next(Cursor::Block(end_marker), None);
        heap.write_size(heap_start, first_block_size, BlockState::Free);
        heap.set_next(Cursor::Block(heap_start), Some(end_marker));
        heap.set_next(Cursor::Head, Some(heap_start));

        debug!(
            "coalescing heap formatted {} bytes: start {heap_start:#x}, end marker {end_marker:#x}, \
             {first_block_size} bytes free",
            heap.arena.len()
        );
        Ok(heap)
    }

    /// Allocates `wanted_size` bytes aligned to the configured boundary.
    ///
    /// Returns `None` if `wanted_size` is zero, if the padded size does not
    /// fit in `usize` without touching the allocation bit, or if no free
    /// block is large enough. Every failure except the zero-size no-op runs
    /// the hook registered with [`on_fail`](Self::on_fail).
    pub fn allocate(&mut self, wanted_size: usize) -> Option<*mut u8> {
        BlockEngine::allocate(self, wanted_size)
    }

    /// Allocates like [`allocate`](Self::allocate) but never runs the
    /// failure hook.
    pub fn try_allocate(&mut self, wanted_size: usize) -> Option<*mut u8> {
        let payload = self.allocate_block(wanted_size)?;
        Some(self.arena.ptr_at(payload))
    }

    /// Allocates a zero-filled array of `count` elements of `size` bytes.
    ///
    /// Returns `None` without running the failure hook if `count * size`
    /// overflows.
    pub fn allocate_zeroed(&mut self, count: usize, size: usize) -> Option<*mut u8> {
        let bytes = count.checked_mul(size)?;
        let ptr = self.allocate(bytes)?;
        unsafe {
            ptr.write_bytes(0, bytes);
        }
        Some(ptr)
    }

    /// Returns a block to the heap, merging it with adjacent free blocks.
    ///
    /// A null pointer is ignored.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by this heap and has not been freed since
    /// - The memory block is not accessed after this call
    ///
    /// # Panics
    ///
    /// Panics if `ptr` does not point into the heap, or if its header is not
    /// tagged as allocated or carries a link. Both indicate heap corruption
    /// or a double free.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        let Some(block) = self
            .arena
            .offset_of(ptr)
            .and_then(|offset| offset.checked_sub(self.header_size))
        else {
            panic!("heap corruption: {ptr:p} does not point into the heap");
        };
        self.validate_block(block);
        assert!(
            block < self.end_marker,
            "heap corruption: {ptr:p} points at the end marker"
        );
        assert!(
            self.block_state(block).is_allocated(),
            "heap corruption: block at {block:#x} is not allocated"
        );
        assert_eq!(
            self.arena.read_word(block + LINK_FIELD),
            self.protect(NIL),
            "heap corruption: allocated block at {block:#x} carries a link"
        );

        let size = self.block_size(block);
        self.write_size(block, size, BlockState::Free);
        if self.config.clear_on_free {
            self.arena
                .fill(block + self.header_size, size - self.header_size, 0);
        }

        self.counters.record_free(size);
        self.insert_free_block(block);
        trace!("coalescing deallocate({ptr:p}) returned {size} bytes");
    }

    /// Registers the hook run after a failed allocation, replacing and
    /// returning any previous hook.
    ///
    /// The hook runs after the heap is back in a consistent state. It must
    /// not call back into the same heap through an outer lock held around the
    /// call; [`LockedHeap`](crate::LockedHeap) releases its lock first.
    pub fn on_fail(&mut self, hook: FailureHook) -> Option<FailureHook> {
        self.failure_hook.replace(hook)
    }

    /// Returns current statistics, walking the free list.
    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        let mut summary = FreeBlockSummary::default();
        for (_, size) in self.free_blocks() {
            summary.observe(size);
        }
        HeapStats::new(&summary, &self.counters)
    }

    /// Returns the number of free bytes, headers of free blocks included.
    #[must_use]
    pub fn free_heap_size(&self) -> usize {
        self.counters.free_bytes_remaining
    }

    /// Returns the lowest value [`free_heap_size`](Self::free_heap_size) has
    /// reached.
    #[must_use]
    pub fn minimum_ever_free_heap_size(&self) -> usize {
        self.counters.minimum_ever_free_bytes_remaining
    }

    /// Restarts the low-water mark from the current free size.
    pub fn reset_minimum_ever_free_heap_size(&mut self) {
        self.counters.reset_minimum_ever();
    }

    /// Checks the physical block layout against the free list.
    ///
    /// The blocks between the heap start and the end marker must tile that
    /// range exactly, no two free blocks may touch, and the free list must
    /// hold every free block and account for every free byte.
    #[must_use]
    pub fn check_invariant(&self) -> bool {
        let mut listed = FreeBlockSummary::default();
        for (_, size) in self.free_blocks() {
            listed.observe(size);
        }

        let mut physically_free = 0;
        let mut previous_free = false;
        let mut block = self.heap_start;
        while block < self.end_marker {
            let size = self.block_size(block);
            if size < self.header_size {
                return false;
            }
            let free = self.block_state(block).is_free();
            if free && previous_free {
                return false;
            }
            if free {
                physically_free += 1;
            }
            previous_free = free;
            let Some(next) = block.checked_add(size) else {
                return false;
            };
            block = next;
        }

        block == self.end_marker
            && listed.count == physically_free
            && listed.total == self.counters.free_bytes_remaining
    }

    /// Bytes of bookkeeping placed in front of every block.
    #[must_use]
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// Byte boundary of every returned pointer.
    #[must_use]
    pub fn alignment(&self) -> usize {
        self.config.alignment
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    fn minimum_block_size(&self) -> usize {
        self.header_size << 1
    }

    /// Grows a request by one header and rounds it up to the alignment.
    fn adjusted_size(&self, wanted_size: usize) -> Option<usize> {
        let size = wanted_size
            .checked_add(self.header_size)?
            .checked_next_multiple_of(self.config.alignment)?;
        (size & ALLOCATED_BIT == 0).then_some(size)
    }

    /// Takes a block for `wanted_size` bytes out of the free list and returns
    /// the offset of its payload.
    fn allocate_block(&mut self, wanted_size: usize) -> Option<usize> {
        if wanted_size == 0 {
            return None;
        }
        let Some(wanted_size) = self.adjusted_size(wanted_size) else {
            debug!("coalescing allocate({wanted_size}) rejected: padded size overflows");
            return None;
        };
        if wanted_size > self.counters.free_bytes_remaining {
            debug!(
                "coalescing allocate failed: {wanted_size} bytes wanted, {} bytes free",
                self.counters.free_bytes_remaining
            );
            return None;
        }

        let mut prev = Cursor::Head;
        let mut block = self.expect_next(Cursor::Head);
        while self.block_size(block) < wanted_size {
            let Some(next) = self.next_of(Cursor::Block(block)) else {
                break;
            };
            prev = Cursor::Block(block);
            block = next;
        }
        if block == self.end_marker {
            debug!("coalescing allocate failed: no free block of {wanted_size} bytes");
            return None;
        }

        let next = self.next_of(Cursor::Block(block));
        self.set_next(prev, next);

        let found_size = self.block_size(block);
        if found_size - wanted_size > self.minimum_block_size() {
            let remainder = block + wanted_size;
            self.write_size(remainder, found_size - wanted_size, BlockState::Free);
            self.set_next(Cursor::Block(remainder), next);
            self.set_next(prev, Some(remainder));
            self.write_size(block, wanted_size, BlockState::Free);
        }

        let block_size = self.block_size(block);
        self.counters.record_allocation(block_size);
        self.write_size(block, block_size, BlockState::Allocated);
        self.set_next(Cursor::Block(block), None);

        trace!("coalescing allocate: block {block:#x} of {block_size} bytes");
        Some(block + self.header_size)
    }

    /// Links a free block into the list at its address position, merging it
    /// with touching neighbours.
    fn insert_free_block(&mut self, block: usize) {
        let mut iterator = Cursor::Head;
        let mut next = self.expect_next(iterator);
        while next < block {
            iterator = Cursor::Block(next);
            next = self.expect_next(iterator);
        }

        let mut block = block;
        if let Cursor::Block(prev) = iterator
            && prev + self.block_size(prev) == block
        {
            let merged_size = self.block_size(prev) + self.block_size(block);
            self.write_size(prev, merged_size, BlockState::Free);
            block = prev;
        }

        if block + self.block_size(block) == next && next != self.end_marker {
            let merged_size = self.block_size(block) + self.block_size(next);
            let after = self.next_of(Cursor::Block(next));
            self.write_size(block, merged_size, BlockState::Free);
            self.set_next(Cursor::Block(block), after);
        } else {
            self.set_next(Cursor::Block(block), Some(next));
        }

        // After merging with the predecessor the link is already in place.
        if iterator != Cursor::Block(block) {
            self.set_next(iterator, Some(block));
        }
    }

    fn protect(&self, offset: usize) -> usize {
        offset ^ self.config.canary
    }

    /// Panics unless `block` is an aligned offset between the heap start and
    /// the end marker.
    fn validate_block(&self, block: usize) {
        assert!(
            (self.heap_start..=self.end_marker).contains(&block)
                && (block - self.heap_start) & (self.config.alignment - 1) == 0,
            "heap corruption: block offset {block:#x} is outside the heap"
        );
    }

    fn next_of(&self, cursor: Cursor) -> Option<usize> {
        let stored = match cursor {
            Cursor::Head => self.head_link,
            Cursor::Block(block) => self.arena.read_word(block + LINK_FIELD),
        };
        let offset = self.protect(stored);
        if offset == NIL {
            return None;
        }
        self.validate_block(offset);
        Some(offset)
    }

    fn expect_next(&self, cursor: Cursor) -> usize {
        let Some(next) = self.next_of(cursor) else {
            panic!("heap corruption: free list ends before the end marker");
        };
        next
    }

    fn set_next(&mut self, cursor: Cursor, next: Option<usize>) {
        let stored = self.protect(next.unwrap_or(NIL));
        match cursor {
            Cursor::Head => self.head_link = stored,
            Cursor::Block(block) => self.arena.write_word(block + LINK_FIELD, stored),
        }
    }

    fn block_size(&self, block: usize) -> usize {
        self.arena.read_word(block + SIZE_FIELD) & !ALLOCATED_BIT
    }

    fn block_state(&self, block: usize) -> BlockState {
        if self.arena.read_word(block + SIZE_FIELD) & ALLOCATED_BIT == 0 {
            BlockState::Free
        } else {
            BlockState::Allocated
        }
    }

    fn write_size(&mut self, block: usize, size: usize, state: BlockState) {
        assert_eq!(size & ALLOCATED_BIT, 0, "block size {size:#x} overflows");
        let tag = match state {
            BlockState::Free => 0,
            BlockState::Allocated => ALLOCATED_BIT,
        };
        self.arena.write_word(block + SIZE_FIELD, size | tag);
    }

    fn free_blocks(&self) -> FreeBlocks<'_, 'a> {
        FreeBlocks {
            heap: self,
            next: self.next_of(Cursor::Head),
        }
    }
}

/// Iterator over `(offset, size)` pairs of the free list, end marker
/// excluded.
struct FreeBlocks<'h, 'a> {
    heap: &'h CoalescingHeap<'a>,
    next: Option<usize>,
}

impl Iterator for FreeBlocks<'_, '_> {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.filter(|&block| block != self.heap.end_marker)?;
        self.next = self.heap.next_of(Cursor::Block(block));
        Some((block, self.heap.block_size(block)))
    }
}

impl BlockEngine for CoalescingHeap<'_> {
    fn try_allocate(&mut self, size: usize) -> Option<*mut u8> {
        CoalescingHeap::try_allocate(self, size)
    }

    unsafe fn deallocate(&mut self, ptr: *mut u8) {
        unsafe { CoalescingHeap::deallocate(self, ptr) }
    }

    fn alignment(&self) -> usize {
        self.config.alignment
    }

    fn failure_hook(&self) -> Option<FailureHook> {
        self.failure_hook
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::arena::ArenaBuffer;

    fn with_test_heap<F>(config: HeapConfig, test_fn: F)
    where
        F: FnOnce(&mut CoalescingHeap<'_>),
    {
        let mut buffer = ArenaBuffer::<256>::new();
        let mut heap = CoalescingHeap::with_config(buffer.as_mut_slice(), config).unwrap();
        assert!(heap.check_invariant());
        test_fn(&mut heap);
        assert!(heap.check_invariant());
    }

    #[test]
    fn test_initial_layout() {
        with_test_heap(HeapConfig::new(), |heap| {
            let header = heap.header_size();
            assert_eq!(header, (2 * WORD_SIZE).next_multiple_of(8));
            let stats = heap.heap_stats();
            assert_eq!(stats.available_bytes, 256 - header);
            assert_eq!(stats.free_block_count, 1);
            assert_eq!(stats.largest_free_block, 256 - header);
            assert_eq!(stats.smallest_free_block, 256 - header);
            assert_eq!(stats.minimum_ever_free, heap.free_heap_size());
        });
    }

    #[test]
    fn test_several_subsequent_allocations() {
        with_test_heap(HeapConfig::new(), |heap| {
            let ptrs: Vec<_> = (0..4).map(|_| heap.allocate(1).unwrap()).collect();
            for (i, ptr) in ptrs.iter().enumerate() {
                assert_eq!(ptr.addr() % 8, 0);
                for other in &ptrs[i + 1..] {
                    assert_ne!(ptr, other);
                }
            }
            assert!(heap.check_invariant());
        });
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_full_allocation_count() {
        with_test_heap(HeapConfig::new(), |heap| {
            let mut attempts = 1;
            while heap.allocate(8).is_some() {
                attempts += 1;
                assert!(heap.check_invariant());
            }
            // Each block takes 8 + 16 bytes; the end marker and the final,
            // unsplittable block leave one slot short of the naive count.
            assert_eq!(attempts, 256 / 24);
            assert_eq!(heap.free_heap_size(), 0);
            assert_eq!(heap.minimum_ever_free_heap_size(), 0);
        });
    }

    #[test]
    fn test_allocation_after_concatenation() {
        for reverse in [false, true] {
            with_test_heap(HeapConfig::new(), |heap| unsafe {
                let ptr1 = heap.allocate(8).unwrap();
                let ptr2 = heap.allocate(8).unwrap();
                if reverse {
                    heap.deallocate(ptr2);
                    heap.deallocate(ptr1);
                } else {
                    heap.deallocate(ptr1);
                    heap.deallocate(ptr2);
                }
                assert_eq!(heap.heap_stats().free_block_count, 1);
                assert_eq!(heap.allocate(7).unwrap(), ptr1);
            });
        }
    }

    #[test]
    fn test_allocation_after_deallocation() {
        with_test_heap(HeapConfig::new(), |heap| unsafe {
            let _ptr1 = heap.allocate(1).unwrap();
            let ptr2 = heap.allocate(1).unwrap();
            let _ptr3 = heap.allocate(1).unwrap();
            let ptr4 = heap.allocate(1).unwrap();
            heap.deallocate(ptr2);
            heap.deallocate(ptr4);

            assert_eq!(heap.allocate(1).unwrap(), ptr2);
            assert_eq!(heap.allocate(1).unwrap(), ptr4);
        });
    }

    #[test]
    fn test_split_sizes() {
        with_test_heap(HeapConfig::new(), |heap| {
            let header = heap.header_size();
            let initial = heap.free_heap_size();

            let _ptr = heap.allocate(40).unwrap();
            let stats = heap.heap_stats();
            assert_eq!(stats.free_block_count, 1);
            assert_eq!(stats.largest_free_block, initial - (40 + header));
            assert_eq!(stats.available_bytes, initial - (40 + header));
        });
    }

    #[test]
    fn test_small_remainder_is_not_split() {
        with_test_heap(HeapConfig::new(), |heap| {
            let header = heap.header_size();
            let initial = heap.free_heap_size();
            // Leaves exactly two headers behind, which is not enough to split.
            let wanted = initial - 3 * header;
            let _ptr = heap.allocate(wanted).unwrap();
            assert_eq!(heap.free_heap_size(), 0);
            assert_eq!(heap.heap_stats().free_block_count, 0);
            assert_eq!(heap.heap_stats().smallest_free_block, 0);
        });
    }

    #[test]
    fn test_merge_with_both_neighbours() {
        with_test_heap(HeapConfig::new(), |heap| unsafe {
            let ptrs: Vec<_> = (0..4).map(|_| heap.allocate(16).unwrap()).collect();
            heap.deallocate(ptrs[0]);
            heap.deallocate(ptrs[2]);
            assert_eq!(heap.heap_stats().free_block_count, 3);

            heap.deallocate(ptrs[1]);
            assert_eq!(heap.heap_stats().free_block_count, 2);
            assert!(heap.check_invariant());

            heap.deallocate(ptrs[3]);
            let stats = heap.heap_stats();
            assert_eq!(stats.free_block_count, 1);
            assert_eq!(stats.available_bytes, 256 - heap.header_size());
            assert_eq!(stats.successful_allocations, 4);
            assert_eq!(stats.successful_frees, 4);
        });
    }

    #[test]
    fn test_watermark() {
        with_test_heap(HeapConfig::new(), |heap| unsafe {
            let initial = heap.free_heap_size();
            assert_eq!(heap.minimum_ever_free_heap_size(), initial);

            let ptr1 = heap.allocate(64).unwrap();
            let low = heap.free_heap_size();
            assert_eq!(heap.minimum_ever_free_heap_size(), low);

            heap.deallocate(ptr1);
            assert_eq!(heap.free_heap_size(), initial);
            assert_eq!(heap.minimum_ever_free_heap_size(), low);

            let _ptr2 = heap.allocate(8).unwrap();
            assert_eq!(heap.minimum_ever_free_heap_size(), low);

            heap.reset_minimum_ever_free_heap_size();
            assert_eq!(heap.minimum_ever_free_heap_size(), heap.free_heap_size());
        });
    }

    #[test]
    fn test_zero_size_is_a_no_op() {
        static FAILURES: AtomicUsize = AtomicUsize::new(0);
        fn count_failure() {
            FAILURES.fetch_add(1, Ordering::Relaxed);
        }

        with_test_heap(HeapConfig::new(), |heap| {
            heap.on_fail(count_failure);
            let before = heap.heap_stats();
            assert!(heap.allocate(0).is_none());
            assert_eq!(heap.heap_stats(), before);
            assert_eq!(FAILURES.load(Ordering::Relaxed), 0);
        });
    }

    #[test]
    fn test_oversized_requests_fail_closed() {
        static FAILURES: AtomicUsize = AtomicUsize::new(0);
        fn count_failure() {
            FAILURES.fetch_add(1, Ordering::Relaxed);
        }

        with_test_heap(HeapConfig::new(), |heap| {
            heap.on_fail(count_failure);
            let header = heap.header_size();
            let requests = [
                usize::MAX,
                usize::MAX - header + 1,
                usize::MAX - header - 3,
                ALLOCATED_BIT,
                ALLOCATED_BIT - header,
                256,
            ];
            for wanted in requests {
                assert!(heap.allocate(wanted).is_none(), "{wanted:#x}");
            }
            assert_eq!(FAILURES.load(Ordering::Relaxed), requests.len());
            assert_eq!(heap.heap_stats().successful_allocations, 0);
            assert_eq!(heap.free_heap_size(), 256 - header);
        });
    }

    #[test]
    fn test_failure_hook_runs_once_per_failure() {
        static FAILURES: AtomicUsize = AtomicUsize::new(0);
        fn count_failure() {
            FAILURES.fetch_add(1, Ordering::Relaxed);
        }

        with_test_heap(HeapConfig::new(), |heap| {
            assert!(heap.on_fail(count_failure).is_none());
            let _ptr = heap.allocate(128).unwrap();
            assert!(heap.allocate(128).is_none());
            assert_eq!(FAILURES.load(Ordering::Relaxed), 1);
            assert!(heap.try_allocate(128).is_none());
            assert_eq!(FAILURES.load(Ordering::Relaxed), 1);
        });
    }

    #[test]
    fn test_on_fail_replaces_hook() {
        fn first() {}
        fn second() {}

        with_test_heap(HeapConfig::new(), |heap| {
            assert!(heap.on_fail(first).is_none());
            let previous = heap.on_fail(second).unwrap();
            assert!(core::ptr::fn_addr_eq(previous, first as FailureHook));
        });
    }

    #[test]
    fn test_fragmented_heap_fails() {
        with_test_heap(HeapConfig::new(), |heap| unsafe {
            let mut ptrs = Vec::new();
            while let Some(ptr) = heap.allocate(24) {
                ptrs.push(ptr);
            }
            for ptr in ptrs.iter().step_by(2) {
                heap.deallocate(*ptr);
            }
            assert!(heap.free_heap_size() >= 64);
            assert!(heap.allocate(64).is_none());
            assert!(heap.check_invariant());
        });
    }

    #[test]
    fn test_null_deallocation_is_a_no_op() {
        with_test_heap(HeapConfig::new(), |heap| unsafe {
            let before = heap.heap_stats();
            heap.deallocate(core::ptr::null_mut());
            assert_eq!(heap.heap_stats(), before);
        });
    }

    #[test]
    #[should_panic(expected = "is not allocated")]
    fn test_double_free_panics() {
        with_test_heap(HeapConfig::new(), |heap| unsafe {
            let ptr = heap.allocate(16).unwrap();
            let _guard = heap.allocate(16).unwrap();
            heap.deallocate(ptr);
            heap.deallocate(ptr);
        });
    }

    #[test]
    #[should_panic(expected = "carries a link")]
    fn test_corrupted_link_panics() {
        with_test_heap(HeapConfig::new(), |heap| unsafe {
            let ptr = heap.allocate(16).unwrap();
            ptr.sub(heap.header_size())
                .cast::<usize>()
                .write_unaligned(0x1234);
            heap.deallocate(ptr);
        });
    }

    #[test]
    #[should_panic(expected = "does not point into the heap")]
    fn test_foreign_pointer_panics() {
        with_test_heap(HeapConfig::new(), |heap| unsafe {
            let mut outside = [0_u8; 32];
            heap.deallocate(outside.as_mut_ptr().add(16));
        });
    }

    #[test]
    fn test_canary_is_per_instance() {
        let mut buffer1 = ArenaBuffer::<128>::new();
        let mut buffer2 = ArenaBuffer::<128>::new();
        let mut heap1 = CoalescingHeap::new(buffer1.as_mut_slice()).unwrap();
        let mut heap2 = CoalescingHeap::with_config(
            buffer2.as_mut_slice(),
            HeapConfig::new().with_canary(0x5a5a_1234),
        )
        .unwrap();

        let ptr1 = heap1.allocate(8).unwrap();
        let ptr2 = heap2.allocate(8).unwrap();
        unsafe {
            let link1 = ptr1.sub(heap1.header_size()).cast::<usize>().read_unaligned();
            let link2 = ptr2.sub(heap2.header_size()).cast::<usize>().read_unaligned();
            assert_eq!(link1, NIL ^ crate::config::DEFAULT_CANARY);
            assert_eq!(link2, NIL ^ 0x5a5a_1234);
            heap1.deallocate(ptr1);
            heap2.deallocate(ptr2);
        }
        assert!(heap1.check_invariant() && heap2.check_invariant());
    }

    #[test]
    fn test_clear_on_free() {
        with_test_heap(HeapConfig::new().with_clear_on_free(true), |heap| unsafe {
            let ptr = heap.allocate(32).unwrap();
            ptr.write_bytes(0xaa, 32);
            let _guard = heap.allocate(8).unwrap();
            heap.deallocate(ptr);
            for i in 0..32 {
                assert_eq!(ptr.add(i).read(), 0);
            }
        });
    }

    #[test]
    fn test_allocate_zeroed() {
        with_test_heap(HeapConfig::new(), |heap| unsafe {
            let ptr = heap.allocate(48).unwrap();
            ptr.write_bytes(0xcc, 48);
            heap.deallocate(ptr);

            let zeroed = heap.allocate_zeroed(6, 8).unwrap();
            assert_eq!(zeroed, ptr);
            for i in 0..48 {
                assert_eq!(zeroed.add(i).read(), 0);
            }
            assert!(heap.allocate_zeroed(usize::MAX, 2).is_none());
        });
    }

    #[test]
    fn test_larger_alignment() {
        for alignment in [16, 32, 64] {
            let mut buffer = ArenaBuffer::<1024>::new();
            let config = HeapConfig::new().with_alignment(alignment);
            let mut heap = CoalescingHeap::with_config(buffer.as_mut_slice(), config).unwrap();
            assert_eq!(heap.header_size(), (2 * WORD_SIZE).next_multiple_of(alignment));

            let mut ptrs = Vec::new();
            for size in [1, 7, 33, 5] {
                let ptr = heap.allocate(size).unwrap();
                assert_eq!(ptr.addr() % alignment, 0);
                ptrs.push(ptr);
            }
            assert!(heap.check_invariant());
            for ptr in ptrs {
                unsafe { heap.deallocate(ptr) };
            }
            assert_eq!(heap.heap_stats().free_block_count, 1);
        }
    }

    #[test]
    fn test_unaligned_arena_start_is_skipped() {
        let mut buffer = ArenaBuffer::<260>::new();
        let region = &mut buffer.as_mut_slice()[3..];
        let mut heap = CoalescingHeap::new(region).unwrap();
        let ptr = heap.allocate(8).unwrap();
        assert_eq!(ptr.addr() % 8, 0);
        assert!(heap.check_invariant());
    }

    #[test]
    fn test_configuration_errors() {
        let mut buffer = ArenaBuffer::<256>::new();
        let err = CoalescingHeap::with_config(
            buffer.as_mut_slice(),
            HeapConfig::new().with_alignment(24),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ConfigError::InvalidAlignment { alignment: 24, .. }));

        let mut tiny = ArenaBuffer::<16>::new();
        let err = CoalescingHeap::new(tiny.as_mut_slice()).err().unwrap();
        assert!(matches!(err, ConfigError::ArenaTooSmall { size: 16, .. }));
    }

    #[test]
    fn test_live_blocks_never_overlap() {
        let mut buffer = ArenaBuffer::<4096>::new();
        let mut heap = CoalescingHeap::new(buffer.as_mut_slice()).unwrap();
        let initial = heap.free_heap_size();
        let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();
        let mut seed = 0x1d87_2b41_u32;
        let mut previous_minimum = heap.minimum_ever_free_heap_size();

        for step in 0..800_u32 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let roll = (seed >> 16) as usize;
            if live.is_empty() || roll % 3 != 0 {
                let size = 1 + roll % 200;
                if let Some(ptr) = heap.allocate(size) {
                    let start = ptr.addr();
                    for &(other, other_size, _) in &live {
                        let other_start = other.addr();
                        assert!(
                            start + size <= other_start || other_start + other_size <= start,
                            "live blocks overlap"
                        );
                    }
                    let tag = (step % 251) as u8;
                    unsafe { ptr.write_bytes(tag, size) };
                    live.push((ptr, size, tag));
                }
            } else {
                let (ptr, size, tag) = live.swap_remove(roll % live.len());
                unsafe {
                    for i in 0..size {
                        assert_eq!(ptr.add(i).read(), tag);
                    }
                    heap.deallocate(ptr);
                }
            }
            assert!(heap.check_invariant());
            let minimum = heap.minimum_ever_free_heap_size();
            assert!(minimum <= previous_minimum);
            assert!(minimum <= heap.free_heap_size());
            previous_minimum = minimum;
        }

        for (ptr, _, _) in live {
            unsafe { heap.deallocate(ptr) };
        }
        let stats = heap.heap_stats();
        assert_eq!(stats.free_block_count, 1);
        assert_eq!(stats.available_bytes, initial);
        assert_eq!(stats.successful_allocations, stats.successful_frees);
    }
}
