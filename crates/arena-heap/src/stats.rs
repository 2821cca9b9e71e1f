//! Heap statistics and byte accounting shared by both allocators.

/// Snapshot of an allocator's state.
///
/// The free-block fields come from a fresh walk over the free list; the
/// remaining fields are running counters maintained by allocate and free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Total free bytes, the sum of all free blocks.
    pub available_bytes: usize,
    /// Size of the largest free block.
    pub largest_free_block: usize,
    /// Size of the smallest free block, `0` when no block is free.
    pub smallest_free_block: usize,
    /// Number of blocks in the free list.
    pub free_block_count: usize,
    /// Lowest value `available_bytes` has reached since construction or the
    /// last watermark reset.
    pub minimum_ever_free: usize,
    /// Number of allocate calls that returned a block.
    pub successful_allocations: usize,
    /// Number of free calls that returned a block to the free list.
    pub successful_frees: usize,
}

impl HeapStats {
    pub(crate) fn new(free_blocks: &FreeBlockSummary, counters: &UsageCounters) -> Self {
        Self {
            available_bytes: counters.free_bytes_remaining,
            largest_free_block: free_blocks.largest,
            smallest_free_block: free_blocks.smallest.unwrap_or(0),
            free_block_count: free_blocks.count,
            minimum_ever_free: counters.minimum_ever_free_bytes_remaining,
            successful_allocations: counters.successful_allocations,
            successful_frees: counters.successful_frees,
        }
    }
}

/// Extremes collected while walking a free list.
#[derive(Debug, Default)]
pub(crate) struct FreeBlockSummary {
    pub(crate) count: usize,
    pub(crate) total: usize,
    pub(crate) largest: usize,
    pub(crate) smallest: Option<usize>,
}

impl FreeBlockSummary {
    pub(crate) fn observe(&mut self, size: usize) {
        self.count += 1;
        self.total = self.total.saturating_add(size);
        self.largest = self.largest.max(size);
        self.smallest = Some(self.smallest.map_or(size, |smallest| smallest.min(size)));
    }
}

/// Running counters, mutated only inside allocate and free.
#[derive(Debug)]
pub(crate) struct UsageCounters {
    pub(crate) free_bytes_remaining: usize,
    pub(crate) minimum_ever_free_bytes_remaining: usize,
    pub(crate) successful_allocations: usize,
    pub(crate) successful_frees: usize,
}

impl UsageCounters {
    pub(crate) const fn new(free_bytes: usize) -> Self {
        Self {
            free_bytes_remaining: free_bytes,
            minimum_ever_free_bytes_remaining: free_bytes,
            successful_allocations: 0,
            successful_frees: 0,
        }
    }

    pub(crate) fn record_allocation(&mut self, bytes: usize) {
        assert!(
            bytes <= self.free_bytes_remaining,
            "allocated {bytes} bytes with only {} bytes free",
            self.free_bytes_remaining
        );
        self.free_bytes_remaining -= bytes;
        self.minimum_ever_free_bytes_remaining = self
            .minimum_ever_free_bytes_remaining
            .min(self.free_bytes_remaining);
        self.successful_allocations += 1;
    }

    pub(crate) fn record_free(&mut self, bytes: usize) {
        self.free_bytes_remaining += bytes;
        self.successful_frees += 1;
    }

    /// Credits bytes released by merging a header into a neighbouring free
    /// block.
    pub(crate) fn reclaim(&mut self, bytes: usize) {
        self.free_bytes_remaining += bytes;
    }

    pub(crate) fn reset_minimum_ever(&mut self) {
        self.minimum_ever_free_bytes_remaining = self.free_bytes_remaining;
    }
}

/// Totals over both lists of a [`FreeListAllocator`](crate::FreeListAllocator).
#[derive(Debug, Default)]
pub(crate) struct ByteAccounting {
    pub(crate) allocated_bytes: usize,
    pub(crate) allocated_blocks: usize,
    pub(crate) free_bytes: usize,
    pub(crate) free_blocks: usize,
}

impl ByteAccounting {
    /// Checks `allocated + free + blocks * overhead == arena_size` without
    /// wrapping on overflow.
    pub(crate) fn balances(&self, arena_size: usize, header_size: usize) -> bool {
        let total = self
            .allocated_blocks
            .checked_add(self.free_blocks)
            .and_then(|blocks| blocks.checked_mul(header_size))
            .and_then(|overhead| overhead.checked_add(self.allocated_bytes))
            .and_then(|total| total.checked_add(self.free_bytes));
        total == Some(arena_size)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_tracks_extremes() {
        let mut summary = FreeBlockSummary::default();
        assert_eq!(summary.smallest, None);
        for size in [48, 16, 160] {
            summary.observe(size);
        }
        assert_eq!(summary.count, 3);
        assert_eq!(summary.total, 224);
        assert_eq!(summary.largest, 160);
        assert_eq!(summary.smallest, Some(16));
    }

    #[test]
    fn test_watermark_is_non_increasing() {
        let mut counters = UsageCounters::new(100);
        assert_eq!(counters.minimum_ever_free_bytes_remaining, 100);

        counters.record_allocation(40);
        assert_eq!(counters.minimum_ever_free_bytes_remaining, 60);
        counters.record_free(40);
        assert_eq!(counters.free_bytes_remaining, 100);
        assert_eq!(counters.minimum_ever_free_bytes_remaining, 60);
        counters.record_allocation(10);
        assert_eq!(counters.minimum_ever_free_bytes_remaining, 60);

        counters.reset_minimum_ever();
        assert_eq!(counters.minimum_ever_free_bytes_remaining, 90);
        assert_eq!(counters.successful_allocations, 2);
        assert_eq!(counters.successful_frees, 1);

        counters.reclaim(16);
        assert_eq!(counters.free_bytes_remaining, 106);
        assert_eq!(counters.successful_frees, 1);
    }

    #[test]
    fn test_stats_without_free_blocks() {
        let counters = UsageCounters::new(0);
        let stats = HeapStats::new(&FreeBlockSummary::default(), &counters);
        assert_eq!(stats.smallest_free_block, 0);
        assert_eq!(stats.free_block_count, 0);
    }

    #[test]
    fn test_accounting_balance() {
        let accounting = ByteAccounting {
            allocated_bytes: 10,
            allocated_blocks: 2,
            free_bytes: 6,
            free_blocks: 1,
        };
        assert!(accounting.balances(10 + 6 + 3 * 16, 16));
        assert!(!accounting.balances(10 + 6 + 3 * 16 + 1, 16));
        assert!(!accounting.balances(0, usize::MAX));
    }
}
