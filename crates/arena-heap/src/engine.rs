//! The interface shared by both allocators.

/// Hook invoked once for every failed allocation.
pub type FailureHook = fn();

/// A block allocator working on a single arena.
///
/// Implemented by [`FreeListAllocator`](crate::FreeListAllocator) and
/// [`CoalescingHeap`](crate::CoalescingHeap). [`LockedHeap`](crate::LockedHeap)
/// and [`TypedAllocator`](crate::TypedAllocator) are generic over it.
pub trait BlockEngine {
    /// Allocates `size` bytes without invoking the failure hook.
    ///
    /// Returns `None` when no block can satisfy the request. Exhaustion and
    /// invalid sizes never panic.
    fn try_allocate(&mut self, size: usize) -> Option<*mut u8>;

    /// Returns a block to the allocator.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by this allocator and has not been freed since
    /// - The memory block is not accessed after this call
    unsafe fn deallocate(&mut self, ptr: *mut u8);

    /// Byte boundary every returned pointer is aligned to.
    fn alignment(&self) -> usize;

    /// Hook to run after a failed allocation, if one is registered.
    fn failure_hook(&self) -> Option<FailureHook> {
        None
    }

    /// Allocates `size` bytes, running the failure hook if the allocation
    /// fails.
    fn allocate(&mut self, size: usize) -> Option<*mut u8> {
        let ptr = self.try_allocate(size);
        if ptr.is_none()
            && size > 0
            && let Some(hook) = self.failure_hook()
        {
            hook();
        }
        ptr
    }
}
