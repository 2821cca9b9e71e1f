//! Critical section around a block engine.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use spin::{Mutex, MutexGuard};

use crate::engine::BlockEngine;

/// A block engine behind a spin lock.
///
/// Every allocate and deallocate runs entirely under the lock. The failure
/// hook is looked up under the lock but runs after it is released, so a hook
/// may use the same heap again.
///
/// ```
/// use arena_heap::{ArenaBuffer, CoalescingHeap, LockedHeap};
///
/// let mut buffer = ArenaBuffer::<512>::new();
/// let heap = LockedHeap::new(CoalescingHeap::new(buffer.as_mut_slice()).unwrap());
///
/// let ptr = heap.allocate(32).unwrap();
/// unsafe { heap.deallocate(ptr) };
/// assert!(heap.lock().check_invariant());
/// ```
pub struct LockedHeap<E> {
    engine: Mutex<E>,
}

impl<E> LockedHeap<E> {
    pub const fn new(engine: E) -> Self {
        Self {
            engine: Mutex::new(engine),
        }
    }

    /// Locks the heap for direct access to the engine.
    pub fn lock(&self) -> MutexGuard<'_, E> {
        self.engine.lock()
    }

    pub fn into_inner(self) -> E {
        self.engine.into_inner()
    }
}

impl<E> LockedHeap<E>
where
    E: BlockEngine,
{
    /// Allocates `size` bytes, running the engine's failure hook after the
    /// lock is released if no block is found.
    pub fn allocate(&self, size: usize) -> Option<*mut u8> {
        let (ptr, hook) = {
            let mut engine = self.engine.lock();
            (engine.try_allocate(size), engine.failure_hook())
        };
        if ptr.is_none()
            && size > 0
            && let Some(hook) = hook
        {
            hook();
        }
        ptr
    }

    /// Returns a block to the engine.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by this heap and has not been freed since
    /// - The memory block is not accessed after this call
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        unsafe { self.engine.lock().deallocate(ptr) }
    }

    #[must_use]
    pub fn alignment(&self) -> usize {
        self.engine.lock().alignment()
    }
}

unsafe impl<E> GlobalAlloc for LockedHeap<E>
where
    E: BlockEngine + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > self.alignment() {
            return ptr::null_mut();
        }
        self.allocate(layout.size()).unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.deallocate(ptr) }
    }
}
