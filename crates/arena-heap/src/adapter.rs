//! Typed allocation handle for containers.

use core::{
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
};

use snafu::{Location, OptionExt as _, Snafu, ensure};

use crate::{engine::BlockEngine, locked::LockedHeap};

/// Errors returned by [`TypedAllocator::allocate`].
#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum AllocError {
    #[snafu(display("capacity overflow: {count} elements of {element_size} bytes"))]
    CapacityOverflow {
        count: usize,
        element_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("element alignment {align} exceeds heap alignment {heap_align}"))]
    Misaligned {
        align: usize,
        heap_align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap exhausted while allocating {size} bytes"))]
    Exhausted {
        size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// A handle allocating arrays of `T` from a shared [`LockedHeap`].
///
/// Handles are cheap to copy and can be rebound to another element type.
/// Two handles compare equal when they use the same heap, whatever their
/// element types.
///
/// ```
/// use arena_heap::{ArenaBuffer, CoalescingHeap, LockedHeap, TypedAllocator};
///
/// let mut buffer = ArenaBuffer::<512>::new();
/// let heap = LockedHeap::new(CoalescingHeap::new(buffer.as_mut_slice()).unwrap());
///
/// let words = TypedAllocator::<u64, _>::new(&heap);
/// let ptr = words.allocate(4).unwrap();
/// unsafe {
///     ptr.as_ptr().write(42);
///     assert_eq!(ptr.as_ptr().read(), 42);
///     words.deallocate(ptr, 4);
/// }
///
/// let bytes = words.rebind::<u8>();
/// assert!(bytes == words);
/// ```
pub struct TypedAllocator<'h, T, E> {
    heap: &'h LockedHeap<E>,
    _marker: PhantomData<fn() -> T>,
}

impl<'h, T, E> TypedAllocator<'h, T, E> {
    pub const fn new(heap: &'h LockedHeap<E>) -> Self {
        Self {
            heap,
            _marker: PhantomData,
        }
    }

    /// Returns a handle for elements of type `U` sharing this heap.
    #[must_use]
    pub fn rebind<U>(self) -> TypedAllocator<'h, U, E> {
        TypedAllocator::new(self.heap)
    }

    #[must_use]
    pub const fn heap(&self) -> &'h LockedHeap<E> {
        self.heap
    }
}

impl<T, E> TypedAllocator<'_, T, E>
where
    E: BlockEngine,
{
    /// Allocates uninitialized storage for `n` elements of `T`.
    ///
    /// A request of zero bytes returns a dangling pointer without touching
    /// the heap.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, AllocError> {
        use self::alloc_error::*;

        let element_size = size_of::<T>();
        let size = n.checked_mul(element_size).context(CapacityOverflowSnafu {
            count: n,
            element_size,
        })?;
        let heap_align = self.heap.alignment();
        ensure!(
            align_of::<T>() <= heap_align,
            MisalignedSnafu {
                align: align_of::<T>(),
                heap_align,
            }
        );
        if size == 0 {
            return Ok(NonNull::dangling());
        }

        let ptr = self
            .heap
            .allocate(size)
            .and_then(NonNull::new)
            .context(ExhaustedSnafu { size })?;
        Ok(ptr.cast())
    }

    /// Releases storage obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - `ptr` was returned by `allocate(n)` on a handle equal to this one
    /// - The storage is not accessed after this call
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        if n == 0 || size_of::<T>() == 0 {
            return;
        }
        unsafe { self.heap.deallocate(ptr.as_ptr().cast()) }
    }
}

impl<T, E> Clone for TypedAllocator<'_, T, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, E> Copy for TypedAllocator<'_, T, E> {}

impl<'h, T, U, E> PartialEq<TypedAllocator<'h, U, E>> for TypedAllocator<'h, T, E> {
    fn eq(&self, other: &TypedAllocator<'h, U, E>) -> bool {
        ptr::eq(self.heap, other.heap)
    }
}

impl<T, E> Eq for TypedAllocator<'_, T, E> {}

impl<T, E> fmt::Debug for TypedAllocator<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedAllocator")
            .field("heap", &ptr::from_ref(self.heap))
            .field("element", &core::any::type_name::<T>())
            .finish()
    }
}
