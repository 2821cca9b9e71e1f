//! Byte regions backing the allocators.
//!
//! Every allocator in this crate works on a single [`Arena`]: a byte region
//! that is exclusively borrowed for the whole lifetime of the allocator and
//! addressed internally by offset. Block headers are encoded as native-endian
//! machine words inside the region itself, so the header overhead reported by
//! each allocator is real space taken out of the arena.
//!
//! # Memory Layout
//!
//! ```text
//! Arena:
//! ┌──────────────┬──────────────┬──────────────┬─────┐
//! │ Header word 0│ Header word 1│ Payload      │ ... │
//! │ (link)       │ (size)       │              │     │
//! └──────────────┴──────────────┴──────────────┴─────┘
//! ^ offset 0                                         ^ offset len
//! ```

use core::{marker::PhantomData, ptr::NonNull};

/// Size of one header word in bytes.
pub(crate) const WORD_SIZE: usize = size_of::<usize>();

/// Offset value reserved as the "no block" link.
pub(crate) const NIL: usize = usize::MAX;

/// An exclusively borrowed byte region addressed by offset.
///
/// The region is only ever reached through a raw base pointer, never through
/// a reference spanning the whole region. Pointers handed out to clients
/// therefore stay valid while the allocator rewrites headers elsewhere in the
/// region.
pub(crate) struct Arena<'a> {
    base: NonNull<u8>,
    len: usize,
    _marker: PhantomData<&'a mut [u8]>,
}

impl<'a> Arena<'a> {
    pub(crate) fn new(region: &'a mut [u8]) -> Self {
        let len = region.len();
        Self {
            base: NonNull::from(region).cast(),
            len,
            _marker: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Returns the number of bytes to skip from the start of the region to
    /// reach an address aligned to `align`.
    pub(crate) fn align_offset(&self, align: usize) -> usize {
        self.base.as_ptr().align_offset(align)
    }

    fn assert_in_bounds(&self, offset: usize, len: usize) {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "access of {len} bytes at offset {offset:#x} is out of arena bounds ({:#x})",
            self.len
        );
    }

    pub(crate) fn read_word(&self, offset: usize) -> usize {
        self.assert_in_bounds(offset, WORD_SIZE);
        unsafe { self.base.as_ptr().add(offset).cast::<usize>().read_unaligned() }
    }

    pub(crate) fn write_word(&mut self, offset: usize, value: usize) {
        self.assert_in_bounds(offset, WORD_SIZE);
        unsafe {
            self.base
                .as_ptr()
                .add(offset)
                .cast::<usize>()
                .write_unaligned(value);
        }
    }

    pub(crate) fn fill(&mut self, offset: usize, len: usize, byte: u8) {
        self.assert_in_bounds(offset, len);
        unsafe {
            self.base.as_ptr().add(offset).write_bytes(byte, len);
        }
    }

    /// Returns the client-facing pointer for `offset`.
    pub(crate) fn ptr_at(&self, offset: usize) -> *mut u8 {
        self.assert_in_bounds(offset, 0);
        unsafe { self.base.as_ptr().add(offset) }
    }

    /// Maps a client pointer back to its offset, or `None` if it does not
    /// point into the region.
    pub(crate) fn offset_of(&self, ptr: *const u8) -> Option<usize> {
        let offset = ptr.addr().checked_sub(self.base.as_ptr().addr())?;
        (offset < self.len).then_some(offset)
    }
}

/// Fixed-size backing storage with a 16-byte aligned start.
///
/// Any `&mut [u8]` can back an allocator; this type only guarantees that the
/// region starts on a 16-byte boundary so no bytes are lost to alignment.
///
/// ```
/// use arena_heap::{ArenaBuffer, CoalescingHeap};
///
/// let mut buffer = ArenaBuffer::<1024>::new();
/// let heap = CoalescingHeap::new(buffer.as_mut_slice()).unwrap();
/// assert!(heap.free_heap_size() > 0);
/// ```
#[repr(C, align(16))]
pub struct ArenaBuffer<const N: usize>([u8; N]);

impl<const N: usize> Default for ArenaBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ArenaBuffer<N> {
    /// Creates a zero-filled buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self([0; N])
    }

    /// Returns the size of the buffer in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        N
    }

    /// Returns `true` if the buffer holds no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    /// Returns the buffer as a mutable byte slice, ready to be handed to an
    /// allocator.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }
}
