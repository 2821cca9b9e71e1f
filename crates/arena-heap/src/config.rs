//! Allocator configuration.

use crate::{ConfigError, config_error};

/// Default canary XORed into the links stored inside a [`CoalescingHeap`].
///
/// [`CoalescingHeap`]: crate::CoalescingHeap
pub const DEFAULT_CANARY: usize = 0x0065_5556;

/// Default byte boundary of blocks returned by a [`CoalescingHeap`].
///
/// [`CoalescingHeap`]: crate::CoalescingHeap
pub const DEFAULT_ALIGNMENT: usize = 8;

/// Largest alignment accepted by [`HeapConfig::validate`].
pub const MAX_ALIGNMENT: usize = 4096;

/// Tunables of a [`CoalescingHeap`](crate::CoalescingHeap).
///
/// ```
/// use arena_heap::HeapConfig;
///
/// let config = HeapConfig::new().with_alignment(16).with_clear_on_free(true);
/// assert!(config.validate().is_ok());
/// assert!(HeapConfig::new().with_alignment(12).validate().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Byte boundary of every block and every returned pointer.
    pub alignment: usize,
    /// Value XORed into stored links to detect header corruption.
    pub canary: usize,
    /// Zero the payload of a block when it is freed.
    pub clear_on_free: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            alignment: DEFAULT_ALIGNMENT,
            canary: DEFAULT_CANARY,
            clear_on_free: false,
        }
    }

    #[must_use]
    pub const fn with_alignment(self, alignment: usize) -> Self {
        Self { alignment, ..self }
    }

    #[must_use]
    pub const fn with_canary(self, canary: usize) -> Self {
        Self { canary, ..self }
    }

    #[must_use]
    pub const fn with_clear_on_free(self, clear_on_free: bool) -> Self {
        Self {
            clear_on_free,
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.alignment.is_power_of_two() || self.alignment > MAX_ALIGNMENT {
            return config_error::InvalidAlignmentSnafu {
                alignment: self.alignment,
            }
            .fail();
        }
        Ok(())
    }
}
