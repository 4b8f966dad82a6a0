//! # Paging Configuration
//!
//! Per-CPU tunables of the binding and shootdown machinery.
//!
//! | Field | Default | Meaning |
//! |-------|---------|---------|
//! | `tag_slots` | 8 | Address spaces kept bound per CPU (one PCID each). |
//! | `full_flush_threshold` | 16 | Range shootdowns above this many pages flush the whole tag. |

use crate::error::PagingError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PagingConfig {
    tag_slots: usize,
    full_flush_threshold: u64,
}

impl PagingConfig {
    pub const DEFAULT_TAG_SLOTS: usize = 8;

    /// PCIDs are 12 bits wide.
    pub const MAX_TAG_SLOTS: usize = 4096;

    pub const DEFAULT_FULL_FLUSH_THRESHOLD: u64 = 16;

    /// # Errors
    /// [`PagingError::InvalidTagSlots`] unless `1 <= tag_slots <= 4096`.
    pub const fn new(tag_slots: usize, full_flush_threshold: u64) -> Result<Self, PagingError> {
        if tag_slots == 0 || tag_slots > Self::MAX_TAG_SLOTS {
            return Err(PagingError::InvalidTagSlots {
                requested: tag_slots,
                max: Self::MAX_TAG_SLOTS,
            });
        }
        Ok(Self {
            tag_slots,
            full_flush_threshold,
        })
    }

    #[inline]
    #[must_use]
    pub const fn tag_slots(&self) -> usize {
        self.tag_slots
    }

    #[inline]
    #[must_use]
    pub const fn full_flush_threshold(&self) -> u64 {
        self.full_flush_threshold
    }
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            tag_slots: Self::DEFAULT_TAG_SLOTS,
            full_flush_threshold: Self::DEFAULT_FULL_FLUSH_THRESHOLD,
        }
    }
}
