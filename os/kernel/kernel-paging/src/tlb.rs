//! # Translation-Cache Interface
//!
//! Each CPU owns one [`Tlb`] handle, held by its
//! [`PageContext`](crate::PageContext). Address spaces are told apart by a
//! [`TagSlot`] (a PCID on x86-64); the kernel's global leaves live outside
//! any tag.

use crate::addresses::{PhysicalPage, VirtualAddress};
use core::fmt;

/// Translation-cache tag of one binding slot.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagSlot(u16);

impl TagSlot {
    #[inline]
    #[must_use]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for TagSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tag{}", self.0)
    }
}

/// Per-CPU translation cache.
pub trait Tlb {
    /// Make `root` the active table tree under `tag`.
    ///
    /// With `flush` every cached non-global translation of `tag` is dropped;
    /// without it they are kept.
    fn load_root(&mut self, root: PhysicalPage, tag: TagSlot, flush: bool);

    /// Drop the translation of `va` cached under `tag`.
    fn invalidate_page(&mut self, tag: TagSlot, va: VirtualAddress);

    /// Drop every non-global translation cached under `tag`.
    fn invalidate_tag(&mut self, tag: TagSlot);

    /// Drop the global translation of `va`.
    fn invalidate_global_page(&mut self, va: VirtualAddress);
}
