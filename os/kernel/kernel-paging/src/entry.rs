//! # Page-Table Entries, Access Flags and Caching Modes
//!
//! Every level of the x86-64 radix tree stores 512 64-bit entries. This module
//! gives them a typed view ([`PageTableEntry`]) and defines the vocabulary the
//! rest of the crate uses to describe a mapping:
//!
//! - [`PageFlags`]: what the caller wants to do with the page (write, execute).
//! - [`CachingMode`]: memory type of the mapping (WB, WT, WC, UC).
//! - [`PageStatus`]: what the hardware reported about a mapping that was just
//!   removed or cleaned (present, dirty).
//!
//! ## Leaf encoding
//!
//! A 4 KiB leaf is `frame | P`, plus `RW` if writable and `NX` unless
//! executable. Client leaves additionally carry `US`; kernel leaves carry `G`
//! so they survive address-space switches.
//!
//! Intermediate entries are always `P | RW` (plus `US` in client trees); the
//! effective permission is the intersection over the walk, so the leaf alone
//! decides.
//!
//! ### Notes
//! - Write-combining is encoded as `PAT | PWT`, i.e. PAT index 5. The boot
//!   code must program `IA32_PAT` so that slot 5 selects WC.

use crate::addresses::{PhysicalAddress, PhysicalPage};
use crate::space::SpaceFlavor;
use bitfield_struct::bitfield;
use bitflags::bitflags;

/// A single 64-bit x86-64 page-table entry.
///
/// The layout is the 4 KiB PTE view; in intermediate levels bit 7 would be
/// `PS`, which this crate never sets.
///
/// | Bits   | Name          | Meaning |
/// |--------|---------------|---------|
/// | 0      | `P`           | Present |
/// | 1      | `RW`          | Writable |
/// | 2      | `US`          | User accessible |
/// | 3      | `PWT`         | Write-through |
/// | 4      | `PCD`         | Cache disable |
/// | 5      | `A`           | Accessed (set by hardware) |
/// | 6      | `D`           | Dirty (set by hardware, leaf only) |
/// | 7      | `PAT`         | PAT index bit 2 (leaf only) |
/// | 8      | `G`           | Global (leaf only) |
/// | 9–11   | OS low        | Ignored by hardware |
/// | 12–51  | frame         | Physical frame bits [51:12] |
/// | 52–62  | OS high       | Ignored by hardware |
/// | 63     | `NX`          | Execute disable |
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    pub dirty: bool,
    pub pat: bool,
    pub global: bool,
    #[bits(3)]
    pub os_low: u8,
    #[bits(40)]
    frame: u64,
    #[bits(11)]
    pub os_high: u16,
    pub no_execute: bool,
}

impl PageTableEntry {
    /// Raw bit pattern of [`PageTableEntry::present`].
    pub const PRESENT_BIT: u64 = 1 << 0;
    /// Raw bit pattern of [`PageTableEntry::accessed`].
    pub const ACCESSED_BIT: u64 = 1 << 5;
    /// Raw bit pattern of [`PageTableEntry::dirty`].
    pub const DIRTY_BIT: u64 = 1 << 6;

    #[inline]
    #[must_use]
    pub const fn physical_address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    #[inline]
    #[must_use]
    pub const fn physical_page(self) -> PhysicalPage {
        PhysicalPage::from_frame_number(self.frame())
    }

    #[inline]
    #[must_use]
    pub const fn with_physical_page(self, page: PhysicalPage) -> Self {
        self.with_frame(page.frame_number())
    }

    /// Entry pointing at a next-level table.
    #[inline]
    #[must_use]
    pub const fn table(child: PhysicalPage, flavor: SpaceFlavor) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(matches!(flavor, SpaceFlavor::Client))
            .with_physical_page(child)
    }

    /// Entry mapping a 4 KiB page.
    #[must_use]
    pub const fn leaf(
        page: PhysicalPage,
        flags: PageFlags,
        caching: CachingMode,
        flavor: SpaceFlavor,
    ) -> Self {
        let client = matches!(flavor, SpaceFlavor::Client);
        let e = Self::new()
            .with_present(true)
            .with_writable(flags.contains(PageFlags::WRITE))
            .with_no_execute(!flags.contains(PageFlags::EXECUTE))
            .with_user(client)
            .with_global(!client)
            .with_physical_page(page);
        caching.apply(e)
    }

    #[inline]
    #[must_use]
    pub const fn status(self) -> PageStatus {
        PageStatus::from_raw(self.into_bits())
    }
}

bitflags! {
    /// Access requested for a mapping.
    ///
    /// `READ` is implied by presence on x86-64 and only recorded for callers
    /// that forward the flags elsewhere.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct PageFlags: u32 {
        const WRITE = 1;
        const EXECUTE = 2;
        const READ = 4;
    }
}

bitflags! {
    /// Status of a leaf entry observed at the moment it was swapped or cleaned.
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct PageStatus: u32 {
        const PRESENT = 1;
        const DIRTY = 2;
    }
}

impl PageStatus {
    /// Decode the status of a raw entry. Non-present entries report empty.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        if raw & PageTableEntry::PRESENT_BIT == 0 {
            return Self::empty();
        }
        if raw & PageTableEntry::DIRTY_BIT != 0 {
            Self::PRESENT.union(Self::DIRTY)
        } else {
            Self::PRESENT
        }
    }
}

/// Memory type of a leaf mapping.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub enum CachingMode {
    #[default]
    WriteBack,
    /// `PWT`.
    WriteThrough,
    /// `PAT | PWT` (PAT slot 5).
    WriteCombine,
    /// `PCD`.
    Uncached,
}

impl CachingMode {
    #[inline]
    const fn apply(self, e: PageTableEntry) -> PageTableEntry {
        match self {
            Self::WriteBack => e,
            Self::WriteThrough => e.with_write_through(true),
            Self::WriteCombine => e.with_pat(true).with_write_through(true),
            Self::Uncached => e.with_cache_disable(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame() -> PhysicalPage {
        PhysicalPage::new(PhysicalAddress::new(0x0012_3000))
    }

    #[test]
    fn client_leaf_is_user_and_not_global() {
        let e = PageTableEntry::leaf(
            frame(),
            PageFlags::READ | PageFlags::WRITE,
            CachingMode::WriteBack,
            SpaceFlavor::Client,
        );
        assert!(e.present());
        assert!(e.writable());
        assert!(e.user());
        assert!(!e.global());
        assert!(e.no_execute());
        assert_eq!(e.physical_address().as_u64(), 0x0012_3000);
    }

    #[test]
    fn kernel_leaf_is_global_supervisor() {
        let e = PageTableEntry::leaf(
            frame(),
            PageFlags::EXECUTE,
            CachingMode::WriteBack,
            SpaceFlavor::Kernel,
        );
        assert!(!e.user());
        assert!(e.global());
        assert!(!e.writable());
        assert!(!e.no_execute());
    }

    #[test]
    fn caching_modes_set_the_expected_bits() {
        let leaf = |c| {
            PageTableEntry::leaf(frame(), PageFlags::READ, c, SpaceFlavor::Client).into_bits()
                & 0x98
        };
        assert_eq!(leaf(CachingMode::WriteBack), 0);
        assert_eq!(leaf(CachingMode::WriteThrough), 0x08);
        assert_eq!(leaf(CachingMode::WriteCombine), 0x88);
        assert_eq!(leaf(CachingMode::Uncached), 0x10);
    }

    #[test]
    fn status_ignores_dirty_bit_of_absent_entries() {
        assert_eq!(PageStatus::from_raw(PageTableEntry::DIRTY_BIT), PageStatus::empty());
        assert_eq!(
            PageStatus::from_raw(PageTableEntry::PRESENT_BIT | PageTableEntry::DIRTY_BIT),
            PageStatus::PRESENT | PageStatus::DIRTY
        );
    }

    #[test]
    fn client_tables_are_user_reachable() {
        let t = PageTableEntry::table(frame(), SpaceFlavor::Client);
        assert!(t.present() && t.writable() && t.user());
        let k = PageTableEntry::table(frame(), SpaceFlavor::Kernel);
        assert!(!k.user());
    }
}
