//! # Virtual and Physical Memory Addresses
//!
//! Thin `u64` newtypes that keep virtual addresses, physical addresses and
//! physical 4 KiB frames apart at compile time.
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] | An address translated through the page tables. |
//! | [`PhysicalAddress`] | A machine (bus) address of RAM or MMIO. |
//! | [`PhysicalPage`] | A 4 KiB-aligned physical frame base. |
//!
//! ## Canonical form
//!
//! With 4-level paging a virtual address has 48 significant bits; bits
//! 48..63 must replicate bit 47. Addresses with bit 47 clear form the
//! **lower half** (client address spaces), addresses with it set form the
//! **higher half** (kernel, shared by every address space).

use core::fmt;
use core::ops::{Add, AddAssign};

/// Size of the smallest (leaf) page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2([`PAGE_SIZE`]).
pub const PAGE_SHIFT: u32 = 12;

/// First address of the canonical higher half.
pub const HIGHER_HALF_START: u64 = 0xFFFF_8000_0000_0000;

/// One past the last address of the canonical lower half.
pub const LOWER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// A **virtual** memory address.
///
/// No alignment guarantees by itself; the paging operations assert 4 KiB
/// alignment where the hardware needs it.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

/// A **physical** memory address (host RAM / MMIO).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

/// Base address of a 4 KiB physical frame.
///
/// Page tables live in such frames, and leaf entries point at them.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(PhysicalAddress);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// Round down to the containing 4 KiB page.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    /// `true` if bits 48..63 replicate bit 47.
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        self.0 < LOWER_HALF_END || self.0 >= HIGHER_HALF_START
    }

    #[inline]
    #[must_use]
    pub const fn is_lower_half(self) -> bool {
        self.0 < LOWER_HALF_END
    }

    #[inline]
    #[must_use]
    pub const fn is_higher_half(self) -> bool {
        self.0 >= HIGHER_HALF_START
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// The 9-bit table index selected by the bits starting at `shift`.
    #[inline]
    #[must_use]
    pub(crate) const fn table_index(self, shift: u32) -> usize {
        ((self.0 >> shift) & 0x1FF) as usize
    }
}

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }

    /// The frame containing this address.
    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage {
        PhysicalPage(Self(self.0 & !(PAGE_SIZE - 1)))
    }
}

impl PhysicalPage {
    /// Wrap a frame base.
    ///
    /// ### Panics
    /// If `base` is not 4 KiB aligned; a misaligned frame in a page-table
    /// entry would silently alias its neighbour.
    #[inline]
    #[must_use]
    pub const fn new(base: PhysicalAddress) -> Self {
        assert!(base.is_page_aligned(), "physical page is not aligned");
        Self(base)
    }

    #[inline]
    #[must_use]
    pub const fn from_frame_number(pfn: u64) -> Self {
        Self(PhysicalAddress(pfn << PAGE_SHIFT))
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn frame_number(self) -> u64 {
        self.0.0 >> PAGE_SHIFT
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Frame(0x{:016X})", self.0.0)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<PhysicalPage> for PhysicalAddress {
    #[inline]
    fn from(value: PhysicalPage) -> Self {
        value.base()
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn halves_and_canonical_form() {
        assert!(VirtualAddress::new(0x1000).is_lower_half());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_1000).is_higher_half());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0xFFFF_7FFF_FFFF_F000).is_canonical());
    }

    #[test]
    fn table_indices_follow_the_radix_split() {
        // PML4 1, PDPT 2, PD 3, PT 4, offset 5
        let va = VirtualAddress::new((1 << 39) | (2 << 30) | (3 << 21) | (4 << 12) | 5);
        assert_eq!(va.table_index(39), 1);
        assert_eq!(va.table_index(30), 2);
        assert_eq!(va.table_index(21), 3);
        assert_eq!(va.table_index(12), 4);
        assert_eq!(va.page_base().as_u64(), va.as_u64() - 5);
    }

    #[test]
    #[should_panic(expected = "physical page is not aligned")]
    fn misaligned_frame_is_fatal() {
        let _ = PhysicalPage::new(PhysicalAddress::new(0x1234));
    }

    #[test]
    fn frame_numbers() {
        let p = PhysicalAddress::new(0x2042).page();
        assert_eq!(p.base().as_u64(), 0x2000);
        assert_eq!(p.frame_number(), 2);
        assert_eq!(PhysicalPage::from_frame_number(2), p);
    }
}
