//! # x86-64 Translation-Cache Backend
//!
//! [`Cr3`] models CR3 with `CR4.PCIDE = 1`: the low 12 bits select the PCID
//! and bit 63 asks the CPU to keep the PCID's cached translations on load.
//!
//! With the `asm` feature on x86-64, [`X86Tlb`] drives the real hardware:
//!
//! | Operation | Instruction |
//! |-----------|-------------|
//! | `load_root` | `mov cr3` (no-flush bit unless flushing) |
//! | `invalidate_page` | `invpcid` type 0 |
//! | `invalidate_tag` | `invpcid` type 1 |
//! | `invalidate_global_page` | `invlpg` |
//!
//! ### Notes
//! - `invlpg` drops the address from the current PCID and from the global
//!   entries, which is all a kernel shootdown needs.
//! - The caller must have enabled `CR4.PCIDE` and checked `INVPCID` support.

use crate::addresses::PhysicalPage;
use crate::tlb::TagSlot;
use bitfield_struct::bitfield;

/// CR3 with PCIDs enabled.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct Cr3 {
    /// Bits 0–11: PCID of the loaded tree.
    #[bits(12)]
    pub pcid: u16,

    /// Bits 12–51: PML4 physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52–62: Reserved.
    #[bits(11)]
    __: u16,

    /// Bit 63: keep the PCID's translations on load (write only).
    pub no_flush: bool,
}

impl Cr3 {
    #[must_use]
    pub const fn for_root(root: PhysicalPage, tag: TagSlot, flush: bool) -> Self {
        Self::new()
            .with_pcid(tag.as_u16())
            .with_pml4_base_4k(root.frame_number())
            .with_no_flush(!flush)
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        PhysicalPage::from_frame_number(self.pml4_base_4k())
    }
}

#[cfg(all(target_arch = "x86_64", feature = "asm"))]
pub use hardware::X86Tlb;

#[cfg(all(target_arch = "x86_64", feature = "asm"))]
mod hardware {
    use super::Cr3;
    use crate::addresses::{PhysicalPage, VirtualAddress};
    use crate::tlb::{TagSlot, Tlb};
    use core::arch::asm;

    #[repr(C, align(16))]
    struct InvpcidDescriptor {
        pcid: u64,
        address: u64,
    }

    /// # Safety
    /// `INVPCID` must be supported and `kind` in 0..=3.
    #[inline]
    unsafe fn invpcid(kind: u64, pcid: u16, address: u64) {
        let desc = InvpcidDescriptor {
            pcid: u64::from(pcid),
            address,
        };
        unsafe {
            asm!(
                "invpcid {kind}, [{desc}]",
                kind = in(reg) kind,
                desc = in(reg) &raw const desc,
                options(nostack, preserves_flags),
            );
        }
    }

    /// The executing CPU's translation cache.
    ///
    /// Only one instance per CPU may exist, and it may only be used on that
    /// CPU.
    #[derive(Debug)]
    pub struct X86Tlb {
        _not_send: core::marker::PhantomData<*const ()>,
    }

    impl X86Tlb {
        /// # Safety
        /// `CR4.PCIDE` must be set, `INVPCID` supported, and no other
        /// `X86Tlb` may exist for this CPU.
        #[must_use]
        pub const unsafe fn new() -> Self {
            Self {
                _not_send: core::marker::PhantomData,
            }
        }
    }

    impl Tlb for X86Tlb {
        fn load_root(&mut self, root: PhysicalPage, tag: TagSlot, flush: bool) {
            let cr3 = Cr3::for_root(root, tag, flush).into_bits();
            // SAFETY: the page context only loads roots of live page spaces,
            // which share the kernel half this code runs from.
            unsafe {
                asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
            }
        }

        fn invalidate_page(&mut self, tag: TagSlot, va: VirtualAddress) {
            // SAFETY: support was promised in `new`.
            unsafe { invpcid(0, tag.as_u16(), va.as_u64()) };
        }

        fn invalidate_tag(&mut self, tag: TagSlot) {
            // SAFETY: support was promised in `new`.
            unsafe { invpcid(1, tag.as_u16(), 0) };
        }

        fn invalidate_global_page(&mut self, va: VirtualAddress) {
            // SAFETY: invlpg only drops cached translations.
            unsafe {
                asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
            }
        }
    }
}
