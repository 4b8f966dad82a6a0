//! # Paging Core
//!
//! Page spaces, per-CPU bindings and TLB shootdown for x86-64 4-level paging.
//!
//! ## What you get
//! - A [`KernelPageSpace`] (higher half, shared by every CPU) and any number
//!   of [`ClientPageSpace`]s (lower half, one per user address space).
//! - A lock-free [`Cursor`] that walks, realizes and edits the radix tree of a
//!   page space with atomic entry operations.
//! - A per-CPU [`PageContext`] that keeps a small set of address spaces bound
//!   to translation-cache tags (PCIDs) and evicts the least recently used.
//! - A shootdown protocol: [`ShootNode`]s queued on a [`PageSpace`] complete
//!   once every CPU that may cache the range has invalidated it.
//! - Deferred destruction: a [`RetireNode`] fires once no CPU has the space
//!   bound any more; client tables are freed with the last handle on it.
//!
//! ## x86-64 Virtual Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! Every level is a 4 KiB table of 512 entries. The walk depth is
//! [`PAGING_LEVELS`]; all walks loop over [`LEVEL_SHIFTS`].
//!
//! ## Control flow
//!
//! ```text
//!  caller ──► ClientPageSpace::unmap_single_4k ──► Cursor (atomic swap)
//!     │
//!     └─────► PageSpace::submit_shootdown ──► local invalidate
//!                      │                      + queue node, raise signal
//!                      ▼
//!       remote CPU: PageContext::shootdown ──► invalidate tag, ack
//!                      │
//!                      ▼  last ack
//!               ShootNode completion
//! ```
//!
//! ## Collaborators
//!
//! The crate never allocates frames, maps memory or sends interrupts on its
//! own. It reaches the machine through four traits:
//! [`FrameAlloc`], [`PhysMapper`], [`ShootdownSignal`] and the per-CPU [`Tlb`].

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::cast_possible_truncation)]

extern crate alloc;

mod accessor;
mod addresses;
pub mod arch;
mod binding;
mod client_space;
mod config;
mod context;
mod cursor;
mod entry;
mod error;
mod kernel_space;
mod shoot;
mod space;
mod tlb;

pub use accessor::{DirectMapper, PageAccessor, PhysMapper};
pub use addresses::{
    HIGHER_HALF_START, LOWER_HALF_END, PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, PhysicalPage,
    VirtualAddress,
};
pub use binding::{GlobalPageBinding, PageBinding};
pub use client_space::ClientPageSpace;
pub use config::PagingConfig;
pub use context::PageContext;
pub use cursor::{Cursor, PageTree};
pub use entry::{CachingMode, PageFlags, PageStatus, PageTableEntry};
pub use error::PagingError;
pub use kernel_space::KernelPageSpace;
pub use shoot::{Completion, RetireNode, ShootNode};
pub use space::{PageSpace, SpaceFlavor};
pub use tlb::{TagSlot, Tlb};

use alloc::sync::Arc;
use core::fmt;

/// Depth of the radix tree.
pub const PAGING_LEVELS: usize = 4;

/// Bit position of the table index consumed at each level, root first.
pub const LEVEL_SHIFTS: [u32; PAGING_LEVELS] = [39, 30, 21, 12];

/// Entries per table.
pub const TABLE_ENTRIES: usize = 512;

/// Identity of a CPU as seen by the shootdown protocol.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub u32);

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Source of **physical** 4 KiB frames for page tables.
///
/// The implementation decides where frames come from (boot pool, buddy
/// allocator, ...). Returned frames **must** be zeroed.
pub trait FrameAlloc: Send + Sync {
    /// Allocate one zeroed frame. `None` on out-of-memory.
    fn alloc_zeroed_4k(&self) -> Option<PhysicalPage>;

    /// Return a frame obtained from [`alloc_zeroed_4k`](Self::alloc_zeroed_4k).
    fn free_4k(&self, frame: PhysicalPage);
}

/// Asks other CPUs to run [`PageContext::shootdown`] soon.
///
/// Fire-and-forget and at-least-once: spurious requests are harmless, a lost
/// one stalls every pending [`ShootNode`].
pub trait ShootdownSignal: Send + Sync {
    /// `initiator` is the requesting CPU (which need not be interrupted), or
    /// `None` if every CPU should look.
    fn request_shootdown(&self, initiator: Option<CpuId>);
}

/// Everything a page space needs from the rest of the kernel.
#[derive(Clone)]
pub struct Platform {
    pub frames: Arc<dyn FrameAlloc>,
    pub mapper: Arc<dyn PhysMapper>,
    pub signal: Arc<dyn ShootdownSignal>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
