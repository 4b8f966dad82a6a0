//! # Shootdown and Retire Nodes
//!
//! Value objects handed to a [`PageSpace`](crate::PageSpace):
//!
//! - a [`ShootNode`] asks every CPU that may cache translations of
//!   `[address, address + size)` to drop them;
//! - a [`RetireNode`] asks to be told once no CPU has the space bound.
//!
//! Both carry a [`Completion`] that runs exactly once, after every page-space
//! lock has been released.

use crate::CpuId;
use crate::addresses::{PAGE_SIZE, VirtualAddress};
use alloc::boxed::Box;
use core::fmt;

/// Callback run when a node finishes.
pub type Completion = Box<dyn FnOnce() + Send>;

pub struct ShootNode {
    address: VirtualAddress,
    size: u64,
    pub(crate) initiator: Option<CpuId>,
    pub(crate) sequence: u64,
    pub(crate) bindings_to_shoot: usize,
    completion: Completion,
}

impl ShootNode {
    #[must_use]
    pub fn new(address: VirtualAddress, size: u64, completion: impl FnOnce() + Send + 'static) -> Self {
        Self {
            address,
            size,
            initiator: None,
            sequence: 0,
            bindings_to_shoot: 0,
            completion: Box::new(completion),
        }
    }

    #[inline]
    #[must_use]
    pub const fn address(&self) -> VirtualAddress {
        self.address
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub const fn page_count(&self) -> u64 {
        self.size / PAGE_SIZE
    }

    /// Sequence number assigned on submission; 0 while unqueued.
    #[inline]
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Page addresses covered by the node.
    #[must_use]
    pub fn pages(&self) -> impl Iterator<Item = VirtualAddress> + use<> {
        let base = self.address.as_u64();
        (0..self.page_count()).map(move |i| VirtualAddress::new(base + i * PAGE_SIZE))
    }

    /// ### Panics
    /// On an empty or misaligned range, and on a range that wraps around or
    /// does not stay within one canonical half.
    pub(crate) fn validate(&self) {
        assert!(self.size != 0, "empty shootdown at {}", self.address);
        assert!(
            self.address.is_page_aligned() && self.size % PAGE_SIZE == 0,
            "misaligned shootdown of {:#x} bytes at {}",
            self.size,
            self.address
        );
        assert!(self.address.is_canonical(), "non-canonical shootdown at {}", self.address);

        // the last page, not the end: a range may close at the top of memory
        let Some(last) = self.address.checked_add(self.size - PAGE_SIZE) else {
            panic!("shootdown of {:#x} bytes at {} overflows", self.size, self.address);
        };
        assert!(
            last.is_canonical() && last.is_lower_half() == self.address.is_lower_half(),
            "shootdown of {:#x} bytes at {} leaves its canonical half",
            self.size,
            self.address
        );
    }

    pub(crate) fn complete(self) {
        (self.completion)();
    }
}

impl fmt::Debug for ShootNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShootNode")
            .field("address", &self.address)
            .field("size", &self.size)
            .field("initiator", &self.initiator)
            .field("sequence", &self.sequence)
            .field("bindings_to_shoot", &self.bindings_to_shoot)
            .finish_non_exhaustive()
    }
}

pub struct RetireNode {
    completion: Completion,
}

impl RetireNode {
    #[must_use]
    pub fn new(completion: impl FnOnce() + Send + 'static) -> Self {
        Self {
            completion: Box::new(completion),
        }
    }

    pub(crate) fn complete(self) {
        (self.completion)();
    }
}

impl fmt::Debug for RetireNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetireNode").finish_non_exhaustive()
    }
}
