//! # Kernel Page Space
//!
//! The single higher-half address space. Every CPU binds it through its
//! [`GlobalPageBinding`](crate::GlobalPageBinding) when its
//! [`PageContext`] is created, and every client space shares its top-level
//! entries, so kernel mappings are visible everywhere.
//!
//! Kernel leaves are global (`G`) and supervisor-only. Shootdowns of kernel
//! ranges go to every CPU and use `invlpg`-style global invalidation.

use crate::addresses::{PhysicalAddress, PhysicalPage, VirtualAddress};
use crate::context::PageContext;
use crate::cursor::PageTree;
use crate::entry::{CachingMode, PageFlags};
use crate::error::PagingError;
use crate::shoot::ShootNode;
use crate::space::{PageSpace, SpaceFlavor};
use crate::Platform;
use crate::tlb::Tlb;
use alloc::sync::Arc;

#[derive(Debug)]
pub struct KernelPageSpace {
    space: Arc<PageSpace>,
}

impl KernelPageSpace {
    /// Build a fresh kernel tree with every higher-half top-level slot realized.
    ///
    /// # Errors
    /// [`PagingError::OutOfMemory`] if the root or one of the 256 PDPTs
    /// could not be allocated.
    pub fn new(platform: &Platform) -> Result<Self, PagingError> {
        let tree = PageTree::new(platform, SpaceFlavor::Kernel)?;
        tree.realize_upper_half()?;
        log::debug!("kernel page space at {}", tree.root());
        Ok(Self::with_tree(tree, platform))
    }

    /// Adopt the tree the boot loader left in `root`.
    ///
    /// # Safety
    /// `root` must be a live PML4 whose higher-half slots are all present and
    /// that nothing else edits from now on.
    #[must_use]
    pub unsafe fn from_root(root: PhysicalPage, platform: &Platform) -> Self {
        let tree = PageTree::from_root(root, platform, SpaceFlavor::Kernel);
        Self::with_tree(tree, platform)
    }

    fn with_tree(tree: PageTree, platform: &Platform) -> Self {
        Self {
            space: Arc::new(PageSpace::new(tree, Arc::clone(&platform.signal))),
        }
    }

    #[inline]
    #[must_use]
    pub const fn space(&self) -> &Arc<PageSpace> {
        &self.space
    }

    #[inline]
    #[must_use]
    pub fn tree(&self) -> &PageTree {
        self.space.tree()
    }

    /// # Errors
    /// [`PagingError::OutOfMemory`] if a missing table could not be allocated.
    ///
    /// ### Panics
    /// If `va` is already mapped, misaligned or not in the higher half.
    pub fn map_single_4k(
        &self,
        va: VirtualAddress,
        physical: PhysicalAddress,
        flags: PageFlags,
        caching: CachingMode,
    ) -> Result<(), PagingError> {
        self.tree().cursor(va).map_4k(physical, flags, caching)
    }

    /// Remove the mapping at `va` and return the frame it pointed to.
    ///
    /// ### Panics
    /// If `va` is not mapped.
    #[must_use]
    pub fn unmap_single_4k(&self, va: VirtualAddress) -> PhysicalAddress {
        match self.tree().cursor(va).take_4k() {
            Some(entry) => entry.physical_address(),
            None => panic!("kernel address {va} is not mapped"),
        }
    }

    /// Physical address `va` translates to, offset included.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let offset = va.as_u64() - va.page_base().as_u64();
        self.tree()
            .cursor(va.page_base())
            .physical()
            .map(|pa| pa + offset)
    }

    /// See [`PageSpace::submit_shootdown`].
    pub fn submit_shootdown<T: Tlb>(&self, ctx: &mut PageContext<T>, node: ShootNode) -> bool {
        self.space.submit_shootdown(ctx, node)
    }
}
