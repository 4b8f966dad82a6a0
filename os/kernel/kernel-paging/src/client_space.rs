//! # Client Page Spaces
//!
//! One lower-half address space, e.g. a user process. The client owns the
//! tables below its root's lower 256 slots; the upper 256 slots are copied
//! from the [`KernelPageSpace`] at creation and point at the kernel's own
//! PDPTs.
//!
//! ## Lifetime
//!
//! ```text
//!  new ──► map / unmap / activate ... ──► retire(node)
//!                                            │ last binding released
//!                                            ▼
//!                                        node fires
//!                                            │ last Arc<PageSpace> dropped
//!                                            ▼
//!                                 lower-half tables + root freed
//! ```
//!
//! Dropping a space that was never retired retires it with an empty
//! completion. The tables live as long as the shared [`PageSpace`], so a
//! handle obtained through [`space`](ClientPageSpace::space) keeps them
//! valid past retirement.

use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::context::PageContext;
use crate::cursor::{Cursor, PageTree};
use crate::entry::{CachingMode, PageFlags, PageStatus};
use crate::error::PagingError;
use crate::kernel_space::KernelPageSpace;
use crate::shoot::{RetireNode, ShootNode};
use crate::space::{PageSpace, SpaceFlavor};
use crate::Platform;
use crate::tlb::Tlb;
use alloc::sync::Arc;

#[derive(Debug)]
pub struct ClientPageSpace {
    space: Arc<PageSpace>,
}

impl ClientPageSpace {
    /// Allocate a root sharing the kernel's higher half.
    ///
    /// # Errors
    /// [`PagingError::OutOfMemory`] if the root could not be allocated.
    pub fn new(platform: &Platform, kernel: &KernelPageSpace) -> Result<Self, PagingError> {
        let tree = PageTree::new(platform, SpaceFlavor::Client)?;
        tree.share_upper_half(kernel.tree());
        log::debug!("client page space at {}", tree.root());
        Ok(Self {
            space: Arc::new(PageSpace::new(tree, Arc::clone(&platform.signal))),
        })
    }

    #[inline]
    #[must_use]
    pub const fn space(&self) -> &Arc<PageSpace> {
        &self.space
    }

    #[must_use]
    pub fn cursor(&self, va: VirtualAddress) -> Cursor<'_> {
        self.space.tree().cursor(va)
    }

    fn assert_live(&self, va: VirtualAddress) {
        assert!(
            !self.space.wants_to_retire(),
            "mapping {va} into retiring page space {}",
            self.space.root_table()
        );
    }

    /// # Errors
    /// [`PagingError::OutOfMemory`] if a missing table could not be allocated.
    ///
    /// ### Panics
    /// If `va` is already mapped, misaligned or outside the lower half, or if
    /// the space is retiring.
    pub fn map_single_4k(
        &self,
        va: VirtualAddress,
        physical: PhysicalAddress,
        flags: PageFlags,
        caching: CachingMode,
    ) -> Result<(), PagingError> {
        self.assert_live(va);
        self.cursor(va).map_4k(physical, flags, caching)
    }

    /// Replace the mapping at `va`, returning the previous status.
    ///
    /// # Errors
    /// [`PagingError::OutOfMemory`] if a missing table could not be allocated.
    pub fn remap_single_4k(
        &self,
        va: VirtualAddress,
        physical: PhysicalAddress,
        flags: PageFlags,
        caching: CachingMode,
    ) -> Result<PageStatus, PagingError> {
        self.assert_live(va);
        self.cursor(va).remap_4k(physical, flags, caching)
    }

    /// Remove the mapping at `va`. The caller shoots the range down afterwards.
    #[must_use]
    pub fn unmap_single_4k(&self, va: VirtualAddress) -> PageStatus {
        self.cursor(va).unmap_4k()
    }

    /// Clear the dirty bit at `va`, returning the status before.
    #[must_use]
    pub fn clean_single_4k(&self, va: VirtualAddress) -> PageStatus {
        self.cursor(va).clean_4k()
    }

    #[must_use]
    pub fn is_mapped(&self, va: VirtualAddress) -> bool {
        self.cursor(va).peek().is_some()
    }

    /// Mark the page at `va` accessed. `true` if it is present and was not
    /// accessed before.
    #[must_use]
    pub fn update_page_access(&self, va: VirtualAddress) -> bool {
        self.cursor(va).update_access()
    }

    /// Physical address `va` translates to, offset included.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let offset = va.as_u64() - va.page_base().as_u64();
        self.cursor(va.page_base())
            .physical()
            .map(|pa| pa + offset)
    }

    /// See [`PageSpace::submit_shootdown`].
    pub fn submit_shootdown<T: Tlb>(&self, ctx: &mut PageContext<T>, node: ShootNode) -> bool {
        self.space.submit_shootdown(ctx, node)
    }

    /// Retire the space. `node` fires once no CPU has it bound; the tables
    /// go back to the frame allocator with the last handle on the space.
    pub fn retire(self, node: RetireNode) {
        self.space.retire(node);
    }
}

impl Drop for ClientPageSpace {
    fn drop(&mut self) {
        if !self.space.wants_to_retire() {
            self.space.retire(RetireNode::new(|| {}));
        }
    }
}
