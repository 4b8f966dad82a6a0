//! # Page Bindings
//!
//! A [`PageBinding`] records that one tag slot of one CPU holds translations
//! of a [`PageSpace`]. The binding is what the space counts in
//! `num_bindings`, and it is the unit that acknowledges shootdowns.
//!
//! ## States
//!
//! ```text
//!            rebind_to(space)
//!  unbound ─────────────────────► bound (primary)
//!     ▲                              │  other space activated
//!     │ unbind / eviction            ▼
//!     └──────────────────────── bound (non-primary) ──► stale
//!                                    ▲                    │ rebind()
//!                                    └────────────────────┘
//! ```
//!
//! A binding is **stale** while its `already_shot_sequence` lags behind the
//! space's `shoot_sequence`. A stale binding is made current again either by
//! a shootdown pass (range invalidation) or by `rebind()` (tag flush).
//!
//! The kernel space is bound once per CPU through a [`GlobalPageBinding`];
//! its leaves are global, so it needs no tag and is never evicted.

use crate::CpuId;
use crate::shoot::ShootNode;
use crate::space::PageSpace;
use crate::tlb::{TagSlot, Tlb};
use alloc::sync::Arc;
use core::fmt;

/// Drop the translations of `node` cached under `tag`.
pub(crate) fn invalidate_range<T: Tlb>(tlb: &mut T, tag: TagSlot, node: &ShootNode, full_flush_threshold: u64) {
    if node.page_count() > full_flush_threshold {
        tlb.invalidate_tag(tag);
    } else {
        for va in node.pages() {
            tlb.invalidate_page(tag, va);
        }
    }
}

/// One tag slot of one CPU.
pub struct PageBinding {
    tag: TagSlot,
    bound: Option<Arc<PageSpace>>,
    primary_stamp: u64,
    already_shot_sequence: u64,
}

impl PageBinding {
    #[must_use]
    pub const fn new(tag: TagSlot) -> Self {
        Self {
            tag,
            bound: None,
            primary_stamp: 0,
            already_shot_sequence: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn tag(&self) -> TagSlot {
        self.tag
    }

    #[inline]
    #[must_use]
    pub const fn bound_space(&self) -> Option<&Arc<PageSpace>> {
        self.bound.as_ref()
    }

    #[inline]
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    /// Stamp of the last time this binding became primary; 0 if never.
    #[inline]
    #[must_use]
    pub const fn primary_stamp(&self) -> u64 {
        self.primary_stamp
    }

    #[inline]
    #[must_use]
    pub const fn already_shot_sequence(&self) -> u64 {
        self.already_shot_sequence
    }

    pub(crate) fn holds(&self, space: &PageSpace) -> bool {
        self.bound
            .as_ref()
            .is_some_and(|b| core::ptr::eq(Arc::as_ptr(b), space))
    }

    /// Make the already bound space primary again.
    ///
    /// A stale binding acknowledges everything it owes and reloads with a
    /// full flush of its tag; a current one keeps the tag's translations.
    pub(crate) fn rebind<T: Tlb>(&mut self, cpu: CpuId, tlb: &mut T, stamp: u64) {
        let Some(space) = self.bound.as_ref() else {
            panic!("{cpu}: rebind of unbound {:?}", self.tag);
        };
        let (sequence, finished) = space.catch_up(cpu, self.already_shot_sequence, |_| {});
        let stale = sequence != self.already_shot_sequence;
        tlb.load_root(space.root_table(), self.tag, stale);
        self.already_shot_sequence = sequence;
        self.primary_stamp = stamp;
        finished.fire();
    }

    /// Bind this slot to `space`, releasing whatever it held before.
    ///
    /// The tag is always flushed: it may still hold translations of the
    /// previous space.
    pub(crate) fn rebind_to<T: Tlb>(&mut self, cpu: CpuId, tlb: &mut T, space: &Arc<PageSpace>, stamp: u64) {
        let sequence = space.attach();
        let previous = self.bound.replace(Arc::clone(space));
        let previous_shot = self.already_shot_sequence;
        self.already_shot_sequence = sequence;
        tlb.load_root(space.root_table(), self.tag, true);
        self.primary_stamp = stamp;

        if let Some(previous) = previous {
            log::debug!(
                "{cpu}: {:?} evicts page space {} for {}",
                self.tag,
                previous.root_table(),
                space.root_table()
            );
            previous.detach(cpu, previous_shot).fire();
        } else {
            log::debug!("{cpu}: {:?} binds page space {}", self.tag, space.root_table());
        }
    }

    /// Invalidate every range queued since the last pass.
    ///
    /// A non-primary binding of a retiring space is released afterwards.
    pub(crate) fn shootdown<T: Tlb>(
        &mut self,
        cpu: CpuId,
        tlb: &mut T,
        full_flush_threshold: u64,
        is_primary: bool,
    ) {
        let Some(space) = self.bound.as_ref() else {
            return;
        };
        let tag = self.tag;
        let (sequence, finished) = space.catch_up(cpu, self.already_shot_sequence, |node| {
            invalidate_range(tlb, tag, node, full_flush_threshold);
        });
        self.already_shot_sequence = sequence;
        let retiring = space.wants_to_retire();
        finished.fire();

        if retiring && !is_primary {
            self.unbind(cpu);
        }
    }

    /// Release the bound space, acknowledging what the binding still owes.
    ///
    /// The tag keeps stale translations until the next `rebind_to`, which
    /// always flushes.
    pub(crate) fn unbind(&mut self, cpu: CpuId) {
        let Some(space) = self.bound.take() else {
            return;
        };
        log::debug!("{cpu}: {:?} releases page space {}", self.tag, space.root_table());
        self.primary_stamp = 0;
        space.detach(cpu, self.already_shot_sequence).fire();
    }
}

impl fmt::Debug for PageBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageBinding")
            .field("tag", &self.tag)
            .field("bound", &self.bound.as_ref().map(|s| s.root_table()))
            .field("primary_stamp", &self.primary_stamp)
            .field("already_shot_sequence", &self.already_shot_sequence)
            .finish()
    }
}

/// A CPU's binding of the kernel space.
#[derive(Default)]
pub struct GlobalPageBinding {
    bound: Option<Arc<PageSpace>>,
    already_shot_sequence: u64,
}

impl GlobalPageBinding {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bound: None,
            already_shot_sequence: 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    #[inline]
    #[must_use]
    pub const fn already_shot_sequence(&self) -> u64 {
        self.already_shot_sequence
    }

    pub(crate) fn holds(&self, space: &PageSpace) -> bool {
        self.bound
            .as_ref()
            .is_some_and(|b| core::ptr::eq(Arc::as_ptr(b), space))
    }

    /// ### Panics
    /// If already bound.
    pub(crate) fn bind(&mut self, cpu: CpuId, space: &Arc<PageSpace>) {
        assert!(self.bound.is_none(), "{cpu}: kernel space bound twice");
        self.already_shot_sequence = space.attach();
        self.bound = Some(Arc::clone(space));
        log::debug!("{cpu}: bound kernel page space {}", space.root_table());
    }

    pub(crate) fn shootdown<T: Tlb>(&mut self, cpu: CpuId, tlb: &mut T) {
        let Some(space) = self.bound.as_ref() else {
            return;
        };
        let (sequence, finished) = space.catch_up(cpu, self.already_shot_sequence, |node| {
            for va in node.pages() {
                tlb.invalidate_global_page(va);
            }
        });
        self.already_shot_sequence = sequence;
        finished.fire();
    }
}

impl fmt::Debug for GlobalPageBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalPageBinding")
            .field("bound", &self.bound.as_ref().map(|s| s.root_table()))
            .field("already_shot_sequence", &self.already_shot_sequence)
            .finish()
    }
}
