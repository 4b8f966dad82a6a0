//! # Per-CPU Page Context
//!
//! Each CPU owns exactly one [`PageContext`]; nothing else ever touches it,
//! so every operation takes `&mut self`. It holds
//!
//! - the CPU's translation cache ([`Tlb`]),
//! - a fixed array of [`PageBinding`]s, one per tag slot,
//! - the index of the **primary** binding (the space currently loaded),
//! - a stamp counter ordering the bindings by last use,
//! - the [`GlobalPageBinding`] of the kernel space.
//!
//! ## Slot selection
//!
//! [`activate`](PageContext::activate) reuses the slot already holding the
//! space. Otherwise it takes a free slot, and if there is none, evicts the
//! binding with the lowest `primary_stamp`.

use crate::binding::{GlobalPageBinding, PageBinding, invalidate_range};
use crate::config::PagingConfig;
use crate::kernel_space::KernelPageSpace;
use crate::shoot::ShootNode;
use crate::space::{PageSpace, SpaceFlavor};
use crate::CpuId;
use crate::tlb::{TagSlot, Tlb};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

pub struct PageContext<T: Tlb> {
    cpu: CpuId,
    tlb: T,
    bindings: Vec<PageBinding>,
    primary: Option<usize>,
    next_stamp: u64,
    global: GlobalPageBinding,
    full_flush_threshold: u64,
}

impl<T: Tlb> PageContext<T> {
    /// Set up the context of `cpu` and bind the kernel space.
    #[must_use]
    pub fn new(cpu: CpuId, tlb: T, config: &PagingConfig, kernel: &KernelPageSpace) -> Self {
        let bindings = (0..config.tag_slots())
            .map(|slot| PageBinding::new(TagSlot::new(slot as u16)))
            .collect();
        let mut global = GlobalPageBinding::new();
        global.bind(cpu, kernel.space());
        Self {
            cpu,
            tlb,
            bindings,
            primary: None,
            next_stamp: 1,
            global,
            full_flush_threshold: config.full_flush_threshold(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn cpu(&self) -> CpuId {
        self.cpu
    }

    #[inline]
    #[must_use]
    pub const fn tlb(&self) -> &T {
        &self.tlb
    }

    #[inline]
    pub const fn tlb_mut(&mut self) -> &mut T {
        &mut self.tlb
    }

    #[inline]
    #[must_use]
    pub fn bindings(&self) -> &[PageBinding] {
        &self.bindings
    }

    #[inline]
    #[must_use]
    pub const fn global_binding(&self) -> &GlobalPageBinding {
        &self.global
    }

    /// Slot index of the primary binding.
    #[inline]
    #[must_use]
    pub const fn primary(&self) -> Option<usize> {
        self.primary
    }

    /// The currently active client space.
    #[must_use]
    pub fn primary_space(&self) -> Option<&Arc<PageSpace>> {
        self.primary.and_then(|i| self.bindings[i].bound_space())
    }

    /// Slot index holding `space`, if any.
    #[must_use]
    pub fn find_binding(&self, space: &PageSpace) -> Option<usize> {
        self.bindings.iter().position(|b| b.holds(space))
    }

    const fn stamp(&mut self) -> u64 {
        let s = self.next_stamp;
        self.next_stamp += 1;
        s
    }

    /// Load `space` on this CPU.
    ///
    /// ### Panics
    /// If `space` is the kernel space or is being retired.
    pub fn activate(&mut self, space: &Arc<PageSpace>) {
        assert!(
            space.flavor() == SpaceFlavor::Client,
            "{}: the kernel page space cannot be activated",
            self.cpu
        );
        assert!(
            !space.wants_to_retire(),
            "{}: cannot activate retiring page space {}",
            self.cpu,
            space.root_table()
        );

        if let Some(slot) = self.find_binding(space) {
            if self.primary != Some(slot) {
                let stamp = self.stamp();
                self.bindings[slot].rebind(self.cpu, &mut self.tlb, stamp);
                self.primary = Some(slot);
            }
        } else {
            let slot = self.pick_slot();
            let stamp = self.stamp();
            self.bindings[slot].rebind_to(self.cpu, &mut self.tlb, space, stamp);
            self.primary = Some(slot);
        }

        self.release_retiring();
    }

    /// A free slot, else the least recently stamped one.
    fn pick_slot(&self) -> usize {
        if let Some(free) = self.bindings.iter().position(|b| !b.is_bound()) {
            return free;
        }
        self.bindings
            .iter()
            .enumerate()
            .min_by_key(|(_, b)| b.primary_stamp())
            .map_or(0, |(i, _)| i)
    }

    /// Drop non-primary bindings of spaces that want to retire.
    fn release_retiring(&mut self) {
        for (i, binding) in self.bindings.iter_mut().enumerate() {
            if Some(i) == self.primary {
                continue;
            }
            if binding.bound_space().is_some_and(|s| s.wants_to_retire()) {
                binding.unbind(self.cpu);
            }
        }
    }

    /// Process the pending shootdowns of every bound space.
    ///
    /// This is what a CPU runs when it receives the shootdown signal.
    pub fn shootdown(&mut self) {
        self.global.shootdown(self.cpu, &mut self.tlb);
        for (i, binding) in self.bindings.iter_mut().enumerate() {
            binding.shootdown(
                self.cpu,
                &mut self.tlb,
                self.full_flush_threshold,
                Some(i) == self.primary,
            );
        }
    }

    /// Release the binding in `slot`.
    ///
    /// ### Panics
    /// If `slot` is the primary binding.
    pub fn unbind(&mut self, slot: usize) {
        assert!(
            Some(slot) != self.primary,
            "{}: cannot unbind the primary binding",
            self.cpu
        );
        self.bindings[slot].unbind(self.cpu);
    }

    /// Invalidate the range of `node` on this CPU if `space` is bound here.
    pub(crate) fn invalidate_local(&mut self, space: &PageSpace, node: &ShootNode) -> bool {
        if self.global.holds(space) {
            for va in node.pages() {
                self.tlb.invalidate_global_page(va);
            }
            return true;
        }
        let Some(slot) = self.find_binding(space) else {
            return false;
        };
        let tag = self.bindings[slot].tag();
        invalidate_range(&mut self.tlb, tag, node, self.full_flush_threshold);
        true
    }
}

impl<T: Tlb> fmt::Debug for PageContext<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageContext")
            .field("cpu", &self.cpu)
            .field("bindings", &self.bindings)
            .field("primary", &self.primary)
            .field("next_stamp", &self.next_stamp)
            .field("global", &self.global)
            .finish_non_exhaustive()
    }
}
