//! # Page Spaces
//!
//! A [`PageSpace`] is the part of an address space the CPUs agree on: how
//! many bindings hold it, which shootdowns are still in flight and whether
//! it is being retired. The radix tree itself is a [`PageTree`]; the
//! [`KernelPageSpace`](crate::KernelPageSpace) and
//! [`ClientPageSpace`](crate::ClientPageSpace) wrappers add the mapping API.
//!
//! ## Shootdown sequence numbers
//!
//! Every queued [`ShootNode`] gets the next `shoot_sequence`. A binding
//! remembers the last sequence it has processed (`already_shot_sequence`);
//! all queued nodes above it are still owed an acknowledgement by that
//! binding, except nodes the binding's own CPU initiated (it invalidated
//! them synchronously and was not counted).
//!
//! ```text
//!   queue:   seq 4 ── seq 5 ── seq 6
//!   cpu1:    already_shot = 4   → owes 5, 6
//!   cpu2:    already_shot = 6   → up to date
//! ```
//!
//! ## Retirement
//!
//! [`PageSpace::retire`] marks the space; non-primary bindings drop it on
//! their next shootdown pass and the primary one when its CPU switches away.
//! The [`RetireNode`] fires when the last binding is released, at which
//! point no node can be left in the queue.

use crate::context::PageContext;
use crate::cursor::PageTree;
use crate::shoot::{RetireNode, ShootNode};
use crate::tlb::Tlb;
use crate::{CpuId, ShootdownSignal};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_sync::TicketLock;

/// Which half of the address space a page space translates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SpaceFlavor {
    /// Higher half; global, supervisor-only leaves; never retired.
    Kernel,
    /// Lower half; user leaves; retired when its owner is done with it.
    Client,
}

struct SpaceState {
    num_bindings: usize,
    shoot_sequence: u64,
    queue: BTreeMap<u64, ShootNode>,
    retire_node: Option<RetireNode>,
}

/// Work that finished under the page-space lock and must be signalled
/// after it is dropped.
#[must_use]
pub(crate) struct Finished {
    nodes: Vec<ShootNode>,
    retire: Option<RetireNode>,
}

impl Finished {
    pub(crate) fn fire(self) {
        for node in self.nodes {
            node.complete();
        }
        if let Some(retire) = self.retire {
            retire.complete();
        }
    }
}

/// Binding bookkeeping, shootdown queue and retirement gate of one tree.
pub struct PageSpace {
    tree: PageTree,
    signal: Arc<dyn ShootdownSignal>,
    want_to_retire: AtomicBool,
    state: TicketLock<SpaceState>,
}

impl PageSpace {
    pub(crate) fn new(tree: PageTree, signal: Arc<dyn ShootdownSignal>) -> Self {
        Self {
            tree,
            signal,
            want_to_retire: AtomicBool::new(false),
            state: TicketLock::new(SpaceState {
                num_bindings: 0,
                shoot_sequence: 0,
                queue: BTreeMap::new(),
                retire_node: None,
            }),
        }
    }

    #[inline]
    #[must_use]
    pub const fn tree(&self) -> &PageTree {
        &self.tree
    }

    #[inline]
    #[must_use]
    pub const fn root_table(&self) -> crate::PhysicalPage {
        self.tree.root()
    }

    #[inline]
    #[must_use]
    pub const fn flavor(&self) -> SpaceFlavor {
        self.tree.flavor()
    }

    #[must_use]
    pub fn num_bindings(&self) -> usize {
        self.state.lock().num_bindings
    }

    #[must_use]
    pub fn shoot_sequence(&self) -> u64 {
        self.state.lock().shoot_sequence
    }

    /// Nodes still waiting for acknowledgements.
    #[must_use]
    pub fn pending_shootdowns(&self) -> usize {
        self.state.lock().queue.len()
    }

    #[inline]
    #[must_use]
    pub fn wants_to_retire(&self) -> bool {
        self.want_to_retire.load(Ordering::Acquire)
    }

    /// Make `space` the active address space of the CPU owning `ctx`.
    ///
    /// ### Panics
    /// If `space` is the kernel space or is being retired.
    pub fn activate<T: Tlb>(space: &Arc<Self>, ctx: &mut PageContext<T>) {
        ctx.activate(space);
    }

    /// Invalidate `[node.address, node.address + node.size)` on every CPU.
    ///
    /// The calling CPU invalidates synchronously. Returns `true` if other CPUs
    /// still owe an acknowledgement; the completion fires once the last one
    /// lands. Returns `false` if nobody else had the space bound, in which
    /// case the completion has already run.
    ///
    /// ### Panics
    /// On an empty or misaligned range, or one that leaves its canonical half.
    pub fn submit_shootdown<T: Tlb>(&self, ctx: &mut PageContext<T>, node: ShootNode) -> bool {
        node.validate();
        let bound_here = ctx.invalidate_local(self, &node);
        self.enqueue(ctx.cpu(), bound_here, node)
    }

    fn enqueue(&self, cpu: CpuId, bound_here: bool, mut node: ShootNode) -> bool {
        let mut state = self.state.lock();
        let unshot = if bound_here {
            state.num_bindings - 1
        } else {
            state.num_bindings
        };
        if unshot == 0 {
            drop(state);
            node.complete();
            return false;
        }

        state.shoot_sequence += 1;
        node.initiator = Some(cpu);
        node.sequence = state.shoot_sequence;
        node.bindings_to_shoot = unshot;
        log::trace!(
            "{cpu}: queued shootdown #{} of {:#x} bytes at {} for {unshot} bindings",
            node.sequence,
            node.size(),
            node.address()
        );
        state.queue.insert(node.sequence, node);
        drop(state);

        self.signal.request_shootdown(Some(cpu));
        true
    }

    /// Ask for `node` to fire once no CPU has this space bound any more.
    ///
    /// ### Panics
    /// On the kernel space, or if the space is already retiring.
    pub fn retire(&self, node: RetireNode) {
        assert!(
            self.flavor() == SpaceFlavor::Client,
            "the kernel page space cannot be retired"
        );
        let was = self.want_to_retire.swap(true, Ordering::AcqRel);
        assert!(!was, "page space {} retired twice", self.root_table());

        let mut state = self.state.lock();
        if state.num_bindings == 0 {
            drop(state);
            log::debug!("page space {} retired immediately", self.root_table());
            node.complete();
            return;
        }
        log::debug!(
            "page space {} retiring, waiting for {} bindings",
            self.root_table(),
            state.num_bindings
        );
        state.retire_node = Some(node);
        drop(state);

        self.signal.request_shootdown(None);
    }

    /// Register a new binding. Returns the sequence it starts from.
    pub(crate) fn attach(&self) -> u64 {
        let mut state = self.state.lock();
        assert!(
            !self.wants_to_retire(),
            "cannot bind retiring page space {}",
            self.root_table()
        );
        state.num_bindings += 1;
        state.shoot_sequence
    }

    /// Process every node above `already_shot` not initiated by `cpu`.
    ///
    /// `invalidate` runs under the lock for each such node. Returns the
    /// current sequence and the nodes whose countdown reached zero.
    pub(crate) fn catch_up(
        &self,
        cpu: CpuId,
        already_shot: u64,
        invalidate: impl FnMut(&ShootNode),
    ) -> (u64, Finished) {
        let mut state = self.state.lock();
        let finished = Finished {
            nodes: state.acknowledge(cpu, already_shot, invalidate),
            retire: None,
        };
        (state.shoot_sequence, finished)
    }

    /// Drop a binding that has processed everything up to `already_shot`.
    ///
    /// Acknowledges the nodes it still owes and, if it was the last binding
    /// of a retiring space, hands back the retire node.
    pub(crate) fn detach(&self, cpu: CpuId, already_shot: u64) -> Finished {
        let mut state = self.state.lock();
        let mut finished = Finished {
            nodes: state.acknowledge(cpu, already_shot, |_| {}),
            retire: None,
        };
        state.num_bindings -= 1;
        if state.num_bindings == 0 && self.wants_to_retire() {
            debug_assert!(state.queue.is_empty(), "retired space has pending shootdowns");
            finished.retire = state.retire_node.take();
            if finished.retire.is_some() {
                log::debug!("page space {} is quiescent", self.root_table());
            }
        }
        finished
    }
}

impl SpaceState {
    /// Count one acknowledgement on every node a binding still owes and
    /// unlink the nodes that need no further ones.
    fn acknowledge(
        &mut self,
        cpu: CpuId,
        already_shot: u64,
        mut invalidate: impl FnMut(&ShootNode),
    ) -> Vec<ShootNode> {
        let mut done = Vec::new();
        for (&seq, node) in self.queue.range_mut(already_shot + 1..) {
            if node.initiator == Some(cpu) {
                continue;
            }
            invalidate(node);
            node.bindings_to_shoot -= 1;
            if node.bindings_to_shoot == 0 {
                done.push(seq);
            }
        }
        done.into_iter()
            .filter_map(|seq| self.queue.remove(&seq))
            .collect()
    }
}

impl fmt::Debug for PageSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageSpace")
            .field("root", &self.root_table())
            .field("flavor", &self.flavor())
            .field("want_to_retire", &self.wants_to_retire())
            .finish_non_exhaustive()
    }
}
