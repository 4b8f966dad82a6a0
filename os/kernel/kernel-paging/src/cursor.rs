//! # Page Trees and Cursors
//!
//! A [`PageTree`] is the radix tree of one page space: a root table plus the
//! intermediate tables realized so far. A [`Cursor`] walks it for one virtual
//! address at a time.
//!
//! ## Cursor caching
//!
//! The cursor holds one [`PageAccessor`] per level. Moving to a new address
//! keeps every accessor whose table is still on the path, i.e. whose prefix
//! of index bits is unchanged, and drops the chain below the first level
//! that differs:
//!
//! ```text
//! old ^ new  >>  LEVEL_SHIFTS[l - 1]  == 0   ⇒  accessor l still valid
//! ```
//!
//! Sequential walks therefore touch the upper levels once per 2 MiB.
//!
//! ## Concurrency
//!
//! - Leaf entries are edited with single atomic operations and no lock.
//! - Realizing a missing table takes the tree's grow lock, re-checks the
//!   entry and publishes the zeroed child with `Release`. Readers load
//!   intermediate entries with `Acquire`, so they never see a child table
//!   before its zeroed contents.
//! - Leaf edits are `Relaxed`; ordering towards other CPUs comes from the
//!   shootdown protocol, not from these atomics.
//!
//! ### Notes
//! - This module is the only place that reinterprets frame memory as
//!   `[AtomicU64; 512]`.

use crate::accessor::{PageAccessor, PhysMapper};
use crate::addresses::{PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress};
use crate::entry::{CachingMode, PageFlags, PageStatus, PageTableEntry};
use crate::error::PagingError;
use crate::space::SpaceFlavor;
use crate::{FrameAlloc, LEVEL_SHIFTS, PAGING_LEVELS, Platform, TABLE_ENTRIES};
use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::TicketLock;

type Table = [AtomicU64; TABLE_ENTRIES];

/// First root slot of the shared higher half.
const UPPER_HALF_FIRST_SLOT: usize = TABLE_ENTRIES / 2;

/// View the window of a table frame as atomic entries.
#[inline]
fn table<'a>(accessor: &'a PageAccessor<'_>) -> &'a Table {
    // SAFETY: accessors in this module only ever map page-table frames; the
    // window is 4 KiB, page aligned and lives as long as the accessor. Every
    // access goes through atomics, so sharing with hardware walkers and other
    // CPUs is sound.
    unsafe { &*accessor.as_ptr().cast::<Table>() }
}

/// Radix tree of one page space.
pub struct PageTree {
    root: PhysicalPage,
    flavor: SpaceFlavor,
    frames: Arc<dyn FrameAlloc>,
    mapper: Arc<dyn PhysMapper>,
    grow: TicketLock<()>,
}

impl PageTree {
    /// Allocate an empty root table.
    pub(crate) fn new(platform: &Platform, flavor: SpaceFlavor) -> Result<Self, PagingError> {
        let root = platform
            .frames
            .alloc_zeroed_4k()
            .ok_or(PagingError::OutOfMemory { level: 0 })?;
        Ok(Self::from_root(root, platform, flavor))
    }

    pub(crate) fn from_root(root: PhysicalPage, platform: &Platform, flavor: SpaceFlavor) -> Self {
        Self {
            root,
            flavor,
            frames: Arc::clone(&platform.frames),
            mapper: Arc::clone(&platform.mapper),
            grow: TicketLock::new(()),
        }
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn flavor(&self) -> SpaceFlavor {
        self.flavor
    }

    /// Start a walk at `va`.
    ///
    /// ### Panics
    /// If `va` is misaligned or outside the half this tree translates.
    #[must_use]
    pub fn cursor(&self, va: VirtualAddress) -> Cursor<'_> {
        Cursor::new(self, va)
    }

    #[inline]
    fn root_accessor(&self) -> PageAccessor<'_> {
        // SAFETY: the root frame belongs to this tree for its whole lifetime.
        unsafe { PageAccessor::new(&*self.mapper, self.root) }
    }

    /// Realize a PDPT behind every higher-half root slot.
    ///
    /// Client trees copy these slots once at creation, so they must never
    /// change afterwards.
    pub(crate) fn realize_upper_half(&self) -> Result<(), PagingError> {
        let root = self.root_accessor();
        let slots = table(&root);
        let _grow = self.grow.lock();
        for slot in &slots[UPPER_HALF_FIRST_SLOT..] {
            if PageTableEntry::from_bits(slot.load(Ordering::Acquire)).present() {
                continue;
            }
            let child = self
                .frames
                .alloc_zeroed_4k()
                .ok_or(PagingError::OutOfMemory { level: 1 })?;
            slot.store(
                PageTableEntry::table(child, self.flavor).into_bits(),
                Ordering::Release,
            );
        }
        Ok(())
    }

    /// Copy the higher-half root slots of `kernel` into this tree.
    pub(crate) fn share_upper_half(&self, kernel: &Self) {
        let ours = self.root_accessor();
        let theirs = kernel.root_accessor();
        let (ours, theirs) = (table(&ours), table(&theirs));
        for (dst, src) in ours[UPPER_HALF_FIRST_SLOT..]
            .iter()
            .zip(&theirs[UPPER_HALF_FIRST_SLOT..])
        {
            let e = PageTableEntry::from_bits(src.load(Ordering::Acquire));
            debug_assert!(e.present(), "kernel upper half is not realized");
            dst.store(e.into_bits(), Ordering::Release);
        }
    }

    /// Return every lower-half table and the root to the frame allocator.
    /// Leaf frames are not owned by the tree and stay untouched.
    fn reclaim(&self) -> usize {
        let mut freed = 0;
        {
            let root = self.root_accessor();
            for slot in &table(&root)[..UPPER_HALF_FIRST_SLOT] {
                let e = PageTableEntry::from_bits(slot.load(Ordering::Acquire));
                if e.present() {
                    freed += self.free_subtree(e.physical_page(), 1);
                }
            }
        }
        self.frames.free_4k(self.root);
        freed + 1
    }

    fn free_subtree(&self, frame: PhysicalPage, level: usize) -> usize {
        let mut freed = 0;
        if level < PAGING_LEVELS - 1 {
            // SAFETY: present intermediate entries point at tables of this tree.
            let acc = unsafe { PageAccessor::new(&*self.mapper, frame) };
            for slot in table(&acc) {
                let e = PageTableEntry::from_bits(slot.load(Ordering::Acquire));
                if e.present() {
                    freed += self.free_subtree(e.physical_page(), level + 1);
                }
            }
        }
        self.frames.free_4k(frame);
        freed + 1
    }
}

/// Client trees give their tables back when the owning
/// [`PageSpace`](crate::PageSpace) goes away, i.e. after the last binding and
/// the last cursor. Kernel trees are never freed.
impl Drop for PageTree {
    fn drop(&mut self) {
        if self.flavor == SpaceFlavor::Kernel {
            return;
        }
        let freed = self.reclaim();
        log::debug!("reclaimed {freed} page-table frames of tree {}", self.root);
    }
}

impl fmt::Debug for PageTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTree")
            .field("root", &self.root)
            .field("flavor", &self.flavor)
            .finish_non_exhaustive()
    }
}

/// Walks one [`PageTree`], caching a [`PageAccessor`] per level.
pub struct Cursor<'t> {
    tree: &'t PageTree,
    va: VirtualAddress,
    accessors: [Option<PageAccessor<'t>>; PAGING_LEVELS],
}

impl<'t> Cursor<'t> {
    fn new(tree: &'t PageTree, va: VirtualAddress) -> Self {
        Self::check_address(tree, va);
        Self {
            tree,
            va,
            accessors: [Some(tree.root_accessor()), None, None, None],
        }
    }

    fn check_address(tree: &PageTree, va: VirtualAddress) {
        assert!(va.is_page_aligned(), "virtual address {va} is not page aligned");
        let inside = match tree.flavor {
            SpaceFlavor::Kernel => va.is_higher_half(),
            SpaceFlavor::Client => va.is_lower_half(),
        };
        assert!(inside, "virtual address {va} is outside the {:?} half", tree.flavor);
    }

    #[inline]
    #[must_use]
    pub const fn virtual_address(&self) -> VirtualAddress {
        self.va
    }

    /// Reposition the cursor, keeping the accessors still on the path.
    pub fn move_to(&mut self, va: VirtualAddress) {
        Self::check_address(self.tree, va);
        let diff = self.va.as_u64() ^ va.as_u64();
        for level in 1..PAGING_LEVELS {
            if diff >> LEVEL_SHIFTS[level - 1] != 0 {
                for acc in &mut self.accessors[level..] {
                    *acc = None;
                }
                break;
            }
        }
        self.va = va;
    }

    pub fn advance_4k(&mut self) {
        self.move_to(self.va + PAGE_SIZE);
    }

    /// Map accessors for the realized part of the path. Returns the number of
    /// levels now accessible (`PAGING_LEVELS` means the leaf table is).
    fn access_tables(&mut self) -> usize {
        let tree = self.tree;
        for level in 1..PAGING_LEVELS {
            if self.accessors[level].is_some() {
                continue;
            }
            let Some(parent) = self.accessors[level - 1].as_ref() else {
                return level - 1;
            };
            let idx = self.va.table_index(LEVEL_SHIFTS[level - 1]);
            let e = PageTableEntry::from_bits(table(parent)[idx].load(Ordering::Acquire));
            if !e.present() {
                return level;
            }
            // SAFETY: a present intermediate entry points at a table of this tree.
            self.accessors[level] = Some(unsafe { PageAccessor::new(&*tree.mapper, e.physical_page()) });
        }
        PAGING_LEVELS
    }

    /// Like [`access_tables`](Self::access_tables), realizing missing levels.
    fn realize_tables(&mut self) -> Result<(), PagingError> {
        let tree = self.tree;
        for level in 1..PAGING_LEVELS {
            if self.accessors[level].is_some() {
                continue;
            }
            let idx = self.va.table_index(LEVEL_SHIFTS[level - 1]);
            let child = {
                let Some(parent) = self.accessors[level - 1].as_ref().map(table) else {
                    unreachable!("level {level} realized before its parent");
                };
                let slot = &parent[idx];
                let e = PageTableEntry::from_bits(slot.load(Ordering::Acquire));
                if e.present() {
                    e.physical_page()
                } else {
                    let _grow = tree.grow.lock();
                    let e = PageTableEntry::from_bits(slot.load(Ordering::Acquire));
                    if e.present() {
                        e.physical_page()
                    } else {
                        let child = tree
                            .frames
                            .alloc_zeroed_4k()
                            .ok_or(PagingError::OutOfMemory { level })?;
                        slot.store(
                            PageTableEntry::table(child, tree.flavor).into_bits(),
                            Ordering::Release,
                        );
                        log::trace!("realized level {level} table {child} for {}", self.va);
                        child
                    }
                }
            };
            // SAFETY: `child` is a table of this tree, published above or earlier.
            self.accessors[level] = Some(unsafe { PageAccessor::new(&*tree.mapper, child) });
        }
        Ok(())
    }

    /// Leaf slot of the current address, if its table is realized.
    fn leaf_slot(&mut self) -> Option<&AtomicU64> {
        if self.access_tables() < PAGING_LEVELS {
            return None;
        }
        let idx = self.va.table_index(LEVEL_SHIFTS[PAGING_LEVELS - 1]);
        self.accessors[PAGING_LEVELS - 1]
            .as_ref()
            .map(|acc| &table(acc)[idx])
    }

    fn realized_leaf_slot(&mut self) -> Result<&AtomicU64, PagingError> {
        self.realize_tables()?;
        let va = self.va;
        match self.leaf_slot() {
            Some(slot) => Ok(slot),
            None => unreachable!("leaf table of {va} vanished after realization"),
        }
    }

    fn leaf_entry(&self, physical: PhysicalAddress, flags: PageFlags, caching: CachingMode) -> u64 {
        assert!(
            physical.is_page_aligned(),
            "physical address {physical} is not page aligned"
        );
        PageTableEntry::leaf(PhysicalPage::new(physical), flags, caching, self.tree.flavor).into_bits()
    }

    /// Install a 4 KiB mapping at the current address.
    ///
    /// # Errors
    /// [`PagingError::OutOfMemory`] if a missing table could not be allocated.
    ///
    /// ### Panics
    /// If the address is already mapped or `physical` is misaligned.
    pub fn map_4k(
        &mut self,
        physical: PhysicalAddress,
        flags: PageFlags,
        caching: CachingMode,
    ) -> Result<(), PagingError> {
        let new = self.leaf_entry(physical, flags, caching);
        let va = self.va;
        let slot = self.realized_leaf_slot()?;
        let old = slot.load(Ordering::Relaxed);
        assert!(
            old & PageTableEntry::PRESENT_BIT == 0,
            "virtual address {va} is already mapped"
        );
        slot.store(new, Ordering::Relaxed);
        Ok(())
    }

    /// Replace the mapping at the current address, returning the previous status.
    ///
    /// # Errors
    /// [`PagingError::OutOfMemory`] if a missing table could not be allocated.
    pub fn remap_4k(
        &mut self,
        physical: PhysicalAddress,
        flags: PageFlags,
        caching: CachingMode,
    ) -> Result<PageStatus, PagingError> {
        let new = self.leaf_entry(physical, flags, caching);
        let slot = self.realized_leaf_slot()?;
        Ok(PageStatus::from_raw(slot.swap(new, Ordering::Relaxed)))
    }

    /// Clear the dirty bit, returning the status before clearing.
    pub fn clean_4k(&mut self) -> PageStatus {
        self.leaf_slot().map_or(PageStatus::empty(), |slot| {
            PageStatus::from_raw(slot.fetch_and(!PageTableEntry::DIRTY_BIT, Ordering::Relaxed))
        })
    }

    /// Remove the mapping, returning its status. Unmapped addresses report empty.
    pub fn unmap_4k(&mut self) -> PageStatus {
        self.take_4k().map_or(PageStatus::empty(), PageTableEntry::status)
    }

    /// Remove the mapping, returning the entry it replaced.
    pub fn take_4k(&mut self) -> Option<PageTableEntry> {
        let e = PageTableEntry::from_bits(self.leaf_slot()?.swap(0, Ordering::Relaxed));
        e.present().then_some(e)
    }

    /// The present leaf entry of the current address.
    pub fn peek(&mut self) -> Option<PageTableEntry> {
        let e = PageTableEntry::from_bits(self.leaf_slot()?.load(Ordering::Relaxed));
        e.present().then_some(e)
    }

    /// Physical frame mapped at the current address.
    pub fn physical(&mut self) -> Option<PhysicalAddress> {
        self.peek().map(PageTableEntry::physical_address)
    }

    /// Set the accessed bit. `true` if the page is present and the bit was
    /// clear before.
    pub fn update_access(&mut self) -> bool {
        let Some(slot) = self.leaf_slot() else {
            return false;
        };
        let mut cur = slot.load(Ordering::Relaxed);
        loop {
            if cur & PageTableEntry::PRESENT_BIT == 0 || cur & PageTableEntry::ACCESSED_BIT != 0 {
                return false;
            }
            match slot.compare_exchange_weak(
                cur,
                cur | PageTableEntry::ACCESSED_BIT,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(now) => cur = now,
            }
        }
    }

    /// Advance to the first present page in `[current, limit)`.
    pub fn find_present(&mut self, limit: VirtualAddress) -> Option<VirtualAddress> {
        self.find(limit, |raw| raw & PageTableEntry::PRESENT_BIT != 0)
    }

    /// Advance to the first present, dirty page in `[current, limit)`.
    pub fn find_dirty(&mut self, limit: VirtualAddress) -> Option<VirtualAddress> {
        let both = PageTableEntry::PRESENT_BIT | PageTableEntry::DIRTY_BIT;
        self.find(limit, |raw| raw & both == both)
    }

    fn find(&mut self, limit: VirtualAddress, hit: impl Fn(u64) -> bool) -> Option<VirtualAddress> {
        while self.va < limit {
            let levels = self.access_tables();
            let span_shift = if levels < PAGING_LEVELS {
                // the whole subtree behind the missing entry is empty
                LEVEL_SHIFTS[levels - 1]
            } else {
                let idx = self.va.table_index(LEVEL_SHIFTS[PAGING_LEVELS - 1]);
                let acc = self.accessors[PAGING_LEVELS - 1].as_ref()?;
                if hit(table(acc)[idx].load(Ordering::Relaxed)) {
                    return Some(self.va);
                }
                LEVEL_SHIFTS[PAGING_LEVELS - 1]
            };
            let span = 1u64 << span_shift;
            let next = VirtualAddress::new((self.va.as_u64() & !(span - 1)).checked_add(span)?);
            if next >= limit || !next.is_canonical() {
                return None;
            }
            self.move_to(next);
        }
        None
    }
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("root", &self.tree.root)
            .field("va", &self.va)
            .finish_non_exhaustive()
    }
}
