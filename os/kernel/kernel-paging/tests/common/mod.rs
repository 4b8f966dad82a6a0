//! Simulated machine for the integration tests: RAM that backs the page
//! tables, a per-CPU TLB that caches translations like hardware does, and a
//! shootdown signal that only records requests.
#![allow(dead_code)]

use kernel_paging::{
    ClientPageSpace, CpuId, FrameAlloc, KernelPageSpace, LEVEL_SHIFTS, PAGING_LEVELS,
    PageContext, PageTableEntry, PagingConfig, PhysMapper, PhysicalAddress, PhysicalPage,
    Platform, ShootdownSignal, TagSlot, Tlb, VirtualAddress,
};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Physical address of the first simulated frame.
pub const RAM_BASE: u64 = 0x0100_0000;

/// Frames the kernel space takes: root plus 256 higher-half PDPTs.
pub const KERNEL_FRAMES: usize = 257;

#[repr(C, align(4096))]
struct Frame(UnsafeCell<[u8; 4096]>);

pub struct SimRam {
    frames: Box<[Frame]>,
    free: Mutex<Vec<usize>>,
    allocated: AtomicUsize,
    windows: AtomicUsize,
}

// SAFETY: frame contents are only touched through atomics or by a single
// allocating thread before publication.
unsafe impl Sync for SimRam {}

impl SimRam {
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames).map(|_| Frame(UnsafeCell::new([0; 4096]))).collect(),
            free: Mutex::new((0..frames).rev().collect()),
            allocated: AtomicUsize::new(0),
            windows: AtomicUsize::new(0),
        }
    }

    /// Frames currently handed out.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::SeqCst)
    }

    /// Accessor windows currently open.
    pub fn open_windows(&self) -> usize {
        self.windows.load(Ordering::SeqCst)
    }

    fn index(&self, frame: PhysicalPage) -> usize {
        let pa = frame.base().as_u64();
        assert!(pa >= RAM_BASE, "{frame:?} is below simulated RAM");
        let idx = ((pa - RAM_BASE) / 4096) as usize;
        assert!(idx < self.frames.len(), "{frame:?} is above simulated RAM");
        idx
    }

    /// Entry `index` of the table in `table`, as the hardware walker sees it.
    pub fn entry(&self, table: PhysicalPage, index: usize) -> &AtomicU64 {
        let base = self.frames[self.index(table)].0.get().cast::<AtomicU64>();
        // SAFETY: in bounds of a 4 KiB, 8-aligned frame.
        unsafe { &*base.add(index) }
    }

    /// Leaf slot for `va` under `root`, walking like the MMU does.
    pub fn leaf_slot(&self, root: PhysicalPage, va: VirtualAddress) -> Option<&AtomicU64> {
        let mut table = root;
        for (level, shift) in LEVEL_SHIFTS.iter().enumerate() {
            let slot = self.entry(table, ((va.as_u64() >> shift) & 0x1FF) as usize);
            if level == PAGING_LEVELS - 1 {
                return Some(slot);
            }
            let e = PageTableEntry::from_bits(slot.load(Ordering::Acquire));
            if !e.present() {
                return None;
            }
            table = e.physical_page();
        }
        None
    }
}

impl FrameAlloc for SimRam {
    fn alloc_zeroed_4k(&self) -> Option<PhysicalPage> {
        let idx = self.free.lock().unwrap().pop()?;
        // SAFETY: the frame was free, nobody else can see it.
        unsafe { (*self.frames[idx].0.get()).fill(0) };
        self.allocated.fetch_add(1, Ordering::SeqCst);
        Some(PhysicalPage::new(PhysicalAddress::new(
            RAM_BASE + idx as u64 * 4096,
        )))
    }

    fn free_4k(&self, frame: PhysicalPage) {
        let idx = self.index(frame);
        let mut free = self.free.lock().unwrap();
        assert!(!free.contains(&idx), "double free of {frame:?}");
        free.push(idx);
        self.allocated.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PhysMapper for SimRam {
    unsafe fn map_frame(&self, frame: PhysicalPage) -> NonNull<u8> {
        let idx = self.index(frame);
        self.windows.fetch_add(1, Ordering::SeqCst);
        NonNull::new(self.frames[idx].0.get().cast::<u8>()).unwrap()
    }

    unsafe fn unmap_frame(&self, _frame: PhysicalPage, _window: NonNull<u8>) {
        let prev = self.windows.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "window released twice");
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct Cached {
    frame: u64,
    dirty: bool,
}

/// A CPU's translation cache, tagged like PCIDs.
pub struct SimTlb {
    ram: Arc<SimRam>,
    current: Option<(PhysicalPage, TagSlot)>,
    tag_roots: HashMap<TagSlot, PhysicalPage>,
    cached: HashMap<(TagSlot, u64), Cached>,
    global: HashMap<u64, Cached>,
    pub loads: Vec<(PhysicalPage, TagSlot, bool)>,
    pub tag_flushes: Vec<TagSlot>,
    pub page_invalidations: usize,
    /// Loads that kept a tag's translations while switching its root.
    pub violations: Vec<String>,
}

impl SimTlb {
    pub fn new(ram: Arc<SimRam>) -> Self {
        Self {
            ram,
            current: None,
            tag_roots: HashMap::new(),
            cached: HashMap::new(),
            global: HashMap::new(),
            loads: Vec::new(),
            tag_flushes: Vec::new(),
            page_invalidations: 0,
            violations: Vec::new(),
        }
    }

    pub fn current_root(&self) -> Option<PhysicalPage> {
        self.current.map(|(root, _)| root)
    }

    pub fn last_load(&self) -> Option<(PhysicalPage, TagSlot, bool)> {
        self.loads.last().copied()
    }

    /// `true` if a translation of `va` is cached for the active tag or globally.
    pub fn is_cached(&self, va: VirtualAddress) -> bool {
        let page = va.page_base().as_u64();
        self.global.contains_key(&page)
            || self
                .current
                .is_some_and(|(_, tag)| self.cached.contains_key(&(tag, page)))
    }

    /// CPU load from `va`.
    pub fn read(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.access(va, false)
    }

    /// CPU store to `va`.
    pub fn write(&mut self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.access(va, true)
    }

    fn access(&mut self, va: VirtualAddress, write: bool) -> Option<PhysicalAddress> {
        let (root, tag) = self.current?;
        let page = va.page_base().as_u64();
        let offset = va.as_u64() - page;
        let hit = self
            .global
            .get(&page)
            .or_else(|| self.cached.get(&(tag, page)))
            .copied();
        if let Some(hit) = hit {
            if !write || hit.dirty {
                return Some(PhysicalAddress::new(hit.frame + offset));
            }
        }

        let ram = Arc::clone(&self.ram);
        let slot = ram.leaf_slot(root, va.page_base())?;
        let e = PageTableEntry::from_bits(slot.load(Ordering::Relaxed));
        if !e.present() || (write && !e.writable()) {
            return None;
        }
        let mut set = PageTableEntry::ACCESSED_BIT;
        if write {
            set |= PageTableEntry::DIRTY_BIT;
        }
        slot.fetch_or(set, Ordering::Relaxed);

        let entry = Cached {
            frame: e.physical_address().as_u64(),
            dirty: write,
        };
        if e.global() {
            self.global.insert(page, entry);
        } else {
            self.cached.insert((tag, page), entry);
        }
        Some(PhysicalAddress::new(entry.frame + offset))
    }
}

impl Tlb for SimTlb {
    fn load_root(&mut self, root: PhysicalPage, tag: TagSlot, flush: bool) {
        if flush {
            self.cached.retain(|(t, _), _| *t != tag);
        } else if self.tag_roots.get(&tag) != Some(&root) {
            self.violations
                .push(format!("{tag:?} switched to {root:?} without a flush"));
        }
        self.tag_roots.insert(tag, root);
        self.current = Some((root, tag));
        self.loads.push((root, tag, flush));
    }

    fn invalidate_page(&mut self, tag: TagSlot, va: VirtualAddress) {
        self.cached.remove(&(tag, va.as_u64()));
        self.page_invalidations += 1;
    }

    fn invalidate_tag(&mut self, tag: TagSlot) {
        self.cached.retain(|(t, _), _| *t != tag);
        self.tag_flushes.push(tag);
    }

    fn invalidate_global_page(&mut self, va: VirtualAddress) {
        self.global.remove(&va.as_u64());
        if let Some((_, tag)) = self.current {
            self.cached.remove(&(tag, va.as_u64()));
        }
    }
}

/// Records shootdown requests instead of sending interrupts.
#[derive(Default)]
pub struct RecordingSignal {
    requests: Mutex<Vec<Option<CpuId>>>,
}

impl RecordingSignal {
    pub fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<Option<CpuId>> {
        self.requests.lock().unwrap().last().copied()
    }
}

impl ShootdownSignal for RecordingSignal {
    fn request_shootdown(&self, initiator: Option<CpuId>) {
        self.requests.lock().unwrap().push(initiator);
    }
}

/// Counts completion callbacks.
#[derive(Clone, Default)]
pub struct Hits(Arc<AtomicUsize>);

impl Hits {
    pub fn hook(&self) -> impl FnOnce() + Send + 'static {
        let hits = Arc::clone(&self.0);
        move || {
            hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Machine {
    pub ram: Arc<SimRam>,
    pub signal: Arc<RecordingSignal>,
    pub platform: Platform,
    pub kernel: KernelPageSpace,
}

impl Machine {
    pub fn new() -> Self {
        Self::with_frames(1024)
    }

    pub fn with_frames(frames: usize) -> Self {
        let ram = Arc::new(SimRam::new(frames));
        let signal = Arc::new(RecordingSignal::default());
        let platform = Platform {
            frames: ram.clone(),
            mapper: ram.clone(),
            signal: signal.clone(),
        };
        let kernel = KernelPageSpace::new(&platform).unwrap();
        Self {
            ram,
            signal,
            platform,
            kernel,
        }
    }

    pub fn cpu(&self, id: u32) -> PageContext<SimTlb> {
        self.cpu_with(id, &PagingConfig::default())
    }

    pub fn cpu_with(&self, id: u32, config: &PagingConfig) -> PageContext<SimTlb> {
        PageContext::new(
            CpuId(id),
            SimTlb::new(Arc::clone(&self.ram)),
            config,
            &self.kernel,
        )
    }

    pub fn client(&self) -> ClientPageSpace {
        ClientPageSpace::new(&self.platform, &self.kernel).unwrap()
    }
}

pub const fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

pub const fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}
