//! # Page Accessors
//!
//! Physical frames (page tables in particular) are not addressable by
//! themselves; a [`PhysMapper`] makes a frame visible at some virtual window
//! and a [`PageAccessor`] owns that window for as long as it lives.
//!
//! ## Mapping strategies
//! - **Kernel**: a higher-half direct map (HHDM); [`DirectMapper`] adds a
//!   constant offset and never needs to tear anything down.
//! - **Tests / temporary mappings**: the mapper may hand out real windows and
//!   release them in [`PhysMapper::unmap_frame`].
//!
//! ### Notes
//! - Accessors are move-only; dropping one releases its window on every path,
//!   including unwinding.

use crate::addresses::PhysicalPage;
use core::fmt;
use core::ptr::NonNull;

/// Makes physical frames temporarily addressable.
pub trait PhysMapper: Send + Sync {
    /// Make `frame` addressable and return the start of its 4 KiB window.
    ///
    /// # Safety
    /// `frame` must be RAM this mapper can reach. The window must stay valid
    /// until the matching [`unmap_frame`](Self::unmap_frame).
    unsafe fn map_frame(&self, frame: PhysicalPage) -> NonNull<u8>;

    /// Release a window returned by [`map_frame`](Self::map_frame).
    ///
    /// # Safety
    /// `window` must have been returned by `map_frame(frame)` on this mapper
    /// and must not be used afterwards.
    unsafe fn unmap_frame(&self, frame: PhysicalPage, window: NonNull<u8>) {
        let _ = (frame, window);
    }
}

/// [`PhysMapper`] for a higher-half direct map: frame `pa` is visible at
/// `base + pa`.
#[derive(Debug, Copy, Clone)]
pub struct DirectMapper {
    base: u64,
}

impl DirectMapper {
    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self { base }
    }

    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }
}

impl PhysMapper for DirectMapper {
    unsafe fn map_frame(&self, frame: PhysicalPage) -> NonNull<u8> {
        let va = self.base.wrapping_add(frame.base().as_u64()) as *mut u8;
        // SAFETY: the direct map never places a frame at virtual zero.
        unsafe { NonNull::new_unchecked(va) }
    }
}

/// Exclusive handle on the window of one mapped frame.
pub struct PageAccessor<'m> {
    mapper: &'m dyn PhysMapper,
    frame: PhysicalPage,
    window: NonNull<u8>,
}

impl<'m> PageAccessor<'m> {
    /// Map `frame` through `mapper`.
    ///
    /// # Safety
    /// Same contract as [`PhysMapper::map_frame`].
    #[inline]
    pub unsafe fn new(mapper: &'m dyn PhysMapper, frame: PhysicalPage) -> Self {
        let window = unsafe { mapper.map_frame(frame) };
        Self {
            mapper,
            frame,
            window,
        }
    }

    #[inline]
    #[must_use]
    pub const fn frame(&self) -> PhysicalPage {
        self.frame
    }

    /// Start of the 4 KiB window.
    #[inline]
    #[must_use]
    pub const fn as_ptr(&self) -> *mut u8 {
        self.window.as_ptr()
    }
}

impl Drop for PageAccessor<'_> {
    fn drop(&mut self) {
        // SAFETY: the window came from `map_frame(self.frame)` and dies with us.
        unsafe { self.mapper.unmap_frame(self.frame, self.window) };
    }
}

impl fmt::Debug for PageAccessor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAccessor")
            .field("frame", &self.frame)
            .field("window", &self.window)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addresses::PhysicalAddress;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingMapper {
        live: AtomicUsize,
    }

    impl PhysMapper for CountingMapper {
        unsafe fn map_frame(&self, _frame: PhysicalPage) -> NonNull<u8> {
            self.live.fetch_add(1, Ordering::SeqCst);
            NonNull::dangling()
        }

        unsafe fn unmap_frame(&self, _frame: PhysicalPage, _window: NonNull<u8>) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn direct_mapper_offsets_by_base() {
        let m = DirectMapper::new(0xFFFF_8000_0000_0000);
        let frame = PhysicalPage::new(PhysicalAddress::new(0x5000));
        let a = unsafe { PageAccessor::new(&m, frame) };
        assert_eq!(a.as_ptr() as u64, 0xFFFF_8000_0000_5000);
        assert_eq!(a.frame(), frame);
    }

    #[test]
    fn window_is_released_on_drop_and_on_unwind() {
        let m = CountingMapper::default();
        let frame = PhysicalPage::new(PhysicalAddress::new(0x1000));
        {
            let _a = unsafe { PageAccessor::new(&m, frame) };
            assert_eq!(m.live.load(Ordering::SeqCst), 1);
        }
        assert_eq!(m.live.load(Ordering::SeqCst), 0);

        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _a = unsafe { PageAccessor::new(&m, frame) };
            panic!("walk failed");
        }));
        assert!(r.is_err());
        assert_eq!(m.live.load(Ordering::SeqCst), 0);
    }
}
