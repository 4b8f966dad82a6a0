use core::{
    cell::UnsafeCell,
    fmt,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

/// A fair (FIFO) spinlock protecting a value of type `T`.
///
/// Every caller of [`lock`](Self::lock) draws a ticket from `next` and spins
/// until `owner` reaches it. Releasing the guard hands the lock to the next
/// ticket in line.
///
/// ### Notes
/// - Not reentrant: locking twice on the same CPU deadlocks.
/// - Interrupt state is left alone; callers that share a lock with interrupt
///   handlers must mask interrupts themselves.
pub struct TicketLock<T> {
    /// Next ticket handed out to a waiter.
    next: AtomicUsize,
    /// Ticket currently allowed into the critical section.
    owner: AtomicUsize,
    value: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross CPUs.
unsafe impl<T: Send> Sync for TicketLock<T> {}

impl<T: Default> Default for TicketLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> TicketLock<T> {
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self {
            next: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
            value: UnsafeCell::new(value),
        }
    }

    /// Wait for our ticket to come up, then return a guard.
    #[inline]
    pub fn lock(&self) -> TicketLockGuard<'_, T> {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        // Acquire when we observe our turn
        while self.owner.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
        TicketLockGuard { lock: self }
    }

    /// Take the lock only if nobody holds it or waits for it.
    #[inline]
    pub fn try_lock(&self) -> Option<TicketLockGuard<'_, T>> {
        let owner = self.owner.load(Ordering::Relaxed);
        self.next
            .compare_exchange(
                owner,
                owner.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| TicketLockGuard { lock: self })
    }

    /// Closure convenience, built on the guard.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.lock();
        f(&mut guard)
    }

    /// `true` while a guard is alive or a waiter holds a ticket.
    ///
    /// Only a snapshot; the answer may be stale by the time it is used.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.next.load(Ordering::Relaxed) != self.owner.load(Ordering::Relaxed)
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    #[inline]
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: fmt::Debug> fmt::Debug for TicketLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("TicketLock");
        match self.try_lock() {
            Some(guard) => d.field("value", &&*guard),
            None => d.field("value", &format_args!("<locked>")),
        };
        d.finish()
    }
}

/// RAII guard returned by [`TicketLock::lock`]; dropping it serves the next ticket.
pub struct TicketLockGuard<'a, T> {
    lock: &'a TicketLock<T>,
}

impl<T> Deref for TicketLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves we own the current ticket.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for TicketLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves we own the current ticket.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for TicketLockGuard<'_, T> {
    fn drop(&mut self) {
        // Only the holder advances `owner`; Release publishes the critical section.
        let owner = self.lock.owner.load(Ordering::Relaxed);
        self.lock
            .owner
            .store(owner.wrapping_add(1), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_fails_while_a_ticket_is_out() {
        let lock = TicketLock::new(7u32);
        let guard = lock.lock();
        assert!(lock.is_locked());
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(!lock.is_locked());
        assert_eq!(*lock.try_lock().unwrap(), 7);
    }

    #[test]
    fn debug_does_not_deadlock_when_held() {
        let lock = TicketLock::new(1u8);
        let _guard = lock.lock();
        let text = format!("{lock:?}");
        assert!(text.contains("<locked>"));
    }
}
