//! # Kernel synchronization primitives
//!
//! The paging core guards every page space and every page tree with a
//! FIFO [`TicketLock`]. Waiters are served strictly in arrival order.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod ticket_lock;

pub use ticket_lock::{TicketLock, TicketLockGuard};
