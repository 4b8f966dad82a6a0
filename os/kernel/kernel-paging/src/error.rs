//! Recoverable errors of the paging core.
//!
//! Invariant violations (double map, misaligned addresses, double retire)
//! are not errors; they panic at the call site.

/// Errors returned by page-table and configuration operations.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PagingError {
    /// The frame allocator could not supply a table for `level`
    /// (0 = root, 1 = PDPT, 2 = PD, 3 = PT).
    #[error("out of memory while realizing a level {level} page table")]
    OutOfMemory { level: usize },

    #[error("tag slot count {requested} outside 1..={max}")]
    InvalidTagSlots { requested: usize, max: usize },
}
