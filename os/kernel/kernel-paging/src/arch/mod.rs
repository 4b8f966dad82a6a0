//! Hardware backends for [`Tlb`](crate::Tlb).

pub mod x86_64;
