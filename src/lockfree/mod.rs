//! Lock-free building blocks (spec §4.2, §4.3 — C2, C3).

pub mod latch;
pub mod list;

pub use latch::RwSpinLatch;
pub use list::{LockFreeList, ListEntry};
