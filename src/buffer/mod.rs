//! Buffer pool (spec §4.6, C6): page table, clock-like replacement,
//! fix/unfix latching, write-order dependencies, force operations, and
//! the background page cleaner. Grounded on
//! `examples/original_source/src/sm/bf_tree.{h,cpp}` and `bf_tree_cb.h`.

mod bcb;
mod cleaner;
mod manager;

pub use bcb::{Bcb, FixMode, PageReadGuard, PageWriteGuard};
pub use cleaner::PageCleaner;
pub use manager::{BufferPool, Fixed};
