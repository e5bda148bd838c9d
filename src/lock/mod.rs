//! Multi-granularity lock manager (spec §4.5, C5): light-weight intent
//! locks over volumes/stores, OKVL key-value locks over individual keys
//! and gaps, Dreadlocks deadlock detection, and early lock release.
//!
//! Grounded on `examples/original_source/src/sm/lock_core.cpp`,
//! `lock_lil.cpp`, and `lock_x.cpp`.

mod deadlock;
mod intent;
mod manager;
mod okvl;
mod queue;

pub use deadlock::Dreadlocks;
pub use intent::{IntentLockTable, IntentMode, XctLockState};
pub use manager::LockManager;
pub use okvl::{all_modes, Mode, OkvlMode};
pub use queue::{GrantResult, LockQueue, LockTable};
