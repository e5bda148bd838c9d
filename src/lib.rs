//! A disk-oriented, log-structured storage engine core.
//!
//! Scope (spec §1): buffer pool management, write-ahead logging with
//! checkpointing, a multi-granularity lock manager with deadlock detection,
//! and the lock-free GC object pools supporting those subsystems. Index
//! structures, transaction coordinator APIs, client glue, and query
//! processing are external collaborators that consume the `Page`, `Latch`,
//! `Lock`, and `Log` interfaces exposed here.

pub mod buffer;
pub mod checkpoint;
pub mod common;
pub mod error;
pub mod gcpool;
pub mod lock;
pub mod lockfree;
pub mod log;
pub mod storage;
pub mod xct;

pub use common::EngineConfig;
pub use error::{Error, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
