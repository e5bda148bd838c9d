//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the engine returns [`Result<T>`]. Variants
//! mirror spec §7 exactly; internal retry loops (Dreadlocks polling, bucket
//! CAS races, generation advance) are bounded and surface one of these
//! rather than spinning forever.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("out of log space")]
    OutOfLogSpace,

    #[error("bad checksum on page {page_id}: expected {expected:#x}, found {found:#x}")]
    BadChecksum {
        page_id: String,
        expected: u32,
        found: u32,
    },

    #[error("bad volume: {0}")]
    BadVolume(String),

    #[error("bad store id: {0}")]
    BadStoreId(String),

    #[error("lock timeout")]
    LockTimeout,

    #[error("deadlock detected")]
    Deadlock,

    #[error("too many volumes per transaction")]
    TooManyVolumesPerXct,

    #[error("too many stores per volume")]
    TooManyStoresPerVol,

    #[error("write-order dependency loop")]
    WriteOrderLoop,

    #[error("backup force failed: {0}")]
    BackupForceFailed(String),

    #[error("frame not found")]
    FrameNotFound,

    #[error("page is hot and cannot be evicted")]
    HotPage,

    #[error("two threads attached to the same transaction")]
    TwoThreadsInXct,

    #[error("no active transaction attached to this thread")]
    NoActiveXct,

    #[error("invalid transaction state transition: {from} -> {to}")]
    StateTransitionInvalid { from: String, to: String },

    #[error("end of log")]
    EndOfLog,

    #[error("log partition full")]
    PartitionFull,

    #[error("list too long")]
    ListTooLong,

    #[error("too many generations in GC pool forest")]
    TooManyGenerations,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a caller conservatively holding conflicting locks should
    /// treat this as a deadlock (spec §7: `LockTimeout` is converted to
    /// `Deadlock` by the caller when it assumes deadlock).
    pub fn as_conservative_deadlock(self) -> Error {
        match self {
            Error::LockTimeout => Error::Deadlock,
            other => other,
        }
    }

    pub fn is_fatal_during_checkpoint(&self) -> bool {
        matches!(self, Error::OutOfLogSpace)
    }
}
