use std::fmt;

/// Log sequence number: (partition-number, byte-offset), ordered
/// lexicographically by partition then offset (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Lsn {
    partition: u32,
    offset: u64,
}

impl Lsn {
    /// Reserved sentinel meaning "no LSN".
    pub const NULL: Lsn = Lsn {
        partition: 0,
        offset: 0,
    };

    pub const MAX: Lsn = Lsn {
        partition: u32::MAX,
        offset: u64::MAX,
    };

    pub fn new(partition: u32, offset: u64) -> Self {
        debug_assert!(
            partition != 0 || offset == 0,
            "partition 0 is reserved for the NULL lsn"
        );
        Lsn { partition, offset }
    }

    pub fn partition(self) -> u32 {
        self.partition
    }

    pub fn offset(self) -> u64 {
        self.offset
    }

    pub fn is_null(self) -> bool {
        self == Lsn::NULL
    }

    /// Advance within the same partition by `bytes`.
    pub fn advance(self, bytes: u64) -> Self {
        Lsn {
            partition: self.partition,
            offset: self.offset + bytes,
        }
    }

    /// First LSN of the given partition.
    pub fn partition_start(partition: u32) -> Self {
        Lsn { partition, offset: 0 }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.partition, self.offset)
    }
}
