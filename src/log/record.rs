//! Log record header, category bits, and wire (de)serialization (spec §3
//! "Log Record", §6 wire format). Grounded on
//! `examples/original_source/src/sm/logfactory.h` and the header layout
//! described in spec §6.

use crate::common::{Lsn, PageId, PageTag, Tid};
use crate::error::{Error, Result};

/// `category` bits drive UNDO/REDO dispatch in recovery (spec §3). Follows
/// the same hand-rolled bitset convention as
/// [`crate::common::StoreFlags`]/[`crate::storage::page::PageFlags`] rather
/// than pulling in a flags crate the rest of the corpus doesn't use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Category(u8);

impl Category {
    pub const UNDO: Category = Category(0b0000_0001);
    pub const REDO: Category = Category(0b0000_0010);
    pub const CPSN: Category = Category(0b0000_0100);
    pub const LOGICAL: Category = Category(0b0000_1000);
    pub const SSX: Category = Category(0b0001_0000);
    pub const MULTI_PAGE: Category = Category(0b0010_0000);

    pub const fn empty() -> Self {
        Category(0)
    }

    pub fn contains(self, other: Category) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Category) {
        self.0 |= other.0;
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits_truncate(bits: u8) -> Self {
        Category(bits & 0b0011_1111)
    }
}

impl std::ops::BitOr for Category {
    type Output = Category;
    fn bitor(self, rhs: Category) -> Category {
        Category(self.0 | rhs.0)
    }
}

/// Record type discriminant. The distilled spec does not enumerate every
/// index-level redo/undo type (those belong to the out-of-scope B-tree
/// layer); we carry the handful the storage-engine core itself emits plus
/// an `Application` escape hatch for payloads owned by callers above us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    Skip = 0,
    ChkptBegin = 1,
    ChkptBfTab = 2,
    ChkptDevTab = 3,
    ChkptXctTab = 4,
    ChkptEnd = 5,
    XctEnd = 6,
    XctAbort = 7,
    XctFreeingSpace = 8,
    Compensate = 9,
    Application = 10,
}

impl RecordType {
    fn from_u8(v: u8) -> Result<Self> {
        use RecordType::*;
        Ok(match v {
            0 => Skip,
            1 => ChkptBegin,
            2 => ChkptBfTab,
            3 => ChkptDevTab,
            4 => ChkptXctTab,
            5 => ChkptEnd,
            6 => XctEnd,
            7 => XctAbort,
            8 => XctFreeingSpace,
            9 => Compensate,
            10 => Application,
            other => {
                return Err(Error::BadVolume(format!("unknown log record type {other}")))
            }
        })
    }
}

/// `lsn_check` at the tail is the record's own LSN, used to validate
/// partial/torn writes on recovery (spec §6).
pub const HEADER_SIZE: usize = 2 + 1 + 1 + 8 + 2 + 4 + 4 + 2 + 8 + 8;
pub const TRAILER_SIZE: usize = 8;

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub rec_type: RecordType,
    pub category: Category,
    pub tid: Tid,
    pub page_id: PageId,
    pub page_tag: PageTag,
    pub xid_prev: Lsn,
    pub page_prev: Lsn,
    pub payload: Vec<u8>,
    /// Set once the record has been assigned an LSN by [`super::LogManager::insert`].
    pub lsn: Lsn,
}

impl LogRecord {
    pub fn new(rec_type: RecordType, category: Category, tid: Tid, page_id: PageId, page_tag: PageTag) -> Self {
        LogRecord {
            rec_type,
            category,
            tid,
            page_id,
            page_tag,
            xid_prev: Lsn::NULL,
            page_prev: Lsn::NULL,
            payload: Vec::new(),
            lsn: Lsn::NULL,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + TRAILER_SIZE
    }

    fn encode_lsn(lsn: Lsn, out: &mut Vec<u8>) -> Result<()> {
        let offset: u32 = lsn
            .offset()
            .try_into()
            .map_err(|_| Error::PartitionFull)?;
        out.extend_from_slice(&lsn.partition().to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        Ok(())
    }

    fn decode_lsn(bytes: &[u8]) -> Lsn {
        let partition = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let offset = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if partition == 0 && offset == 0 {
            Lsn::NULL
        } else {
            Lsn::new(partition, offset as u64)
        }
    }

    /// Serializes this record, stamping `lsn` as both the `lsn` field and
    /// the trailing `lsn_check`.
    pub fn encode(&mut self, lsn: Lsn) -> Result<Vec<u8>> {
        self.lsn = lsn;
        let len = self.encoded_len();
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&(len as u16).to_le_bytes());
        out.push(self.rec_type as u8);
        out.push(self.category.bits());
        out.extend_from_slice(&self.tid.to_le_bytes());
        out.extend_from_slice(&self.page_id.volume.to_le_bytes());
        out.extend_from_slice(&self.page_id.store.to_le_bytes());
        out.extend_from_slice(&self.page_id.page.to_le_bytes());
        out.extend_from_slice(&(self.page_tag as u16).to_le_bytes());
        Self::encode_lsn(self.xid_prev, &mut out)?;
        Self::encode_lsn(self.page_prev, &mut out)?;
        out.extend_from_slice(&self.payload);
        Self::encode_lsn(lsn, &mut out)?;
        debug_assert_eq!(out.len(), len);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE + TRAILER_SIZE {
            return Err(Error::EndOfLog);
        }
        let len = u16::from_le_bytes(bytes[0..2].try_into().unwrap()) as usize;
        if bytes.len() < len {
            return Err(Error::EndOfLog);
        }
        let rec_type = RecordType::from_u8(bytes[2])?;
        let category = Category::from_bits_truncate(bytes[3]);
        let tid = u64::from_le_bytes(bytes[4..12].try_into().unwrap());
        let volume = u16::from_le_bytes(bytes[12..14].try_into().unwrap());
        let store = u32::from_le_bytes(bytes[14..18].try_into().unwrap());
        let page = u32::from_le_bytes(bytes[18..22].try_into().unwrap());
        let page_tag_raw = u16::from_le_bytes(bytes[22..24].try_into().unwrap());
        let xid_prev = Self::decode_lsn(&bytes[24..32]);
        let page_prev = Self::decode_lsn(&bytes[32..40]);
        let payload = bytes[HEADER_SIZE..len - TRAILER_SIZE].to_vec();
        let lsn_check = Self::decode_lsn(&bytes[len - TRAILER_SIZE..len]);

        let page_tag = match page_tag_raw {
            0 => PageTag::Invalid,
            1 => PageTag::BTreeLeaf,
            2 => PageTag::BTreeInterior,
            3 => PageTag::Allocation,
            4 => PageTag::StoreNode,
            5 => PageTag::File,
            6 => PageTag::Stnode,
            _ => PageTag::Invalid,
        };

        Ok(LogRecord {
            rec_type,
            category,
            tid,
            page_id: PageId::new(volume, store, page),
            page_tag,
            xid_prev,
            page_prev,
            payload,
            lsn: lsn_check,
        })
    }

    /// Rewrites this record in place as a CPSN with the given `undo_nxt`
    /// (spec §4.4 `compensate`): flips the category bit and overwrites the
    /// `xid_prev` slot, which is otherwise unused once a record is known to
    /// never be undone past this point.
    pub fn patch_in_place_as_compensation(bytes: &mut [u8], undo_nxt: Lsn) -> Result<()> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::EndOfLog);
        }
        bytes[3] |= Category::CPSN.bits();
        let mut lsn_bytes = Vec::with_capacity(8);
        Self::encode_lsn(undo_nxt, &mut lsn_bytes)?;
        bytes[24..32].copy_from_slice(&lsn_bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_except_lsn_fields() {
        let page_id = PageId::new(1, 2, 3);
        let mut rec = LogRecord::new(
            RecordType::Application,
            Category::REDO,
            42,
            page_id,
            PageTag::BTreeLeaf,
        )
        .with_payload(vec![1, 2, 3, 4]);
        rec.xid_prev = Lsn::new(1, 100);
        rec.page_prev = Lsn::new(1, 50);
        let lsn = Lsn::new(1, 200);
        let bytes = rec.encode(lsn).unwrap();
        let decoded = LogRecord::decode(&bytes).unwrap();
        assert_eq!(decoded.tid, 42);
        assert_eq!(decoded.page_id, page_id);
        assert_eq!(decoded.payload, vec![1, 2, 3, 4]);
        assert_eq!(decoded.xid_prev, Lsn::new(1, 100));
        assert_eq!(decoded.page_prev, Lsn::new(1, 50));
        assert_eq!(decoded.lsn, lsn);
    }

    #[test]
    fn compensation_patch_flips_category_and_undo_nxt() {
        let page_id = PageId::new(1, 1, 1);
        let mut rec = LogRecord::new(RecordType::Application, Category::UNDO, 1, page_id, PageTag::File);
        let lsn = Lsn::new(1, 10);
        let mut bytes = rec.encode(lsn).unwrap();
        LogRecord::patch_in_place_as_compensation(&mut bytes, Lsn::new(1, 5)).unwrap();
        let decoded = LogRecord::decode(&bytes).unwrap();
        assert!(decoded.category.contains(Category::CPSN));
        assert_eq!(decoded.xid_prev, Lsn::new(1, 5));
    }
}
