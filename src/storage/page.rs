//! Fixed-size page, on-disk layout per spec §6:
//! `page_id | tag | page_lsn | store_flags | page_flags | checksum | body`.

use super::checksum::hardware_crc32c;
use crate::common::{Lsn, PageId, PageTag, StoreFlags};
use crate::error::{Error, Result};

/// Header fields occupy this many bytes at the front of every page:
/// volume(2) + store(4) + page_no(4) + tag(2) + lsn_partition(4) +
/// lsn_offset(8) + store_flags(4) + page_flags(2) + checksum(4) = 34.
pub const PAGE_HEADER_SIZE: usize = 34;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(u16);

impl PageFlags {
    pub const VIRGIN: PageFlags = PageFlags(0b001);
    pub const WRITTEN: PageFlags = PageFlags(0b010);
    pub const TO_BE_DELETED: PageFlags = PageFlags(0b100);

    pub const fn empty() -> Self {
        PageFlags(0)
    }

    pub fn contains(self, other: PageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PageFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PageFlags) {
        self.0 &= !other.0;
    }
}

/// A fixed-size in-memory page buffer plus its parsed header. Invariants
/// (spec §3): `page_lsn` is monotone non-decreasing while any single thread
/// holds the page under an exclusive latch; checksum is verified on read.
#[derive(Clone)]
pub struct Page {
    size: usize,
    body: Vec<u8>,
    page_id: PageId,
    tag: PageTag,
    page_lsn: Lsn,
    store_flags: StoreFlags,
    page_flags: PageFlags,
}

impl Page {
    pub fn new_virgin(page_id: PageId, tag: PageTag, size: usize) -> Self {
        Page {
            size,
            body: vec![0u8; size - PAGE_HEADER_SIZE],
            page_id,
            tag,
            page_lsn: Lsn::NULL,
            store_flags: StoreFlags::empty(),
            page_flags: PageFlags::VIRGIN,
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn tag(&self) -> PageTag {
        self.tag
    }

    pub fn page_lsn(&self) -> Lsn {
        self.page_lsn
    }

    /// Sets `page_lsn`, asserting monotonicity under the caller's EX latch
    /// (spec §3 invariant).
    pub fn set_page_lsn(&mut self, lsn: Lsn) {
        debug_assert!(lsn >= self.page_lsn, "page_lsn must be monotone non-decreasing");
        self.page_lsn = lsn;
        self.page_flags.remove(PageFlags::VIRGIN);
        self.page_flags.insert(PageFlags::WRITTEN);
    }

    /// CAS-style LSN bump used on the rare SH-mode eviction log path (spec
    /// §5 ordering guarantees): only ever moves the value up.
    pub fn bump_page_lsn_if_greater(&mut self, lsn: Lsn) {
        if lsn > self.page_lsn {
            self.page_lsn = lsn;
        }
    }

    pub fn store_flags(&self) -> StoreFlags {
        self.store_flags
    }

    pub fn set_store_flags(&mut self, flags: StoreFlags) {
        self.store_flags = flags;
    }

    pub fn flags(&self) -> PageFlags {
        self.page_flags
    }

    pub fn mark_to_be_deleted(&mut self) {
        self.page_flags.insert(PageFlags::TO_BE_DELETED);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.body
    }

    fn checksum(&self) -> u32 {
        hardware_crc32c(&self.body)
    }

    /// Serializes the page to its on-disk byte layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        out.extend_from_slice(&self.page_id.volume.to_le_bytes());
        out.extend_from_slice(&self.page_id.store.to_le_bytes());
        out.extend_from_slice(&self.page_id.page.to_le_bytes());
        out.extend_from_slice(&(self.tag as u16).to_le_bytes());
        out.extend_from_slice(&self.page_lsn.partition().to_le_bytes());
        out.extend_from_slice(&self.page_lsn.offset().to_le_bytes());
        out.extend_from_slice(&self.store_flags.raw().to_le_bytes());
        out.extend_from_slice(&self.page_flags.0.to_le_bytes());
        out.extend_from_slice(&self.checksum().to_le_bytes());
        debug_assert_eq!(out.len(), PAGE_HEADER_SIZE);
        out.extend_from_slice(&self.body);
        out.resize(self.size, 0);
        out
    }

    /// Parses a page from its on-disk layout, verifying the checksum.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PAGE_HEADER_SIZE {
            return Err(Error::BadVolume("page shorter than header".into()));
        }
        let volume = u16::from_le_bytes(bytes[0..2].try_into().unwrap());
        let store = u32::from_le_bytes(bytes[2..6].try_into().unwrap());
        let page_no = u32::from_le_bytes(bytes[6..10].try_into().unwrap());
        let tag_raw = u16::from_le_bytes(bytes[10..12].try_into().unwrap());
        let lsn_partition = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        let lsn_offset = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let store_flags_raw = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        let page_flags_raw = u16::from_le_bytes(bytes[28..30].try_into().unwrap());
        let stored_checksum = u32::from_le_bytes(bytes[30..34].try_into().unwrap());
        let body = bytes[PAGE_HEADER_SIZE..].to_vec();
        let computed = hardware_crc32c(&body);
        if computed != stored_checksum {
            return Err(Error::BadChecksum {
                page_id: format!("({volume}:{store}:{page_no})"),
                expected: stored_checksum,
                found: computed,
            });
        }
        let page_id = PageId::new(volume, store, page_no);
        let tag = match tag_raw {
            1 => PageTag::BTreeLeaf,
            2 => PageTag::BTreeInterior,
            3 => PageTag::Allocation,
            4 => PageTag::StoreNode,
            5 => PageTag::File,
            6 => PageTag::Stnode,
            _ => PageTag::Invalid,
        };
        Ok(Page {
            size: bytes.len(),
            body,
            page_id,
            tag,
            page_lsn: Lsn::new(lsn_partition, lsn_offset),
            store_flags: StoreFlags::from_raw(store_flags_raw),
            page_flags: PageFlags(page_flags_raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_header_and_body() {
        let mut page = Page::new_virgin(PageId::new(1, 2, 3), PageTag::BTreeLeaf, 512);
        page.body_mut()[0..5].copy_from_slice(b"hello");
        page.set_page_lsn(Lsn::new(1, 64));
        let bytes = page.to_bytes();
        let parsed = Page::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.page_id(), PageId::new(1, 2, 3));
        assert_eq!(parsed.tag(), PageTag::BTreeLeaf);
        assert_eq!(parsed.page_lsn(), Lsn::new(1, 64));
        assert_eq!(&parsed.body()[0..5], b"hello");
    }

    #[test]
    fn corrupted_body_fails_checksum() {
        let page = Page::new_virgin(PageId::new(1, 1, 1), PageTag::File, 256);
        let mut bytes = page.to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(Page::from_bytes(&bytes), Err(Error::BadChecksum { .. })));
    }
}
