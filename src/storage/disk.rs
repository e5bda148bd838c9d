//! Volume I/O: reads and writes fixed-size pages by [`PageId`] against a
//! backing file. Everything beyond this page-addressing contract (volume
//! metadata, store allocation, free-space maps) belongs to the index layer
//! and is out of scope (spec §1).

use crate::common::{EngineConfig, PageId, PageTag, VolumeId};
use crate::error::{Error, Result};
use crate::storage::page::Page;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A single backing file holding fixed-size pages for one volume.
pub struct Volume {
    id: VolumeId,
    page_size: usize,
    file: Mutex<File>,
    path: PathBuf,
    fake_latency_us: u64,
}

impl Volume {
    pub fn open_or_create(path: impl AsRef<Path>, id: VolumeId, page_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Ok(Volume {
            id,
            page_size,
            file: Mutex::new(file),
            path: path.as_ref().to_path_buf(),
            fake_latency_us: 0,
        })
    }

    pub fn with_fake_latency(mut self, us: u64) -> Self {
        self.fake_latency_us = us;
        self
    }

    pub fn from_config(config: &EngineConfig, path: impl AsRef<Path>, id: VolumeId) -> Result<Self> {
        Ok(Self::open_or_create(path, id, config.page_size)?
            .with_fake_latency(config.fake_disk_latency_us))
    }

    pub fn id(&self) -> VolumeId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn inject_latency(&self) {
        if self.fake_disk_latency_nonzero() {
            std::thread::sleep(std::time::Duration::from_micros(self.fake_latency_us));
        }
    }

    fn fake_disk_latency_nonzero(&self) -> bool {
        self.fake_latency_us > 0
    }

    fn offset_of(&self, page_id: PageId) -> Result<u64> {
        if page_id.volume != self.id {
            return Err(Error::BadVolume(format!(
                "page {page_id} does not belong to volume {}",
                self.id
            )));
        }
        Ok(page_id.page as u64 * self.page_size as u64)
    }

    /// Reads and checksum-verifies the page at `page_id`.
    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        self.inject_latency();
        let offset = self.offset_of(page_id)?;
        let mut buf = vec![0u8; self.page_size];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Page::from_bytes(&buf)
    }

    /// Writes `page` to its slot and (optionally) forces it durable.
    pub fn write_page(&self, page: &Page, durable: bool) -> Result<()> {
        self.inject_latency();
        let offset = self.offset_of(page.page_id())?;
        let bytes = page.to_bytes();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&bytes)?;
        if durable {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Allocates a fresh virgin page slot at `page_no` without reading it
    /// back (used by `fix(..., no_read=true)` on first touch of a page).
    pub fn allocate_virgin(&self, page_id: PageId, tag: PageTag) -> Result<Page> {
        Ok(Page::new_virgin(page_id, tag, self.page_size))
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PageId;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let vol = Volume::open_or_create(dir.path().join("vol.dat"), 1, 512).unwrap();
        let mut page = vol.allocate_virgin(PageId::new(1, 1, 0), PageTag::File).unwrap();
        page.body_mut()[0..4].copy_from_slice(b"abcd");
        page.set_page_lsn(crate::common::Lsn::new(1, 10));
        vol.write_page(&page, true).unwrap();
        let read_back = vol.read_page(PageId::new(1, 1, 0)).unwrap();
        assert_eq!(&read_back.body()[0..4], b"abcd");
    }

    #[test]
    fn reading_page_from_wrong_volume_fails() {
        let dir = tempfile::tempdir().unwrap();
        let vol = Volume::open_or_create(dir.path().join("vol.dat"), 1, 512).unwrap();
        let err = vol.read_page(PageId::new(2, 1, 0)).unwrap_err();
        assert!(matches!(err, Error::BadVolume(_)));
    }
}
