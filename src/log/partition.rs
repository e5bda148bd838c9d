//! Log partition: a fixed-size backing file holding a contiguous run of
//! log records terminated by a `skip` record (spec §3 "Log Partition", §6
//! on-disk layout: `log.<partition-number>`).

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct Partition {
    pub number: u32,
    file: File,
    path: PathBuf,
}

impl Partition {
    pub fn create(log_dir: &Path, number: u32) -> Result<Self> {
        let path = log_dir.join(format!("log.{number}"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Partition { number, file, path })
    }

    pub fn open_existing(log_dir: &Path, number: u32) -> Result<Self> {
        let path = log_dir.join(format!("log.{number}"));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Partition { number, file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `bytes` at `offset` and fsyncs.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(bytes)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn current_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn remove(log_dir: &Path, number: u32) -> Result<()> {
        let path = log_dir.join(format!("log.{number}"));
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn exists(log_dir: &Path, number: u32) -> bool {
        log_dir.join(format!("log.{number}")).exists()
    }
}
