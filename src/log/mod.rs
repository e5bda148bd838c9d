//! Log Manager (spec §4.4, C4): an append-only WAL. In-memory buffer
//! accumulates records; a background flush thread persists them to stable
//! storage. Every inserted record gets an LSN equal to its byte offset
//! plus partition base; a reserved `skip` record marks partition end.
//!
//! Grounded on `examples/harborgrid-justin-rusty-db/src/transaction/wal.rs`
//! and `wal_manager.rs` for the ambient shape (buffered append + background
//! flush thread + `tracing` spans), and on
//! `examples/original_source/src/sm/logfactory.h` for the record-insertion
//! and partition-rotation semantics spec §4.4 describes.

pub mod record;
mod partition;

pub use record::{Category, LogRecord, RecordType};

use crate::common::{EngineConfig, Lsn};
use crate::error::{Error, Result};
use partition::Partition;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct LogState {
    /// Bytes not yet durable, for `current_partition` starting at
    /// `buffer_base_offset`.
    buffer: Vec<u8>,
    buffer_base_offset: u64,
    current_partition: u32,
    oldest_partition: u32,
    curr_lsn: Lsn,
    durable_lsn: Lsn,
    global_min_lsn: Lsn,
    open_partitions: BTreeMap<u32, Partition>,
    /// Bytes reserved so that two maximum-sized checkpoints always fit
    /// (spec §4.7 last paragraph, §4.4 `consume_chkpt_reservation`).
    chkpt_reservation_used: u64,
    chkpt_reservation_total: u64,
}

/// Append-only write-ahead log (spec §4.4).
pub struct LogManager {
    config: EngineConfig,
    log_dir: PathBuf,
    state: Mutex<LogState>,
    flush_cv: Condvar,
    shutdown: AtomicBool,
}

impl LogManager {
    pub fn open(config: &EngineConfig) -> Result<Arc<Self>> {
        std::fs::create_dir_all(&config.log_dir)?;
        let first_partition = Partition::create(&config.log_dir, 1)?;
        let mut open_partitions = BTreeMap::new();
        open_partitions.insert(1, first_partition);
        let state = LogState {
            buffer: Vec::with_capacity(1 << 16),
            buffer_base_offset: 0,
            current_partition: 1,
            oldest_partition: 1,
            curr_lsn: Lsn::partition_start(1),
            durable_lsn: Lsn::NULL,
            global_min_lsn: Lsn::partition_start(1),
            open_partitions,
            chkpt_reservation_used: 0,
            // two maximum checkpoints; §4.7's chunked chkpt records bound
            // each run's size, we reserve a conservative fixed budget.
            chkpt_reservation_total: 2 * (1 << 20),
        };
        Ok(Arc::new(LogManager {
            config: config.clone(),
            log_dir: config.log_dir.clone(),
            state: Mutex::new(state),
            flush_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn curr_lsn(&self) -> Lsn {
        self.state.lock().curr_lsn
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.state.lock().durable_lsn
    }

    pub fn global_min_lsn(&self) -> Lsn {
        self.state.lock().global_min_lsn
    }

    /// Assigns an LSN, writes `record` into the in-memory buffer, and
    /// rolls over to a new partition if it would not fit (spec §4.4
    /// `insert`). Single-log system-transaction records go through this
    /// same path; the caller simply never threads the outer xct's
    /// `last_lsn` through them (spec §4.8 SSX).
    #[tracing::instrument(level = "debug", skip(self, record))]
    pub fn insert(&self, mut record: LogRecord) -> Result<Lsn> {
        let len = record.encoded_len();
        if len > self.config.log_partition_size as usize {
            return Err(Error::PartitionFull);
        }
        let mut state = self.state.lock();
        let partition_offset = state.buffer_base_offset + state.buffer.len() as u64;
        if partition_offset + len as u64 > self.config.log_partition_size {
            self.rotate_partition_locked(&mut state)?;
        }
        let partition_offset = state.buffer_base_offset + state.buffer.len() as u64;
        let lsn = Lsn::new(state.current_partition, partition_offset);
        let bytes = record.encode(lsn)?;
        state.buffer.extend_from_slice(&bytes);
        state.curr_lsn = lsn.advance(bytes.len() as u64);
        tracing::trace!(%lsn, len, "log record inserted");
        Ok(lsn)
    }

    fn rotate_partition_locked(&self, state: &mut LogState) -> Result<()> {
        // Write a skip record to close out the current partition.
        let mut skip = LogRecord::new(
            RecordType::Skip,
            Category::empty(),
            0,
            crate::common::PageId::new(0, 0, 0),
            crate::common::PageTag::Invalid,
        );
        let skip_offset = state.buffer_base_offset + state.buffer.len() as u64;
        let skip_lsn = Lsn::new(state.current_partition, skip_offset);
        let skip_bytes = skip.encode(skip_lsn)?;
        state.buffer.extend_from_slice(&skip_bytes);
        self.flush_locked(state, None)?;

        let next_number = state.current_partition + 1;
        if state.open_partitions.len() >= self.config.max_openlog {
            // Drop the oldest open handle; it can be reopened on demand by
            // `fetch`. This only closes the file descriptor, the partition
            // itself is retained until `scavenge` deletes it.
            if let Some((&oldest, _)) = state.open_partitions.iter().next() {
                if oldest != state.current_partition {
                    state.open_partitions.remove(&oldest);
                }
            }
        }
        let new_partition = Partition::create(&self.log_dir, next_number)?;
        state.open_partitions.insert(next_number, new_partition);
        state.current_partition = next_number;
        state.buffer_base_offset = 0;
        state.buffer.clear();
        tracing::debug!(partition = next_number, "log partition rotated");
        Ok(())
    }

    /// Forces buffered contents up to `target_lsn` to stable storage
    /// (spec §4.4 `flush`). `signal_only` just wakes the background
    /// flusher without waiting; `blocking` performs the flush on the
    /// calling thread and waits for completion.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&self, target_lsn: Lsn, blocking: bool, signal_only: bool) -> Result<()> {
        if signal_only {
            self.flush_cv.notify_all();
            return Ok(());
        }
        let mut state = self.state.lock();
        if state.durable_lsn >= target_lsn {
            return Ok(());
        }
        if !blocking {
            self.flush_cv.notify_all();
            return Ok(());
        }
        self.flush_locked(&mut state, Some(target_lsn))
    }

    fn flush_locked(&self, state: &mut LogState, target: Option<Lsn>) -> Result<()> {
        if state.buffer.is_empty() {
            if let Some(target) = target {
                if state.durable_lsn < target {
                    return Err(Error::EndOfLog);
                }
            }
            return Ok(());
        }
        let partition_number = state.current_partition;
        let base_offset = state.buffer_base_offset;
        let bytes = state.buffer.clone();
        {
            let partition = state
                .open_partitions
                .get_mut(&partition_number)
                .expect("current partition always open");
            partition.write_at(base_offset, &bytes)?;
        }
        state.buffer_base_offset += bytes.len() as u64;
        state.buffer.clear();
        state.durable_lsn = state.curr_lsn;
        self.flush_cv.notify_all();
        tracing::trace!(durable_lsn = %state.durable_lsn, "log flushed");
        Ok(())
    }

    /// Runs one background-flusher iteration: wait briefly, then flush
    /// whatever has accumulated. Intended to be driven by a dedicated
    /// thread the embedding engine owns (spec §4.4: "background flush
    /// thread(s)"); exposed as a method rather than spawning our own
    /// thread so callers control the thread's lifecycle and panics.
    pub fn background_flush_tick(self: &Arc<Self>, wait: std::time::Duration) {
        let mut state = self.state.lock();
        self.flush_cv.wait_for(&mut state, wait);
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let target = state.curr_lsn;
        let _ = self.flush_locked(&mut state, Some(target));
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.flush_cv.notify_all();
    }

    /// Returns the record at `lsn`; locks the owning partition for read.
    /// `EndOfLog` if `lsn` is past `curr_lsn`.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn fetch(&self, lsn: Lsn) -> Result<LogRecord> {
        let mut state = self.state.lock();
        if lsn >= state.curr_lsn {
            return Err(Error::EndOfLog);
        }
        // Serve straight from the in-memory buffer when possible.
        if lsn.partition() == state.current_partition && lsn.offset() >= state.buffer_base_offset {
            let start = (lsn.offset() - state.buffer_base_offset) as usize;
            if start < state.buffer.len() {
                return LogRecord::decode(&state.buffer[start..]);
            }
        }
        if !state.open_partitions.contains_key(&lsn.partition()) {
            let partition = Partition::open_existing(&self.log_dir, lsn.partition())?;
            state.open_partitions.insert(lsn.partition(), partition);
        }
        // A record never exceeds 64KiB (u16 length prefix); read a
        // generous window and decode from it.
        let partition = state.open_partitions.get_mut(&lsn.partition()).unwrap();
        let file_len = partition.current_len()?;
        if lsn.offset() >= file_len {
            return Err(Error::EndOfLog);
        }
        let window = (file_len - lsn.offset()).min(u16::MAX as u64) as usize;
        let bytes = partition.read_at(lsn.offset(), window)?;
        LogRecord::decode(&bytes)
    }

    /// If `existing_lsn` is still sitting in the in-memory buffer, flips
    /// its category to CPSN and patches `undo_nxt` in place, avoiding a
    /// stand-alone compensation record (spec §4.4 `compensate`). Returns
    /// `false` if the record has already been flushed and the caller must
    /// emit a real CLR instead.
    pub fn compensate(&self, existing_lsn: Lsn, undo_nxt: Lsn) -> Result<bool> {
        let mut state = self.state.lock();
        if existing_lsn.partition() != state.current_partition
            || existing_lsn.offset() < state.buffer_base_offset
        {
            return Ok(false);
        }
        let start = (existing_lsn.offset() - state.buffer_base_offset) as usize;
        if start >= state.buffer.len() {
            return Ok(false);
        }
        LogRecord::patch_in_place_as_compensation(&mut state.buffer[start..], undo_nxt)?;
        Ok(true)
    }

    /// Deletes partitions strictly older than `min(min_rec_lsn,
    /// min_xct_lsn)`. Returns the number of partitions removed; `0` is a
    /// normal no-op outcome (e.g. immediately after a prior scavenge), not
    /// an error — only filesystem failures propagate as `Err`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn scavenge(&self, min_rec_lsn: Lsn, min_xct_lsn: Lsn) -> Result<usize> {
        let boundary = min_rec_lsn.min(min_xct_lsn);
        let mut state = self.state.lock();
        let mut removed = 0;
        while state.oldest_partition < boundary.partition() {
            let number = state.oldest_partition;
            state.open_partitions.remove(&number);
            Partition::remove(&self.log_dir, number)?;
            state.oldest_partition += 1;
            removed += 1;
        }
        if removed > 0 {
            state.global_min_lsn = Lsn::partition_start(state.oldest_partition);
            tracing::info!(removed, oldest = state.oldest_partition, "log partitions scavenged");
        }
        Ok(removed)
    }

    /// Reserves `n` bytes of checkpoint-only log space; fails if the
    /// remaining reservation cannot cover it (spec §4.4, §4.7 last para).
    pub fn consume_chkpt_reservation(&self, n: u64) -> Result<()> {
        let mut state = self.state.lock();
        if state.chkpt_reservation_used + n > state.chkpt_reservation_total {
            return Err(Error::OutOfLogSpace);
        }
        state.chkpt_reservation_used += n;
        Ok(())
    }

    pub fn release_chkpt_reservation(&self, n: u64) {
        let mut state = self.state.lock();
        state.chkpt_reservation_used = state.chkpt_reservation_used.saturating_sub(n);
    }

    /// Verifies that two maximum-sized checkpoints still fit in reserved
    /// log space.
    pub fn verify_chkpt_reservation(&self) -> bool {
        let state = self.state.lock();
        state.chkpt_reservation_used <= state.chkpt_reservation_total
    }
}
