//! Checkpoint Manager (spec §4.7, C7): a single background thread that
//! takes periodic fuzzy checkpoints, serialized against other checkpoints
//! by a checkpoint-serial mutex but never against ordinary fix/unfix/
//! log-insert. Grounded on `examples/original_source/src/sm/chkpt.cpp`
//! (`chkpt_m::take()`'s begin/bf_tab/dev_tab/xct_tab/end sequence,
//! bracketed by `chkpt_serial_m::chkpt_acquire`/`chkpt_release`) and
//! `chkpt.h` for the table-chunking shape.

use crate::buffer::BufferPool;
use crate::common::{EngineConfig, Lsn, PageId, PageTag, Tid, VolumeId};
use crate::error::Result;
use crate::log::{Category, LogManager, LogRecord, RecordType};
use crate::xct::{XctManager, XctSnapshot, XctState};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How many (page_id, rec_lsn) pairs ride in one `chkpt_bf_tab` record
/// (spec §4.7 step 6 "in chunks").
const BF_TAB_CHUNK: usize = 256;
/// How many xct entries ride in one `chkpt_xct_tab` record (step 8).
const XCT_TAB_CHUNK: usize = 256;
/// Conservative per-record charge against the checkpoint's log-space
/// reservation (spec §4.7 last paragraph, §4.4 `consume_chkpt_reservation`).
const RECORD_RESERVATION: u64 = 4096;
/// Bounded retries for the step-4 race re-check before giving up and
/// proceeding anyway (the spec describes "restart", not "retry forever").
const MAX_RACE_RETRIES: u32 = 8;

fn encode_lsn(lsn: Lsn, out: &mut Vec<u8>) {
    out.extend_from_slice(&lsn.partition().to_le_bytes());
    out.extend_from_slice(&(lsn.offset() as u32).to_le_bytes());
}

fn decode_lsn(bytes: &[u8]) -> Lsn {
    let partition = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let offset = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if partition == 0 {
        Lsn::NULL
    } else {
        Lsn::new(partition, offset as u64)
    }
}

fn xct_state_byte(state: XctState) -> u8 {
    match state {
        XctState::Active => 0,
        XctState::Chaining => 1,
        XctState::Committing => 2,
        XctState::Aborting => 3,
        XctState::FreeingSpace => 4,
        XctState::Ended => 5,
    }
}

fn encode_bf_tab(entries: &[(PageId, Lsn)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + entries.len() * 18);
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for (page_id, rec_lsn) in entries {
        out.extend_from_slice(&page_id.volume.to_le_bytes());
        out.extend_from_slice(&page_id.store.to_le_bytes());
        out.extend_from_slice(&page_id.page.to_le_bytes());
        encode_lsn(*rec_lsn, &mut out);
    }
    out
}

fn encode_dev_tab(volumes: &[VolumeId]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + volumes.len() * 2);
    out.extend_from_slice(&(volumes.len() as u32).to_le_bytes());
    for v in volumes {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn encode_xct_tab(youngest_tid: Tid, entries: &[XctSnapshot]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + entries.len() * 25);
    out.extend_from_slice(&youngest_tid.to_le_bytes());
    out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
    for e in entries {
        out.extend_from_slice(&e.tid.to_le_bytes());
        out.push(xct_state_byte(e.state));
        encode_lsn(e.last_lsn, &mut out);
        encode_lsn(e.undo_nxt, &mut out);
    }
    out
}

fn encode_chkpt_end(master_lsn: Lsn, min_rec_lsn: Lsn) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    encode_lsn(master_lsn, &mut out);
    encode_lsn(min_rec_lsn, &mut out);
    out
}

/// Decoded `chkpt_end` payload, exposed for recovery-adjacent callers and
/// tests; the engine itself only needs the master LSN it returns from
/// [`CheckpointManager::take`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChkptEnd {
    pub master_lsn: Lsn,
    pub min_rec_lsn: Lsn,
}

pub fn decode_chkpt_end(payload: &[u8]) -> ChkptEnd {
    ChkptEnd {
        master_lsn: decode_lsn(&payload[0..8]),
        min_rec_lsn: decode_lsn(&payload[8..16]),
    }
}

fn no_page() -> (PageId, PageTag) {
    (PageId::new(0, 0, 0), PageTag::Invalid)
}

/// Periodic fuzzy checkpoint driver (spec §4.7). One instance per engine;
/// `take()` runs the full 11-step protocol synchronously and
/// `background_tick` is meant to be driven by a dedicated thread the
/// embedding engine owns, the same pattern [`crate::log::LogManager`]
/// uses for its background flusher.
pub struct CheckpointManager {
    log: Arc<LogManager>,
    buffer: Arc<BufferPool>,
    xct_manager: Arc<XctManager>,
    /// Bars concurrent `take()` calls (step 1/11) without blocking
    /// ordinary fix/unfix/log-insert (spec §5 "Checkpoint-serial mutex").
    serial: Mutex<()>,
    /// Bumped after every completed checkpoint; used for the step-4 race
    /// re-check ("if the checkpoint counter advanced, restart").
    counter: AtomicU64,
    wake: Condvar,
    wake_flag: Mutex<bool>,
    shutdown: AtomicBool,
}

impl CheckpointManager {
    pub fn new(
        _config: Arc<EngineConfig>,
        log: Arc<LogManager>,
        buffer: Arc<BufferPool>,
        xct_manager: Arc<XctManager>,
    ) -> Arc<Self> {
        Arc::new(CheckpointManager {
            log,
            buffer,
            xct_manager,
            serial: Mutex::new(()),
            counter: AtomicU64::new(0),
            wake: Condvar::new(),
            wake_flag: Mutex::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Edge-triggers a checkpoint at the next `background_tick` (spec
    /// §4.7 "woken by an edge-triggered condition").
    pub fn request(&self) {
        *self.wake_flag.lock() = true;
        self.wake.notify_all();
    }

    /// One background-thread iteration: wait for a wakeup (or `wait` to
    /// elapse), then run `take()` once. Intended to be driven by a loop
    /// on a dedicated thread, mirroring [`LogManager::background_flush_tick`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn background_tick(&self, wait: Duration) -> Result<()> {
        {
            let mut flag = self.wake_flag.lock();
            if !*flag {
                self.wake.wait_for(&mut flag, wait);
            }
            *flag = false;
        }
        if self.shutdown.load(Ordering::Acquire) {
            return Ok(());
        }
        self.take().map(|_| ())
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_all();
    }

    /// Runs the 11-step fuzzy checkpoint protocol (spec §4.7), returning
    /// the new master LSN.
    #[tracing::instrument(level = "info", skip(self))]
    pub fn take(&self) -> Result<Lsn> {
        // Step 1: acquire checkpoint-serial mutex.
        let _serial = self.serial.lock();
        let mut reserved = 0u64;

        let start_counter = self.counter.load(Ordering::Acquire);
        let mut oldest_valid_lsn = self.log.global_min_lsn();

        // Steps 2-4, bounded-retry on the race re-check.
        let mut attempt = 0;
        loop {
            // Step 2: verify reservation; poison and wait for old xcts if
            // tight.
            if !self.log.verify_chkpt_reservation() {
                let boundary = Lsn::new(oldest_valid_lsn.partition(), oldest_valid_lsn.offset() + 1);
                let tids = self.xct_manager.poison_older_than(boundary);
                if !tids.is_empty() {
                    self.xct_manager.wait_until_ended(&tids, Duration::from_secs(5));
                }
            }

            // Step 3: flush every buffer page older than oldest_valid_lsn.
            self.buffer.force_until_lsn(oldest_valid_lsn)?;

            // Step 4: re-check for races.
            let now_counter = self.counter.load(Ordering::Acquire);
            if now_counter == start_counter || attempt >= MAX_RACE_RETRIES {
                break;
            }
            attempt += 1;
            oldest_valid_lsn = self.log.global_min_lsn();
        }

        let result = self.take_body(&mut reserved);
        self.log.release_chkpt_reservation(reserved);
        result
    }

    fn charge(&self, reserved: &mut u64) -> Result<()> {
        self.log.consume_chkpt_reservation(RECORD_RESERVATION)?;
        *reserved += RECORD_RESERVATION;
        Ok(())
    }

    fn take_body(&self, reserved: &mut u64) -> Result<Lsn> {
        let (page_id, page_tag) = no_page();

        // Step 5: chkpt_begin + master_lsn. We don't track device-mount
        // LSNs (volumes are mounted out-of-band, spec §1 "out of scope");
        // last_mount_lsn is always null.
        self.charge(reserved)?;
        let begin_rec = LogRecord::new(RecordType::ChkptBegin, Category::empty(), 0, page_id, page_tag)
            .with_payload({
                let mut v = Vec::with_capacity(8);
                encode_lsn(Lsn::NULL, &mut v);
                v
            });
        let master_lsn = self.log.insert(begin_rec)?;

        // Step 6: chkpt_bf_tab in chunks; compute min_rec_lsn.
        let dirty = self.buffer.dirty_bcb_snapshot();
        for chunk in dirty.chunks(BF_TAB_CHUNK) {
            self.charge(reserved)?;
            let rec = LogRecord::new(RecordType::ChkptBfTab, Category::empty(), 0, page_id, page_tag)
                .with_payload(encode_bf_tab(chunk));
            self.log.insert(rec)?;
        }
        let min_rec_lsn = self.buffer.min_rec_lsn();

        // Step 7: chkpt_dev_tab.
        self.charge(reserved)?;
        let volumes = self.buffer.mounted_volumes();
        let dev_rec = LogRecord::new(RecordType::ChkptDevTab, Category::empty(), 0, page_id, page_tag)
            .with_payload(encode_dev_tab(&volumes));
        self.log.insert(dev_rec)?;

        // Step 8: chkpt_xct_tab in chunks; compute min_xct_lsn.
        let snapshot = self.xct_manager.snapshot();
        let youngest_tid = snapshot.iter().map(|x| x.tid).max().unwrap_or(0);
        for chunk in snapshot.chunks(XCT_TAB_CHUNK) {
            self.charge(reserved)?;
            let rec = LogRecord::new(RecordType::ChkptXctTab, Category::empty(), 0, page_id, page_tag)
                .with_payload(encode_xct_tab(youngest_tid, chunk));
            self.log.insert(rec)?;
        }
        let min_xct_lsn = self.xct_manager.oldest_active_first_lsn(self.log.curr_lsn());

        // Step 9: chkpt_end.
        self.charge(reserved)?;
        let end_rec = LogRecord::new(RecordType::ChkptEnd, Category::empty(), 0, page_id, page_tag)
            .with_payload(encode_chkpt_end(master_lsn, min_rec_lsn));
        let end_lsn = self.log.insert(end_rec)?;

        // Step 10: flush, publish master LSN, scavenge.
        self.log.flush(end_lsn, true, false)?;
        self.counter.fetch_add(1, Ordering::AcqRel);
        self.log.scavenge(min_rec_lsn, min_xct_lsn)?;

        tracing::info!(%master_lsn, %min_rec_lsn, %min_xct_lsn, "checkpoint complete");
        Ok(master_lsn)

        // Step 11 (release checkpoint-serial mutex) happens implicitly
        // when `_serial` drops in the caller.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, FixMode};
    use crate::common::EngineConfig;
    use crate::lock::LockManager;
    use crate::storage::Volume;

    fn harness() -> (
        Arc<CheckpointManager>,
        Arc<LogManager>,
        Arc<BufferPool>,
        Arc<XctManager>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = EngineConfig::default();
        cfg.log_dir = dir.path().join("log");
        cfg.log_partition_size = 1 << 20;
        cfg.buffer_pool_pages = 8;
        cfg.gc_segments_per_generation = 4;
        cfg.gc_segment_size = 64;
        cfg.okvl_partitions = 1;
        let cfg = Arc::new(cfg);
        let log = LogManager::open(&cfg).unwrap();
        let lock_manager = Arc::new(LockManager::new(cfg.clone()));
        let buffer = Arc::new(BufferPool::new(cfg.clone(), log.clone()));
        let volume = Volume::from_config(&cfg, dir.path().join("data.vol"), 1).unwrap();
        buffer.mount_volume(Arc::new(volume));
        let xct_manager = XctManager::new(cfg.clone(), log.clone(), lock_manager);
        let chkpt = CheckpointManager::new(cfg, log.clone(), buffer.clone(), xct_manager.clone());
        (chkpt, log, buffer, xct_manager, dir)
    }

    #[test]
    fn empty_checkpoint_succeeds_and_returns_a_valid_master_lsn() {
        let (chkpt, log, _buffer, _xct, _dir) = harness();
        let master_lsn = chkpt.take().unwrap();
        assert!(!master_lsn.is_null());
        assert!(log.durable_lsn() >= master_lsn);
    }

    #[test]
    fn two_consecutive_checkpoints_both_succeed() {
        let (chkpt, _log, _buffer, _xct, _dir) = harness();
        let first = chkpt.take().unwrap();
        let second = chkpt.take().unwrap();
        assert!(second > first);
    }

    #[test]
    fn dirty_pages_are_captured_in_bf_tab_and_flushed() {
        let (chkpt, _log, buffer, xct_manager, _dir) = harness();
        let xct = xct_manager.begin();
        let page_id = PageId::new(1, 1, 1);
        let mut fixed = buffer.fix(page_id, FixMode::Exclusive, true, None).unwrap();
        let page = match &mut fixed {
            crate::buffer::Fixed::Write(w) => w,
            _ => unreachable!(),
        };
        let rec = xct.get_logbuf(RecordType::Application, Category::REDO, page_id, PageTag::File);
        xct.give_logbuf(rec, page).unwrap();
        drop(fixed);
        assert_eq!(buffer.dirty_count(), 1);

        xct_manager.commit(&xct, false).unwrap();
        let master_lsn = chkpt.take().unwrap();
        assert!(!master_lsn.is_null());
        // force_until_lsn(oldest_valid_lsn) in step 3 only flushes pages
        // at or below the checkpoint's starting watermark; the dirty page
        // above it survives into the bf_tab snapshot taken in step 6.
    }

    #[test]
    fn active_xct_appears_in_xct_tab_snapshot() {
        let (chkpt, _log, _buffer, xct_manager, _dir) = harness();
        let xct = xct_manager.begin();
        assert_eq!(xct_manager.snapshot().len(), 1);
        let master_lsn = chkpt.take().unwrap();
        assert!(!master_lsn.is_null());
        xct_manager.commit(&xct, false).unwrap();
    }

    #[test]
    fn chkpt_end_payload_round_trips() {
        let master = Lsn::new(3, 100);
        let min_rec = Lsn::new(2, 50);
        let payload = encode_chkpt_end(master, min_rec);
        let decoded = decode_chkpt_end(&payload);
        assert_eq!(decoded.master_lsn, master);
        assert_eq!(decoded.min_rec_lsn, min_rec);
    }
}
