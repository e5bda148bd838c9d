//! Transaction table: owns xct identity/lifecycle (begin/commit/
//! abort/chain), the active-xct snapshot the checkpoint manager reads,
//! and the single-log system-transaction scoped section (spec §4.8
//! "thread-attach protocol", "System transactions").

use super::{UndoHandler, Xct, XctState};
use crate::common::{EngineConfig, Lsn, PageId, PageTag, Tid};
use crate::error::Result;
use crate::lock::LockManager;
use crate::log::{Category, LogManager, LogRecord, RecordType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A point-in-time view of one active xct, as emitted in a
/// `chkpt_xct_tab` record (spec §4.7 step 8).
#[derive(Debug, Clone)]
pub struct XctSnapshot {
    pub tid: Tid,
    pub state: XctState,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    pub undo_nxt: Lsn,
}

/// Owns every live [`Xct`] and hands out fresh `Tid`s. One instance per
/// engine; shared by the checkpoint manager (spec §4.7) and whatever
/// session/coordinator layer sits above this crate (spec §1, out of
/// scope).
pub struct XctManager {
    config: Arc<EngineConfig>,
    log: Arc<LogManager>,
    lock_manager: Arc<LockManager>,
    next_tid: AtomicU64,
    active: Mutex<HashMap<Tid, Arc<Xct>>>,
}

impl XctManager {
    pub fn new(config: Arc<EngineConfig>, log: Arc<LogManager>, lock_manager: Arc<LockManager>) -> Arc<Self> {
        Arc::new(XctManager {
            config,
            log,
            lock_manager,
            next_tid: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        })
    }

    fn next_tid(&self) -> Tid {
        self.next_tid.fetch_add(1, Ordering::Relaxed)
    }

    fn spawn(&self, inherited_watermark: Lsn, undo_handler: Option<Arc<dyn UndoHandler>>) -> Arc<Xct> {
        let tid = self.next_tid();
        let xct = Arc::new(Xct::new(
            tid,
            false,
            self.config.elr_mode,
            inherited_watermark,
            self.log.clone(),
            self.lock_manager.clone(),
            undo_handler,
        ));
        self.active.lock().insert(tid, xct.clone());
        xct
    }

    /// Begins a fresh, non-system transaction (spec §3 "active" start
    /// state).
    pub fn begin(self: &Arc<Self>) -> Arc<Xct> {
        self.spawn(Lsn::NULL, None)
    }

    /// Begins a transaction whose rollback will invoke `handler` for
    /// every UNDO-category record it walks past (spec §4.8 "Rollback";
    /// see [`UndoHandler`]).
    pub fn begin_with_undo_handler(self: &Arc<Self>, handler: Arc<dyn UndoHandler>) -> Arc<Xct> {
        self.spawn(Lsn::NULL, Some(handler))
    }

    /// Opens a single-log system-transaction scope (spec §3 SSX, §4.8
    /// "System transactions"): skips the full state machine and the
    /// outer xct's `last_lsn`, emitting exactly one multi-page-aware
    /// log record.
    pub fn begin_ssx(&self) -> SsxGuard {
        SsxGuard {
            log: self.log.clone(),
            tid: self.next_tid(),
            emitted: false,
        }
    }

    /// Commit protocol steps 1-6 (spec §4.8): runs the body, then tears
    /// down the xct's table entry.
    pub fn commit(&self, xct: &Arc<Xct>, lazy: bool) -> Result<Lsn> {
        let commit_lsn = xct.commit_body(lazy, false)?;
        xct.finish_commit()?;
        self.active.lock().remove(&xct.tid());
        Ok(commit_lsn)
    }

    /// `Xct::chain` (spec §4.8 "Commit protocol" step 6, chaining
    /// variant): commits the current xct, then tears down and restarts a
    /// fresh one that inherits `commit_lsn` as its `read_watermark`.
    pub fn chain(self: &Arc<Self>, xct: Arc<Xct>, lazy: bool) -> Result<Arc<Xct>> {
        let commit_lsn = xct.commit_body(lazy, true)?;
        xct.transition(XctState::FreeingSpace)?;
        xct.transition(XctState::Ended)?;
        xct.detach();
        self.active.lock().remove(&xct.tid());

        let new_chain_len = xct.chain_len() + 1;
        let new_tid = self.next_tid();
        let new_xct = Arc::new(Xct::new(
            new_tid,
            false,
            self.config.elr_mode,
            commit_lsn,
            self.log.clone(),
            self.lock_manager.clone(),
            None,
        ));
        new_xct.chain_len.store(new_chain_len, Ordering::Release);
        self.active.lock().insert(new_tid, new_xct.clone());
        Ok(new_xct)
    }

    /// Abort protocol (spec §4.8 "Abort protocol"). `loser` marks an xct
    /// discovered mid-rollback during recovery rather than a live abort.
    pub fn abort(&self, xct: &Arc<Xct>, loser: bool) -> Result<()> {
        xct.abort_body(loser)?;
        self.active.lock().remove(&xct.tid());
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Snapshot of every non-ended xct, for `chkpt_xct_tab` (spec §4.7
    /// step 8).
    pub fn snapshot(&self) -> Vec<XctSnapshot> {
        self.active
            .lock()
            .values()
            .map(|x| XctSnapshot {
                tid: x.tid(),
                state: x.state(),
                first_lsn: x.first_lsn(),
                last_lsn: x.last_lsn(),
                undo_nxt: *x.undo_nxt.lock(),
            })
            .collect()
    }

    /// `min_xct_lsn` input for the checkpoint (spec §4.7 step 8): the
    /// oldest `first_lsn` among active xcts, or the log's current LSN if
    /// none are active (nothing to redo/undo on their behalf).
    pub fn oldest_active_first_lsn(&self, fallback: Lsn) -> Lsn {
        self.active
            .lock()
            .values()
            .map(|x| x.first_lsn())
            .filter(|lsn| !lsn.is_null())
            .min()
            .unwrap_or(fallback)
    }

    /// Poisons every active xct whose `first_lsn` predates
    /// `oldest_valid_lsn_plus_one` (spec §4.7 step 2) and returns their
    /// tids so the caller can wait for them to finish.
    pub fn poison_older_than(&self, oldest_valid_lsn_plus_one: Lsn) -> Vec<Tid> {
        let tids: Vec<Tid> = self
            .active
            .lock()
            .values()
            .filter(|x| {
                let first = x.first_lsn();
                !first.is_null() && first < oldest_valid_lsn_plus_one
            })
            .map(|x| x.tid())
            .collect();
        for &tid in &tids {
            self.lock_manager.poison(tid);
        }
        tids
    }

    /// Bounded poll for `tids` to leave the active table (spec §4.7 step
    /// 2 "wait for them to finish"). Returns `true` if all finished
    /// before `timeout` elapsed.
    pub fn wait_until_ended(&self, tids: &[Tid], timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let still_active = {
                let active = self.active.lock();
                tids.iter().any(|t| active.contains_key(t))
            };
            if !still_active {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

/// Scoped single-log system transaction (spec §3 SSX). Emits exactly one
/// log record and bypasses the full xct state machine entirely; dropping
/// the guard without ever emitting is a silent no-op (there is nothing to
/// undo since nothing was logged).
pub struct SsxGuard {
    log: Arc<LogManager>,
    tid: Tid,
    emitted: bool,
}

impl SsxGuard {
    /// Emits this scope's one record. A second call is rejected — an SSX
    /// is single-log by definition (spec §3 "emits one self-contained
    /// redo log record").
    pub fn log_record(
        &mut self,
        rec_type: RecordType,
        page_id: PageId,
        page_tag: PageTag,
        payload: Vec<u8>,
    ) -> Result<Lsn> {
        if self.emitted {
            return Err(crate::error::Error::StateTransitionInvalid {
                from: "ssx-already-emitted".to_string(),
                to: "ssx-emit".to_string(),
            });
        }
        let mut rec = LogRecord::new(
            rec_type,
            Category::SSX | Category::MULTI_PAGE | Category::REDO,
            self.tid,
            page_id,
            page_tag,
        )
        .with_payload(payload);
        rec.xid_prev = Lsn::NULL;
        let lsn = self.log.insert(rec)?;
        self.emitted = true;
        Ok(lsn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, FixMode};
    use crate::common::EngineConfig;
    use crate::storage::Volume;

    fn harness() -> (Arc<XctManager>, Arc<BufferPool>, tempfile::TempDir) {
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
        (XctManager::new(cfg, log, lock_manager), buffer, dir)
    }

    #[test]
    fn begin_commit_removes_from_active_table() {
        let (mgr, _buffer, _dir) = harness();
        let xct = mgr.begin();
        assert_eq!(mgr.active_count(), 1);
        mgr.commit(&xct, false).unwrap();
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn chain_preserves_watermark_and_increments_chain_len() {
        let (mgr, _buffer, _dir) = harness();
        let xct = mgr.begin();
        let chained = mgr.chain(xct, false).unwrap();
        assert_eq!(chained.chain_len(), 1);
        assert!(!chained.read_watermark().is_null());
        mgr.commit(&chained, false).unwrap();
    }

    #[test]
    fn ssx_emits_exactly_one_record() {
        let (mgr, _buffer, _dir) = harness();
        let mut ssx = mgr.begin_ssx();
        let page_id = PageId::new(1, 1, 1);
        ssx.log_record(RecordType::Application, page_id, PageTag::File, vec![1]).unwrap();
        assert!(ssx.log_record(RecordType::Application, page_id, PageTag::File, vec![2]).is_err());
    }

    #[test]
    fn poison_older_than_targets_only_old_xcts() {
        let (mgr, buffer, _dir) = harness();
        let old = mgr.begin();
        let page_id = PageId::new(1, 1, 1);
        let mut fixed = buffer.fix(page_id, FixMode::Exclusive, true, None).unwrap();
        let page = match &mut fixed {
            crate::buffer::Fixed::Write(w) => w,
            _ => unreachable!(),
        };
        let rec = old.get_logbuf(RecordType::Application, Category::REDO, page_id, PageTag::File);
        old.give_logbuf(rec, page).unwrap();
        drop(fixed);
        assert!(!old.first_lsn().is_null());

        let young = mgr.begin();
        assert!(young.first_lsn().is_null());

        let tids = mgr.poison_older_than(Lsn::MAX);
        // Only xcts with a non-null first_lsn older than the boundary are
        // poisoned; `young` never logged anything so it is left alone.
        assert_eq!(tids, vec![old.tid()]);
        assert!(mgr.lock_manager.is_poisoned(old.tid()));
        assert!(!mgr.lock_manager.is_poisoned(young.tid()));
    }
}
