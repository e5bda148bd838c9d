//! Transaction Context (spec §4.8, C8): per-transaction state machine,
//! log cursor, compensation anchors, savepoints, rollback, and the
//! commit/abort/chain protocols. Grounded on
//! `examples/original_source/src/sm/xct.cpp` (`xct_t::_commit`,
//! `xct_t::_abort`, `xct_t::chain`, `xct_t::save_point`/`rollback`) and
//! `xct_dependent.h` (per-xct dependent state).
//!
//! Index structures are an external collaborator (spec §1): they are the
//! only thing that knows how to undo their own record types. Rather than
//! hard-code B-tree/file undo here, [`Xct`] accepts an optional
//! [`UndoHandler`] the owning layer registers; rollback still performs the
//! generic walk-backwards-over-`xid_prev`/CLR-jump machinery described in
//! spec §4.8 and calls out to that handler for the type-specific part.

mod manager;

pub use manager::{SsxGuard, XctManager, XctSnapshot};

use crate::common::{ElrMode, Lsn, PageId, PageTag, Tid};
use crate::error::{Error, Result};
use crate::lock::{LockManager, OkvlMode};
use crate::log::{Category, LogManager, LogRecord, RecordType};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// The xct state lattice (spec §3 "Transaction (Xct)"): `active ->
/// (chaining <-> committing | aborting) -> freeing_space -> ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XctState {
    Active,
    Chaining,
    Committing,
    Aborting,
    FreeingSpace,
    Ended,
}

impl XctState {
    fn name(self) -> &'static str {
        match self {
            XctState::Active => "active",
            XctState::Chaining => "chaining",
            XctState::Committing => "committing",
            XctState::Aborting => "aborting",
            XctState::FreeingSpace => "freeing_space",
            XctState::Ended => "ended",
        }
    }

    /// Whether `self -> to` is a legal transition in the lattice.
    fn can_transition_to(self, to: XctState) -> bool {
        use XctState::*;
        matches!(
            (self, to),
            (Active, Committing)
                | (Active, Aborting)
                | (Active, Chaining)
                | (Chaining, FreeingSpace)
                | (Committing, FreeingSpace)
                | (Aborting, FreeingSpace)
                | (FreeingSpace, Ended)
        )
    }
}

/// Opaque handle to a point in an xct's log chain, returned by
/// [`Xct::save_point`] and consumed by [`Xct::rollback_to`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Savepoint(Lsn);

/// Caller-supplied type-specific undo, invoked by [`Xct::rollback_to`]
/// for every UNDO-category record it walks past (spec §4.8 "invoke its
/// type-specific undo"). Index structures are the only thing with
/// enough context to actually perform one; we hold a trait object so this
/// crate's rollback loop never needs to know what a B-tree update means.
pub trait UndoHandler: Send + Sync {
    fn undo(&self, record: &LogRecord) -> Result<()>;
}

/// Per-xct bookkeeping the transaction context owns directly (spec §3
/// "Transaction (Xct)"). `Tid` identity, held locks, and dirty pages are
/// tracked elsewhere (`LockManager`, `BufferPool`) and are reached
/// through `lock_manager`/`log`/the caller's own `BufferPool` handle,
/// matching the design-notes "pass a handle-struct through public APIs"
/// strategy (spec §9) rather than a `smlevel_0`-style global singleton.
pub struct Xct {
    tid: Tid,
    is_system: bool,
    state: Mutex<XctState>,
    attached_thread: Mutex<Option<std::thread::ThreadId>>,
    first_lsn: Mutex<Lsn>,
    last_lsn: Mutex<Lsn>,
    undo_nxt: Mutex<Lsn>,
    read_watermark: Mutex<Lsn>,
    chain_len: AtomicU32,
    elr_mode: ElrMode,
    anchor_stack: Mutex<Vec<Lsn>>,
    savepoints_taken: AtomicU64,
    locks_released: std::sync::atomic::AtomicBool,
    read_only: std::sync::atomic::AtomicBool,
    undo_handler: Option<Arc<dyn UndoHandler>>,
    log: Arc<LogManager>,
    lock_manager: Arc<LockManager>,
}

impl Xct {
    fn new(
        tid: Tid,
        is_system: bool,
        elr_mode: ElrMode,
        inherited_watermark: Lsn,
        log: Arc<LogManager>,
        lock_manager: Arc<LockManager>,
        undo_handler: Option<Arc<dyn UndoHandler>>,
    ) -> Self {
        Xct {
            tid,
            is_system,
            state: Mutex::new(XctState::Active),
            attached_thread: Mutex::new(Some(std::thread::current().id())),
            first_lsn: Mutex::new(Lsn::NULL),
            last_lsn: Mutex::new(Lsn::NULL),
            undo_nxt: Mutex::new(Lsn::NULL),
            read_watermark: Mutex::new(inherited_watermark),
            chain_len: AtomicU32::new(0),
            elr_mode,
            anchor_stack: Mutex::new(Vec::new()),
            savepoints_taken: AtomicU64::new(0),
            locks_released: std::sync::atomic::AtomicBool::new(false),
            read_only: std::sync::atomic::AtomicBool::new(true),
            undo_handler,
            log,
            lock_manager,
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn state(&self) -> XctState {
        *self.state.lock()
    }

    pub fn first_lsn(&self) -> Lsn {
        *self.first_lsn.lock()
    }

    pub fn last_lsn(&self) -> Lsn {
        *self.last_lsn.lock()
    }

    pub fn read_watermark(&self) -> Lsn {
        *self.read_watermark.lock()
    }

    pub fn chain_len(&self) -> u32 {
        self.chain_len.load(Ordering::Acquire)
    }

    fn transition(&self, to: XctState) -> Result<()> {
        let mut state = self.state.lock();
        if !state.can_transition_to(to) {
            return Err(Error::StateTransitionInvalid {
                from: state.name().to_string(),
                to: to.name().to_string(),
            });
        }
        *state = to;
        Ok(())
    }

    /// Asserts the calling thread is the one attached to this xct (spec
    /// §4.8: "only one thread may be logging or lock-requesting on its
    /// behalf at a time").
    fn assert_attached(&self) -> Result<()> {
        let attached = self.attached_thread.lock();
        match *attached {
            Some(id) if id == std::thread::current().id() => Ok(()),
            Some(_) => Err(Error::TwoThreadsInXct),
            None => Err(Error::NoActiveXct),
        }
    }

    /// Binds the calling thread to this xct (spec §4.8 "thread-attach
    /// protocol").
    pub fn attach(&self) -> Result<()> {
        let mut attached = self.attached_thread.lock();
        match *attached {
            None => {
                *attached = Some(std::thread::current().id());
                Ok(())
            }
            Some(id) if id == std::thread::current().id() => Ok(()),
            Some(_) => Err(Error::TwoThreadsInXct),
        }
    }

    pub fn detach(&self) {
        *self.attached_thread.lock() = None;
    }

    fn bump_last_lsn(&self, lsn: Lsn) {
        let mut first = self.first_lsn.lock();
        if first.is_null() {
            *first = lsn;
        }
        *self.last_lsn.lock() = lsn;
        *self.undo_nxt.lock() = lsn;
    }

    /// Returns a skeleton log record for the caller to fill in before
    /// calling [`Xct::give_logbuf`] (spec §4.8 `get_logbuf`).
    pub fn get_logbuf(&self, rec_type: RecordType, category: Category, page_id: PageId, page_tag: PageTag) -> LogRecord {
        LogRecord::new(rec_type, category, self.tid, page_id, page_tag)
    }

    /// Stamps `tid`/`xid_prev`/the touched page's `page_prev`, submits
    /// the record to the log, and updates the page's `page_lsn` under the
    /// write latch the caller already holds (spec §4.8 `give_logbuf`).
    pub fn give_logbuf(
        &self,
        mut record: LogRecord,
        page: &mut crate::buffer::PageWriteGuard<'_>,
    ) -> Result<Lsn> {
        self.assert_attached()?;
        record.xid_prev = *self.last_lsn.lock();
        record.page_prev = page.page_lsn();
        let lsn = self.log.insert(record)?;
        self.bump_last_lsn(lsn);
        page.set_page_lsn(lsn);
        self.read_only.store(false, Ordering::Release);
        Ok(lsn)
    }

    /// Single-log system transaction (spec §3 SSX, §4.8): logs
    /// independently and does not touch the outer xct's `last_lsn`.
    pub fn log_ssx(&self, mut record: LogRecord) -> Result<Lsn> {
        record.category.insert(Category::SSX);
        record.xid_prev = Lsn::NULL;
        self.log.insert(record)
    }

    /// Requests `mode` on `(store_id, key_hash)`; on success, folds in
    /// any X-lock commit-LSN tag observed on the queue into this xct's
    /// `read_watermark` (spec §4.5 "early lock release" / scenario 4).
    pub fn acquire_lock(&self, store_id: u32, key_hash: u64, mode: OkvlMode) -> Result<()> {
        self.assert_attached()?;
        self.lock_manager.acquire(self.tid, store_id, key_hash, mode)?;
        let tag = self.lock_manager.x_lock_tag(store_id, key_hash);
        if !tag.is_null() {
            let mut watermark = self.read_watermark.lock();
            *watermark = (*watermark).max(tag);
        }
        Ok(())
    }

    /// Increments the anchor depth, recording the current `last_lsn`
    /// (spec §4.8 `anchor()`).
    pub fn anchor(&self) -> u32 {
        self.anchor_stack.lock().push(*self.last_lsn.lock());
        self.anchor_stack.lock().len() as u32
    }

    /// Decrements the anchor depth; when the outermost anchor releases
    /// with `compensate=true`, marks the last emitted record as a CLR
    /// pointing back to the anchor, patching in place if still buffered
    /// or writing a stand-alone CLR otherwise (spec §4.8
    /// `release_anchor`).
    pub fn release_anchor(&self, compensate: bool) -> Result<()> {
        let anchor_lsn = self
            .anchor_stack
            .lock()
            .pop()
            .ok_or_else(|| Error::StateTransitionInvalid {
                from: "no-anchor".to_string(),
                to: "release_anchor".to_string(),
            })?;
        let still_nested = !self.anchor_stack.lock().is_empty();
        if still_nested || !compensate {
            return Ok(());
        }
        let last = *self.last_lsn.lock();
        if last == anchor_lsn || last.is_null() {
            return Ok(());
        }
        if self.log.compensate(last, anchor_lsn)? {
            return Ok(());
        }
        let mut clr = LogRecord::new(RecordType::Compensate, Category::CPSN, self.tid, PageId::new(0, 0, 0), PageTag::Invalid);
        clr.xid_prev = anchor_lsn;
        let clr_lsn = self.log.insert(clr)?;
        self.bump_last_lsn(clr_lsn);
        Ok(())
    }

    /// Records a savepoint at the current log position (spec §4.8
    /// `save_point`).
    pub fn save_point(&self) -> Savepoint {
        self.savepoints_taken.fetch_add(1, Ordering::Relaxed);
        Savepoint(*self.last_lsn.lock())
    }

    /// Rolls back to `savepoint`, undoing every record in between and
    /// leaving the xct active (spec §4.8 "Rollback to savepoint" / §8
    /// round-trip law). Unlike [`Xct::abort`], this does not end the
    /// xct or release locks.
    pub fn rollback_to(&self, savepoint: Savepoint) -> Result<()> {
        self.assert_attached()?;
        self.rollback_internal(savepoint.0)
    }

    /// Walks the xct's log chain backwards from `undo_nxt`; CLR records
    /// jump straight to their own `undo_nxt` (stored in the patched
    /// `xid_prev` slot, see [`LogManager::compensate`]); other undoable
    /// records invoke the registered [`UndoHandler`] and get a CLR of
    /// their own. Stops at `stop_at` or the xct's first LSN (spec §4.8
    /// "Rollback").
    fn rollback_internal(&self, stop_at: Lsn) -> Result<()> {
        let mut cursor = *self.undo_nxt.lock();
        let floor = if stop_at.is_null() { *self.first_lsn.lock() } else { stop_at };
        loop {
            if cursor.is_null() || cursor <= floor {
                break;
            }
            let record = self.log.fetch(cursor)?;
            if record.category.contains(Category::CPSN) {
                cursor = record.xid_prev;
                continue;
            }
            if record.category.contains(Category::UNDO) {
                if let Some(handler) = &self.undo_handler {
                    handler.undo(&record)?;
                }
                let mut clr = LogRecord::new(
                    RecordType::Compensate,
                    Category::CPSN,
                    self.tid,
                    record.page_id,
                    record.page_tag,
                );
                clr.xid_prev = record.xid_prev;
                let clr_lsn = self.log.insert(clr)?;
                *self.last_lsn.lock() = clr_lsn;
            }
            cursor = record.xid_prev;
        }
        *self.undo_nxt.lock() = floor;
        Ok(())
    }

    fn log_state_record(&self, rec_type: RecordType) -> Result<Lsn> {
        let rec = LogRecord::new(rec_type, Category::empty(), self.tid, PageId::new(0, 0, 0), PageTag::Invalid);
        let lsn = self.log.insert(rec)?;
        self.bump_last_lsn(lsn);
        Ok(lsn)
    }

    /// Commit protocol (spec §4.8 "Commit protocol" steps 1-5; step 6 —
    /// teardown/chaining/thread detach — is driven by [`XctManager`]
    /// since it owns xct identity/lifecycle).
    pub(crate) fn commit_body(&self, lazy: bool, chaining: bool) -> Result<Lsn> {
        self.assert_attached()?;
        self.transition(if chaining { XctState::Chaining } else { XctState::Committing })?;
        if !self.is_system {
            self.log_state_record(RecordType::XctFreeingSpace)?;
        }
        let commit_lsn = self.log_state_record(RecordType::XctEnd)?;

        let release_all_now = self.elr_mode.releases_all_early();
        let release_reads_now = !release_all_now && self.elr_mode.releases_read_early();
        if release_all_now {
            self.lock_manager.release_all(self.tid, Some(commit_lsn), self.elr_mode);
            self.locks_released.store(true, Ordering::Release);
        } else if release_reads_now {
            // `elr_s`: S/U locks go now regardless of whether this xct did
            // any writes; any X locks it holds stay held until the normal
            // release at `finish_commit`/`abort_body`.
            self.lock_manager.release_reads(self.tid, Some(commit_lsn));
        }

        if lazy {
            self.log.flush(commit_lsn, false, true)?;
        } else {
            self.log.flush(commit_lsn, true, false)?;
        }

        // Scenario 4 (spec §8): a read-only xct that ends with a
        // non-null watermark must flush through the commit it observed
        // before it may report committed.
        let watermark = *self.read_watermark.lock();
        if !watermark.is_null() && watermark > commit_lsn {
            let mut attempt = 0;
            loop {
                match self.log.flush(watermark, true, false) {
                    Ok(()) => break,
                    Err(_) if attempt < 3 => {
                        attempt += 1;
                        continue;
                    }
                    Err(_) => {
                        // Forced sentinel: nudge curr_lsn forward so a
                        // subsequent flush has something to wait for.
                        self.log_state_record(RecordType::Skip)?;
                        self.log.flush(watermark, true, false)?;
                        break;
                    }
                }
            }
        }
        Ok(commit_lsn)
    }

    pub(crate) fn finish_commit(&self) -> Result<()> {
        self.transition(XctState::FreeingSpace)?;
        self.transition(XctState::Ended)?;
        if !self.locks_released.swap(true, Ordering::AcqRel) {
            self.lock_manager.release_all(self.tid, Some(*self.last_lsn.lock()), self.elr_mode);
        }
        self.detach();
        Ok(())
    }

    /// Abort protocol (spec §4.8 "Abort protocol"). `loser` marks xcts
    /// discovered during recovery rather than aborted live; both paths
    /// share this body.
    pub(crate) fn abort_body(&self, loser: bool) -> Result<()> {
        if !loser {
            self.assert_attached()?;
        }
        self.transition(XctState::Aborting)?;
        self.rollback_internal(Lsn::NULL)?;
        self.log_state_record(RecordType::XctFreeingSpace)?;
        let abort_lsn = self.log_state_record(RecordType::XctAbort)?;
        if self.chain_len() > 0 {
            self.log.flush(abort_lsn, true, false)?;
        }
        self.transition(XctState::FreeingSpace)?;
        self.transition(XctState::Ended)?;
        if !self.locks_released.swap(true, Ordering::AcqRel) {
            self.lock_manager.release_all(self.tid, None, ElrMode::None);
        }
        self.detach();
        Ok(())
    }
}
