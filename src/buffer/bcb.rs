//! Buffer control block (spec §3 "BCB", §4.6): per-frame metadata plus the
//! frame's page data behind the C3 read/write spin latch. Grounded on
//! `examples/original_source/src/sm/bf_tree_cb.h` (`bf_tree_cb_t`).

use crate::common::{Lsn, PageId, StoreFlags};
use crate::lockfree::{LatchMode, ReadGuard, RwSpinLatch, WriteGuard};
use crate::storage::Page;
use std::cell::UnsafeCell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use parking_lot::Mutex;

/// One buffer frame: created once at pool init, repurposed on replacement,
/// never freed before shutdown (spec §3 BCB lifecycle).
pub struct Bcb {
    pub index: usize,
    page_id: Mutex<PageId>,
    resident: AtomicBool,
    latch: RwSpinLatch,
    data: UnsafeCell<Page>,
    dirty: AtomicBool,
    /// `Lsn::NULL` encodes "no rec_lsn yet" (spec §3 BCB invariant (b)).
    rec_lsn: Mutex<Lsn>,
    old_rec_lsn: Mutex<Option<Lsn>>,
    pin_count: AtomicI64,
    hot_bit: AtomicBool,
    store_flags: Mutex<StoreFlags>,
    /// Write-order-dependency edges: frames that must be flushed before
    /// this one (`predecessors`) and frames waiting on this one
    /// (`successors`), addressed by frame index (spec §4.6).
    predecessors: Mutex<HashSet<usize>>,
    successors: Mutex<HashSet<usize>>,
}

// SAFETY: `data` is only ever accessed through `read()`/`write()`, which
// require holding the corresponding `RwSpinLatch` guard; the latch
// enforces the same reader/writer exclusion a `RwLock` would.
unsafe impl Send for Bcb {}
unsafe impl Sync for Bcb {}

impl Bcb {
    pub fn new(index: usize, placeholder: Page) -> Self {
        Bcb {
            index,
            page_id: Mutex::new(placeholder.page_id()),
            resident: AtomicBool::new(false),
            latch: RwSpinLatch::new(),
            data: UnsafeCell::new(placeholder),
            dirty: AtomicBool::new(false),
            rec_lsn: Mutex::new(Lsn::NULL),
            old_rec_lsn: Mutex::new(None),
            pin_count: AtomicI64::new(0),
            hot_bit: AtomicBool::new(false),
            store_flags: Mutex::new(StoreFlags::empty()),
            predecessors: Mutex::new(HashSet::new()),
            successors: Mutex::new(HashSet::new()),
        }
    }

    pub fn page_id(&self) -> PageId {
        *self.page_id.lock()
    }

    pub fn set_page_id(&self, id: PageId) {
        *self.page_id.lock() = id;
    }

    pub fn is_resident(&self) -> bool {
        self.resident.load(Ordering::Acquire)
    }

    pub fn set_resident(&self, resident: bool) {
        self.resident.store(resident, Ordering::Release);
    }

    pub fn latch(&self) -> &RwSpinLatch {
        &self.latch
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Marks the BCB dirty and, if `rec_lsn` was null, sets it (spec §4.6
    /// "every EX fix calls update_rec_lsn ... assigns rec_lsn = current_log_lsn
    /// only when it was null").
    pub fn update_rec_lsn(&self, current_log_lsn: Lsn) {
        self.dirty.store(true, Ordering::Release);
        let mut rec_lsn = self.rec_lsn.lock();
        if rec_lsn.is_null() {
            *rec_lsn = current_log_lsn;
        }
    }

    pub fn rec_lsn(&self) -> Option<Lsn> {
        let rec_lsn = *self.rec_lsn.lock();
        if rec_lsn.is_null() {
            None
        } else {
            Some(rec_lsn)
        }
    }

    pub fn clear_rec_lsn(&self) {
        *self.rec_lsn.lock() = Lsn::NULL;
        self.dirty.store(false, Ordering::Release);
    }

    /// A "safe" rec_lsn for checkpoint purposes: never the tentative
    /// `old_rec_lsn` a cleaner might be mid-way through retiring (spec
    /// §4.6 `get_rec_lsn`).
    pub fn safe_rec_lsn(&self) -> Option<Lsn> {
        self.rec_lsn()
    }

    pub fn begin_cleaning(&self) -> Option<Lsn> {
        let rec_lsn = self.rec_lsn();
        *self.old_rec_lsn.lock() = rec_lsn;
        rec_lsn
    }

    pub fn finish_cleaning(&self) {
        *self.old_rec_lsn.lock() = None;
        self.clear_rec_lsn();
    }

    pub fn pin(&self) -> i64 {
        self.pin_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn unpin(&self) -> i64 {
        self.pin_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn pin_count(&self) -> i64 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn hot_bit(&self) -> bool {
        self.hot_bit.load(Ordering::Acquire)
    }

    pub fn set_hot_bit(&self, hot: bool) {
        self.hot_bit.store(hot, Ordering::Release);
    }

    pub fn store_flags(&self) -> StoreFlags {
        *self.store_flags.lock()
    }

    pub fn set_store_flags(&self, flags: StoreFlags) {
        *self.store_flags.lock() = flags;
    }

    pub fn add_dependency_on(&self, predecessor: usize) {
        self.predecessors.lock().insert(predecessor);
    }

    pub fn remove_dependency_on(&self, predecessor: usize) {
        self.predecessors.lock().remove(&predecessor);
    }

    pub fn add_successor(&self, successor: usize) {
        self.successors.lock().insert(successor);
    }

    pub fn remove_successor(&self, successor: usize) {
        self.successors.lock().remove(&successor);
    }

    pub fn predecessors(&self) -> Vec<usize> {
        self.predecessors.lock().iter().copied().collect()
    }

    pub fn successors(&self) -> Vec<usize> {
        self.successors.lock().iter().copied().collect()
    }

    pub fn has_predecessors(&self) -> bool {
        !self.predecessors.lock().is_empty()
    }

    /// SAFETY: caller must hold the read or write latch.
    #[allow(clippy::mut_from_ref)]
    unsafe fn data_mut(&self) -> &mut Page {
        &mut *self.data.get()
    }

    /// SAFETY: caller must hold at least the read latch.
    unsafe fn data_ref(&self) -> &Page {
        &*self.data.get()
    }

    /// Replaces the resident page wholesale (a fresh read from disk, or
    /// a virgin allocation). Caller must hold the write latch.
    pub(super) fn install(&self, page: Page) {
        unsafe {
            *self.data.get() = page;
        }
    }

    /// Read access for call sites (buffer pool internals) that already
    /// hold the latch directly rather than through a [`PageReadGuard`].
    pub(super) fn page_ref(&self) -> &Page {
        unsafe { self.data_ref() }
    }
}

/// Shared-mode access to a fixed page (spec §4.6 `fix(..., SH)`).
pub struct PageReadGuard<'a> {
    _latch: ReadGuard<'a>,
    bcb: &'a Bcb,
}

impl<'a> PageReadGuard<'a> {
    pub(super) fn new(bcb: &'a Bcb) -> Self {
        PageReadGuard { _latch: ReadGuard::new(bcb.latch()), bcb }
    }

    /// Wraps a read latch the buffer pool has already acquired as part
    /// of the fix protocol (spec §4.6).
    pub(super) fn already_locked(bcb: &'a Bcb) -> Self {
        PageReadGuard { _latch: ReadGuard::from_acquired(bcb.latch()), bcb }
    }

    pub fn bcb(&self) -> &'a Bcb {
        self.bcb
    }
}

impl std::ops::Deref for PageReadGuard<'_> {
    type Target = Page;
    fn deref(&self) -> &Page {
        unsafe { self.bcb.data_ref() }
    }
}

/// Exclusive-mode access to a fixed page (spec §4.6 `fix(..., EX)`).
pub struct PageWriteGuard<'a> {
    _latch: WriteGuard<'a>,
    bcb: &'a Bcb,
}

impl<'a> PageWriteGuard<'a> {
    pub(super) fn new(bcb: &'a Bcb) -> Self {
        PageWriteGuard { _latch: WriteGuard::new(bcb.latch()), bcb }
    }

    /// Wraps a write latch the buffer pool has already acquired as part
    /// of the fix protocol (spec §4.6).
    pub(super) fn already_locked(bcb: &'a Bcb) -> Self {
        PageWriteGuard { _latch: WriteGuard::from_acquired(bcb.latch()), bcb }
    }

    pub fn bcb(&self) -> &'a Bcb {
        self.bcb
    }
}

impl std::ops::Deref for PageWriteGuard<'_> {
    type Target = Page;
    fn deref(&self) -> &Page {
        unsafe { self.bcb.data_ref() }
    }
}

impl std::ops::DerefMut for PageWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Page {
        unsafe { self.bcb.data_mut() }
    }
}

pub enum FixMode {
    Shared,
    Exclusive,
}

impl FixMode {
    pub fn as_latch_mode(&self) -> LatchMode {
        match self {
            FixMode::Shared => LatchMode::Reader,
            FixMode::Exclusive => LatchMode::Writer,
        }
    }
}
