//! Buffer pool (spec §4.6, C6): page table + clock-like replacement,
//! fix/unfix protocol, write-order dependencies, and force operations.
//! Grounded on `examples/original_source/src/sm/bf_tree.cpp`
//! (`bf_tree_m::fix`/`unfix`/`_replace_out`/`register_write_order_dependency`).

use super::bcb::{Bcb, FixMode, PageReadGuard, PageWriteGuard};
use crate::common::{EngineConfig, Lsn, PageId, PageTag, StoreFlags, VolumeId};
use crate::error::{Error, Result};
use crate::log::LogManager;
use crate::storage::Volume;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Page cache with fix/unfix latches, clock replacement, write-order
/// dependencies and dirty-page force operations (spec §4.6). One buffer
/// pool serves every mounted volume.
pub struct BufferPool {
    config: Arc<EngineConfig>,
    log: Arc<LogManager>,
    frames: Vec<Bcb>,
    page_table: DashMap<PageId, usize>,
    free_list: Mutex<VecDeque<usize>>,
    clock_hand: AtomicUsize,
    volumes: DashMap<VolumeId, Arc<Volume>>,
    dirty_count: AtomicUsize,
}

impl BufferPool {
    pub fn new(config: Arc<EngineConfig>, log: Arc<LogManager>) -> Self {
        let n = config.buffer_pool_pages;
        let mut frames = Vec::with_capacity(n);
        for i in 0..n {
            let placeholder = crate::storage::Page::new_virgin(
                PageId::new(0, 0, 0),
                PageTag::Invalid,
                config.page_size,
            );
            frames.push(Bcb::new(i, placeholder));
        }
        let free_list = Mutex::new((0..n).collect());
        BufferPool {
            config,
            log,
            frames,
            page_table: DashMap::new(),
            free_list,
            clock_hand: AtomicUsize::new(0),
            volumes: DashMap::new(),
            dirty_count: AtomicUsize::new(0),
        }
    }

    pub fn mount_volume(&self, volume: Arc<Volume>) {
        self.volumes.insert(volume.id(), volume);
    }

    /// Every currently-mounted volume, for `chkpt_dev_tab` (spec §4.7
    /// step 7).
    pub fn mounted_volumes(&self) -> Vec<VolumeId> {
        self.volumes.iter().map(|e| *e.key()).collect()
    }

    fn volume_for(&self, page_id: PageId) -> Result<Arc<Volume>> {
        self.volumes
            .get(&page_id.volume)
            .map(|v| v.clone())
            .ok_or_else(|| Error::BadVolume(format!("volume {} not mounted", page_id.volume)))
    }

    pub(super) fn frame(&self, idx: usize) -> &Bcb {
        &self.frames[idx]
    }

    pub(super) fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Resident, dirty, dependency-free frames matching `filter`, for the
    /// page cleaner (spec §4.6 "selects dirty candidates via filter").
    /// Pages with a non-empty write-order-dependency list are skipped;
    /// their predecessor must be cleaned first.
    pub(super) fn dirty_candidates(&self, filter: impl Fn(PageId) -> bool) -> Vec<(usize, PageId)> {
        self.frames
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_resident() && b.is_dirty() && !b.has_predecessors())
            .map(|(i, b)| (i, b.page_id()))
            .filter(|(_, pid)| filter(*pid))
            .collect()
    }

    pub(super) fn flush_log_through(&self, lsn: Lsn) -> Result<()> {
        self.log.flush(lsn, true, false)
    }

    pub(super) fn write_page_copy(&self, page: &crate::storage::Page) -> Result<()> {
        let volume = self.volume_for(page.page_id())?;
        volume.write_page(page, false)
    }

    pub(super) fn clear_dependencies_on_pub(&self, idx: usize) {
        self.clear_dependencies_on(idx);
    }

    /// Retires a cleaner-copied frame: clears its rec_lsn/dirty bit and
    /// accounts for it in `dirty_count`, mirroring `flush_frame`'s
    /// bookkeeping so the cleaner's sweep and the eviction path never
    /// disagree about how many frames are dirty.
    pub(super) fn finish_cleaning_frame(&self, idx: usize) {
        self.frame(idx).finish_cleaning();
        self.dirty_count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Finds a frame to reuse, evicting a clean victim via the clock
    /// algorithm (spec §4.6 `replacement()`). Pages with pending
    /// write-order predecessors or that are still pinned are skipped.
    fn replacement(&self) -> Result<usize> {
        if let Some(idx) = self.free_list.lock().pop_front() {
            return Ok(idx);
        }
        let n = self.frames.len();
        for _ in 0..(2 * n) {
            let idx = self.clock_hand.fetch_add(1, Ordering::AcqRel) % n;
            let bcb = self.frame(idx);
            if bcb.pin_count() != 0 || bcb.has_predecessors() {
                continue;
            }
            if bcb.hot_bit() {
                bcb.set_hot_bit(false);
                continue;
            }
            if !bcb.latch().attempt_write() {
                continue;
            }
            if bcb.pin_count() != 0 {
                bcb.latch().release_write();
                continue;
            }
            if bcb.is_dirty() {
                if let Err(e) = self.flush_frame(bcb) {
                    bcb.latch().release_write();
                    return Err(e);
                }
            }
            if bcb.is_resident() {
                self.page_table.remove(&bcb.page_id());
            }
            bcb.set_resident(false);
            bcb.latch().release_write();
            return Ok(idx);
        }
        Err(Error::FrameNotFound)
    }

    /// Flushes one dirty frame to its volume, enforcing WAL: the log must
    /// be durable up to the page's LSN before the page write lands (spec
    /// §5 "for every durable page write of page P at LSN L, every log
    /// record ... is already on stable storage").
    fn flush_frame(&self, bcb: &Bcb) -> Result<()> {
        let volume = self.volume_for(bcb.page_id())?;
        let page = bcb.page_ref();
        self.log.flush(page.page_lsn(), true, false)?;
        volume.write_page(page, false)?;
        bcb.clear_rec_lsn();
        self.dirty_count.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// `fix(pid, mode, no_read?, store_flags?)` (spec §4.6).
    pub fn fix(
        &self,
        page_id: PageId,
        mode: FixMode,
        no_read: bool,
        store_flags: Option<StoreFlags>,
    ) -> Result<Fixed<'_>> {
        loop {
            if let Some(entry) = self.page_table.get(&page_id) {
                let idx = *entry;
                drop(entry);
                let bcb = self.frame(idx);
                let fixed = self.latch_and_check(bcb, page_id, mode)?;
                if let Some(fixed) = fixed {
                    return Ok(fixed);
                }
                continue; // page evicted out from under us; retry
            }

            let idx = self.replacement()?;
            let bcb = self.frame(idx);
            bcb.latch().acquire_write();
            // Someone may have raced us and installed this exact page
            // already; double-check after acquiring the write latch.
            if let Some(existing) = self.page_table.get(&page_id) {
                let existing_idx = *existing;
                drop(existing);
                bcb.latch().release_write();
                self.free_list.lock().push_back(idx);
                if existing_idx == idx {
                    continue;
                }
                let other = self.frame(existing_idx);
                if let Some(fixed) = self.latch_and_check(other, page_id, mode)? {
                    return Ok(fixed);
                }
                continue;
            }

            let volume = match self.volume_for(page_id) {
                Ok(v) => v,
                Err(e) => {
                    bcb.latch().release_write();
                    self.free_list.lock().push_back(idx);
                    return Err(e);
                }
            };
            let page = match if no_read {
                volume.allocate_virgin(page_id, PageTag::File)
            } else {
                volume.read_page(page_id)
            } {
                Ok(p) => p,
                Err(e) => {
                    bcb.latch().release_write();
                    self.free_list.lock().push_back(idx);
                    return Err(e);
                }
            };
            bcb.install(page);
            bcb.set_page_id(page_id);
            bcb.set_resident(true);
            if let Some(flags) = store_flags {
                bcb.set_store_flags(flags);
            }
            self.page_table.insert(page_id, idx);
            bcb.pin();
            if matches!(mode, FixMode::Exclusive) {
                bcb.update_rec_lsn(self.log.curr_lsn());
                bcb.set_hot_bit(true);
                return Ok(Fixed::Write(PageWriteGuard::already_locked(bcb)));
            }
            bcb.latch().downgrade();
            bcb.set_hot_bit(true);
            return Ok(Fixed::Read(PageReadGuard::already_locked(bcb)));
        }
    }

    fn latch_and_check(
        &self,
        bcb: &Bcb,
        page_id: PageId,
        mode: FixMode,
    ) -> Result<Option<Fixed<'_>>> {
        match mode {
            FixMode::Shared => bcb.latch().acquire_read(),
            FixMode::Exclusive => bcb.latch().acquire_write(),
        }
        if !bcb.is_resident() || bcb.page_id() != page_id {
            match mode {
                FixMode::Shared => bcb.latch().release_read(),
                FixMode::Exclusive => bcb.latch().release_write(),
            }
            return Ok(None);
        }
        bcb.pin();
        bcb.set_hot_bit(true);
        if matches!(mode, FixMode::Exclusive) {
            bcb.update_rec_lsn(self.log.curr_lsn());
            Ok(Some(Fixed::Write(PageWriteGuard::already_locked(bcb))))
        } else {
            Ok(Some(Fixed::Read(PageReadGuard::already_locked(bcb))))
        }
    }

    /// `unfix(buf, dirty, ref_bit)` (spec §4.6).
    pub fn unfix(&self, fixed: Fixed<'_>, dirty: bool, ref_bit: bool) {
        let bcb = fixed.bcb();
        if dirty {
            let was_clean = !bcb.is_dirty();
            bcb.update_rec_lsn(self.log.curr_lsn());
            if was_clean {
                self.dirty_count.fetch_add(1, Ordering::AcqRel);
            }
            if self.dirty_count.load(Ordering::Acquire) >= self.config.dirty_threshold {
                // cleaner wakeup is the caller's (CheckpointManager/Cleaner)
                // responsibility; BufferPool only exposes the counter.
            }
        }
        bcb.set_hot_bit(ref_bit || bcb.hot_bit());
        bcb.unpin();
        drop(fixed);
    }

    pub fn refix(&self, bcb: &Bcb, mode: FixMode) -> Fixed<'_> {
        match mode {
            FixMode::Shared => {
                bcb.latch().acquire_read();
                bcb.pin();
                Fixed::Read(PageReadGuard::already_locked(bcb))
            }
            FixMode::Exclusive => {
                bcb.latch().acquire_write();
                bcb.pin();
                Fixed::Write(PageWriteGuard::already_locked(bcb))
            }
        }
    }

    pub fn upgrade_latch(&self, read: PageReadGuard<'_>) -> PageWriteGuard<'_> {
        let bcb = read.bcb();
        if bcb.latch().attempt_upgrade() {
            std::mem::forget(read);
            PageWriteGuard::already_locked(bcb)
        } else {
            drop(read);
            bcb.latch().acquire_write();
            PageWriteGuard::already_locked(bcb)
        }
    }

    pub fn downgrade_latch<'a>(&self, write: PageWriteGuard<'a>) -> PageReadGuard<'a> {
        let bcb = write.bcb();
        std::mem::forget(write);
        bcb.latch().downgrade();
        PageReadGuard::already_locked(bcb)
    }

    pub fn set_dirty(&self, bcb: &Bcb) {
        let was_clean = !bcb.is_dirty();
        bcb.update_rec_lsn(self.log.curr_lsn());
        if was_clean {
            self.dirty_count.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn discard_pinned_page(&self, page_id: PageId) {
        if let Some((_, idx)) = self.page_table.remove(&page_id) {
            let bcb = self.frame(idx);
            bcb.set_resident(false);
            bcb.clear_rec_lsn();
            self.free_list.lock().push_back(idx);
        }
    }

    /// `register_write_order_dependency(successor, predecessor)` (spec
    /// §4.6): `predecessor` must be flushed before `successor`. Rejects
    /// edges that would create a cycle, leaving the graph unchanged
    /// (spec §8 scenario 6).
    pub fn register_write_order_dependency(&self, successor: usize, predecessor: usize) -> Result<()> {
        if successor == predecessor {
            return Err(Error::WriteOrderLoop);
        }
        // The new edge runs predecessor -> successor; it closes a cycle
        // iff `successor` can already reach `predecessor` along existing
        // successor edges (that path plus the new edge loops back).
        if self.path_exists(successor, predecessor) {
            return Err(Error::WriteOrderLoop);
        }
        self.frame(successor).add_dependency_on(predecessor);
        self.frame(predecessor).add_successor(successor);
        Ok(())
    }

    /// Depth-first search: is there already a path `from -> ... -> to`
    /// along successor edges? Used to reject edges that would close a
    /// cycle before they are added.
    fn path_exists(&self, from: usize, to: usize) -> bool {
        let mut stack = vec![from];
        let mut visited = std::collections::HashSet::new();
        while let Some(cur) = stack.pop() {
            if cur == to {
                return true;
            }
            if !visited.insert(cur) {
                continue;
            }
            stack.extend(self.frame(cur).successors());
        }
        false
    }

    /// Called once a page has been cleaned: removes it from its
    /// successors' predecessor lists (spec §4.6).
    fn clear_dependencies_on(&self, idx: usize) {
        let bcb = self.frame(idx);
        for succ in bcb.successors() {
            self.frame(succ).remove_dependency_on(idx);
        }
    }

    /// Scans every resident BCB for the minimum safe rec_lsn (spec §4.6
    /// `get_rec_lsn`/`min_rec_lsn`, used by checkpoint).
    pub fn min_rec_lsn(&self) -> Lsn {
        self.frames
            .iter()
            .filter(|b| b.is_resident())
            .filter_map(|b| b.safe_rec_lsn())
            .min()
            .unwrap_or(Lsn::MAX)
    }

    pub fn dirty_bcb_snapshot(&self) -> Vec<(PageId, Lsn)> {
        self.frames
            .iter()
            .filter(|b| b.is_resident() && b.is_dirty())
            .filter_map(|b| b.rec_lsn().map(|lsn| (b.page_id(), lsn)))
            .collect()
    }

    fn force_filtered(&self, predicate: impl Fn(&Bcb) -> bool, until_lsn: Option<Lsn>) -> Result<()> {
        for idx in 0..self.frames.len() {
            let bcb = self.frame(idx);
            if !bcb.is_resident() || !bcb.is_dirty() || !predicate(bcb) {
                continue;
            }
            if let Some(limit) = until_lsn {
                if bcb.rec_lsn().map(|l| l > limit).unwrap_or(false) {
                    continue;
                }
            }
            if !bcb.latch().attempt_write() {
                continue;
            }
            if bcb.is_dirty() {
                bcb.begin_cleaning();
                let result = self.flush_frame(bcb);
                bcb.finish_cleaning();
                self.clear_dependencies_on(idx);
                result?;
            }
            bcb.latch().release_write();
        }
        Ok(())
    }

    pub fn force_all(&self) -> Result<()> {
        self.force_filtered(|_| true, None)
    }

    pub fn force_store(&self, store: crate::common::StoreId) -> Result<()> {
        self.force_filtered(|bcb| bcb.page_id().store == store, None)
    }

    pub fn force_volume(&self, volume: VolumeId) -> Result<()> {
        self.force_filtered(|bcb| bcb.page_id().volume == volume, None)
    }

    pub fn force_until_lsn(&self, lsn: Lsn) -> Result<()> {
        self.force_filtered(|_| true, Some(lsn))
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty_count.load(Ordering::Acquire)
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{EngineConfig, VolumeId};
    use crate::storage::Volume;

    fn test_pool(frames: usize) -> (tempfile::TempDir, Arc<BufferPool>, VolumeId) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.buffer_pool_pages = frames;
        config.page_size = 512;
        config.log_dir = dir.path().join("log");
        let config = Arc::new(config);
        let log = LogManager::open(&config).unwrap();
        let pool = Arc::new(BufferPool::new(config.clone(), log));
        let volume_id: VolumeId = 1;
        let volume =
            Arc::new(Volume::from_config(&config, dir.path().join("vol.dat"), volume_id).unwrap());
        pool.mount_volume(volume);
        (dir, pool, volume_id)
    }

    #[test]
    fn fix_exclusive_then_unfix_marks_dirty_and_sets_rec_lsn() {
        let (_dir, pool, vol) = test_pool(4);
        let pid = PageId::new(vol, 1, 0);
        let fixed = pool.fix(pid, FixMode::Exclusive, true, None).unwrap();
        let bcb = fixed.bcb();
        assert!(bcb.rec_lsn().is_some());
        pool.unfix(fixed, true, true);
        assert!(bcb.is_dirty());
        assert_eq!(pool.dirty_count(), 1);
    }

    #[test]
    fn fix_shared_after_write_returns_same_page() {
        let (_dir, pool, vol) = test_pool(4);
        let pid = PageId::new(vol, 1, 0);
        {
            let mut fixed = pool.fix(pid, FixMode::Exclusive, true, None).unwrap();
            if let Fixed::Write(ref mut w) = fixed {
                w.body_mut()[0..4].copy_from_slice(b"abcd");
            }
            pool.unfix(fixed, true, true);
        }
        let read = pool.fix(pid, FixMode::Shared, false, None).unwrap();
        assert_eq!(&read.page().body()[0..4], b"abcd");
        pool.unfix(read, false, false);
    }

    #[test]
    fn replacement_reuses_frames_once_pool_is_full() {
        let (_dir, pool, vol) = test_pool(2);
        for i in 0..2 {
            let pid = PageId::new(vol, 1, i);
            let fixed = pool.fix(pid, FixMode::Exclusive, true, None).unwrap();
            pool.unfix(fixed, false, false);
        }
        // Both frames are now clean and unpinned; fixing a third distinct
        // page must evict one of them rather than failing.
        let pid3 = PageId::new(vol, 1, 2);
        let fixed = pool.fix(pid3, FixMode::Exclusive, true, None).unwrap();
        pool.unfix(fixed, false, false);
    }

    #[test]
    fn write_order_dependency_cycle_is_rejected() {
        // register(P1->P2); register(P2->P3); register(P3->P1) must fail
        // with WriteOrderLoop, leaving the graph unchanged (spec §8
        // scenario 6).
        let (_dir, pool, _vol) = test_pool(4);
        pool.register_write_order_dependency(1, 0).unwrap();
        pool.register_write_order_dependency(2, 1).unwrap();
        let err = pool.register_write_order_dependency(0, 2).unwrap_err();
        assert!(matches!(err, Error::WriteOrderLoop));
        assert!(pool.frame(0).successors().contains(&1));
        assert!(!pool.frame(2).successors().contains(&0));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let (_dir, pool, _vol) = test_pool(4);
        let err = pool.register_write_order_dependency(0, 0).unwrap_err();
        assert!(matches!(err, Error::WriteOrderLoop));
    }

    #[test]
    fn min_rec_lsn_ignores_clean_frames() {
        let (_dir, pool, vol) = test_pool(4);
        let pid = PageId::new(vol, 1, 0);
        let fixed = pool.fix(pid, FixMode::Exclusive, true, None).unwrap();
        pool.unfix(fixed, true, false);
        assert_ne!(pool.min_rec_lsn(), Lsn::MAX);
    }
}

/// A fixed page, in whichever mode it was requested (spec §4.6 `fix`
/// returns `&Page` under either mode; we return a typed guard instead so
/// the borrow checker enforces the latch discipline).
pub enum Fixed<'a> {
    Read(PageReadGuard<'a>),
    Write(PageWriteGuard<'a>),
}

impl<'a> Fixed<'a> {
    pub fn bcb(&self) -> &'a Bcb {
        match self {
            Fixed::Read(g) => g.bcb(),
            Fixed::Write(g) => g.bcb(),
        }
    }

    pub fn page(&self) -> &crate::storage::Page {
        match self {
            Fixed::Read(g) => g,
            Fixed::Write(g) => g,
        }
    }
}
