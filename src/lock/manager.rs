//! Lock manager (spec §4.5): ties the light-weight intent hierarchy
//! (`intent.rs`), the OKVL key-value lattice (`okvl.rs`), per-resource
//! queues (`queue.rs`) and Dreadlocks deadlock detection (`deadlock.rs`)
//! into the four-step request protocol and the release/early-release
//! protocol. Grounded on `examples/original_source/src/sm/lock_core.cpp`
//! (`lock_core_m::lock`/`unlock`) and `lock_lil.cpp` (intent fast path).

use super::deadlock::Dreadlocks;
use super::intent::{IntentLockTable, IntentMode, XctLockState};
use super::okvl::{Mode, OkvlMode};
use super::queue::{BucketEntry, GrantResult, LockTable};
use crate::common::{EngineConfig, ElrMode, Lsn, Tid};
use crate::error::{Error, Result};
use crate::gcpool::GcPoolForest;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// How often a blocked request re-polls Dreadlocks while waiting (spec:
/// "rerun at bounded intervals because maps can become stale").
const DEADLOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A single key-value lock an xct currently holds, kept so commit/abort
/// can walk back through every queue touched and release (or, under ELR,
/// skip releasing) each one.
struct HeldKeyLock {
    lockid: u64,
    store_id: u32,
    mode: OkvlMode,
}

/// Per-xct bookkeeping the lock manager needs across a transaction's
/// lifetime: the intent-lock re-acquisition cache and the list of
/// currently-held key locks.
#[derive(Default)]
struct XctState {
    intent: XctLockState,
    held: Vec<HeldKeyLock>,
}

pub struct LockManager {
    config: Arc<EngineConfig>,
    intent: IntentLockTable,
    queues: LockTable,
    deadlock: Dreadlocks,
    xcts: Mutex<HashMap<Tid, XctState>>,
    /// Xcts the checkpoint manager has poisoned (spec §4.7 step 2,
    /// §5 "Cancellation"): a waiting request belonging to one of these
    /// returns `Deadlock` on its next poll instead of waiting further.
    poisoned: Mutex<HashSet<Tid>>,
}

impl LockManager {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let pool = Arc::new(GcPoolForest::<BucketEntry>::new(
            config.gc_segments_per_generation,
            config.gc_segment_size as u32,
        ));
        LockManager {
            intent: IntentLockTable::new(Duration::from_millis(500)),
            queues: LockTable::new(pool, config.okvl_partitions),
            deadlock: Dreadlocks::new(),
            xcts: Mutex::new(HashMap::new()),
            poisoned: Mutex::new(HashSet::new()),
            config,
        }
    }

    /// Marks `tid` so that, on return from its current (or next) block,
    /// it receives a deadlock error (spec §5 "Cancellation":
    /// `force_nonblocking`). Used by the checkpoint manager to force old
    /// transactions out of the way when log space is tight.
    pub fn poison(&self, tid: Tid) {
        self.poisoned.lock().insert(tid);
    }

    pub fn is_poisoned(&self, tid: Tid) -> bool {
        self.poisoned.lock().contains(&tid)
    }

    fn unpoison(&self, tid: Tid) {
        self.poisoned.lock().remove(&tid);
    }

    fn xct_entry<'a>(guard: &'a mut HashMap<Tid, XctState>, tid: Tid) -> &'a mut XctState {
        guard.entry(tid).or_insert_with(XctState::default)
    }

    /// Intent-locks `store_id` in the mode implied by `requested`'s key
    /// mode (spec §4.5 step 1: acquire intent locks on containing
    /// resources before the key lock itself).
    fn acquire_intent(&self, tid: Tid, store_id: u32, requested: &OkvlMode) -> Result<()> {
        let intent_mode = match requested.key {
            Mode::X | Mode::SIX | Mode::IX => IntentMode::IX,
            Mode::S | Mode::UD => IntentMode::S,
            _ => IntentMode::IS,
        };
        let first_time = {
            let mut xcts = self.xcts.lock();
            Self::xct_entry(&mut xcts, tid).intent.note_acquire(store_id as u64, intent_mode)
        };
        if first_time {
            if let Err(e) = self.intent.acquire(store_id as u64, intent_mode) {
                let mut xcts = self.xcts.lock();
                Self::xct_entry(&mut xcts, tid).intent.note_release(store_id as u64, intent_mode);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Requests `mode` on `(store_id, key_hash)` for `tid`, blocking
    /// (subject to Dreadlocks) until granted, timed out, or victimized
    /// (spec §4.5 steps 1-4).
    pub fn acquire(&self, tid: Tid, store_id: u32, key_hash: u64, mode: OkvlMode) -> Result<()> {
        self.acquire_intent(tid, store_id, &mode)?;

        let lockid = LockTable::lockid(store_id, key_hash);
        let queue = self.queues.find_or_create(lockid);

        match queue.request(tid, mode.clone(), false) {
            GrantResult::Granted => {}
            GrantResult::MustWait { blockers } => {
                self.deadlock.set_waiting(tid, blockers);
                let deadline = std::time::Instant::now() + self.config_lock_timeout();
                loop {
                    if queue.granted_mode_of(tid).is_some() {
                        break;
                    }
                    if self.is_poisoned(tid) {
                        self.deadlock.clear_waiting(tid);
                        self.unpoison(tid);
                        queue.release(tid, None, false);
                        return Err(Error::Deadlock);
                    }
                    if let Some(_cycle) = self.deadlock.detect(tid) {
                        self.deadlock.clear_waiting(tid);
                        queue.release(tid, None, false);
                        return Err(Error::Deadlock);
                    }
                    if std::time::Instant::now() >= deadline {
                        self.deadlock.clear_waiting(tid);
                        queue.release(tid, None, false);
                        return Err(Error::LockTimeout);
                    }
                    queue.wait_for(DEADLOCK_POLL_INTERVAL.min(deadline.saturating_duration_since(
                        std::time::Instant::now(),
                    )));
                }
                self.deadlock.clear_waiting(tid);
            }
        }

        let mut xcts = self.xcts.lock();
        Self::xct_entry(&mut xcts, tid).held.push(HeldKeyLock { lockid, store_id, mode });
        Ok(())
    }

    fn config_lock_timeout(&self) -> Duration {
        // The spec leaves the exact key-lock timeout unspecified per
        // resource; we reuse the intent layer's window so a blocked
        // request and its containing intent lock time out on comparable
        // scales.
        let _ = &self.config;
        Duration::from_millis(500)
    }

    /// Releases every lock `tid` holds at commit/abort. Under early lock
    /// release, `S`/`SX` key locks can be dropped before the commit LSN is
    /// durable (spec §4.5 "early lock release"); `X` locks always tag the
    /// queue with `commit_lsn` so a waiting reader can wait for
    /// durability instead of for the lock itself.
    pub fn release_all(&self, tid: Tid, commit_lsn: Option<Lsn>, elr: ElrMode) {
        let state = {
            let mut xcts = self.xcts.lock();
            xcts.remove(&tid).unwrap_or_default()
        };
        let _ = elr;
        self.unpoison(tid);
        for lock in state.held {
            let lockid = lock.lockid;
            let queue = self.queues.find_or_create(lockid);
            let is_x = lock.mode.key == Mode::X;
            // ELR is a *when*, not a *how*: the xct module decides whether
            // to call release_all before or after the commit record is
            // durable (spec §4.5 "early lock release"). Once called, every
            // held lock is actually released and, for X locks, tags the
            // queue with commit_lsn so a waiting ELR reader can wait on
            // durability instead of on the lock.
            queue.release(tid, commit_lsn, is_x);
        }
        for (key, mode) in state.intent.held_modes() {
            self.intent.release(key, mode, commit_lsn);
        }
    }

    /// Releases only `tid`'s `S`/`UD` key locks and the intent locks they
    /// were holding open (spec §4.5 `elr_s`: release read locks as soon as
    /// xct_end is durable-pending, but hold `X` locks until the ordinary
    /// release at commit/abort). Any `X`/`SIX` locks, and the `IX` intent
    /// locks backing them, are left untouched for a later `release_all`.
    pub fn release_reads(&self, tid: Tid, commit_lsn: Option<Lsn>) {
        let reads: Vec<HeldKeyLock> = {
            let mut xcts = self.xcts.lock();
            let entry = Self::xct_entry(&mut xcts, tid);
            let mut reads = Vec::new();
            entry.held.retain(|lock| {
                if matches!(lock.mode.key, Mode::S | Mode::UD) {
                    reads.push(HeldKeyLock {
                        lockid: lock.lockid,
                        store_id: lock.store_id,
                        mode: lock.mode.clone(),
                    });
                    false
                } else {
                    true
                }
            });
            reads
        };
        for lock in &reads {
            let queue = self.queues.find_or_create(lock.lockid);
            queue.release(tid, commit_lsn, false);
        }
        let intent_releases: Vec<u64> = {
            let mut xcts = self.xcts.lock();
            let entry = Self::xct_entry(&mut xcts, tid);
            reads
                .iter()
                .filter(|lock| entry.intent.note_release(lock.store_id as u64, IntentMode::S))
                .map(|lock| lock.store_id as u64)
                .collect()
        };
        for key in intent_releases {
            self.intent.release(key, IntentMode::S, commit_lsn);
        }
    }

    pub fn x_lock_tag(&self, store_id: u32, key_hash: u64) -> Lsn {
        let lockid = LockTable::lockid(store_id, key_hash);
        self.queues.find_or_create(lockid).x_lock_tag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Arc<EngineConfig> {
        let mut c = EngineConfig::default();
        c.gc_segments_per_generation = 4;
        c.gc_segment_size = 64;
        c.okvl_partitions = 1;
        Arc::new(c)
    }

    #[test]
    fn two_readers_coexist_on_the_same_key() {
        let mgr = LockManager::new(config());
        let s = OkvlMode::key_only(Mode::S, 1);
        mgr.acquire(1, 10, 100, s.clone()).unwrap();
        mgr.acquire(2, 10, 100, s).unwrap();
        mgr.release_all(1, None, ElrMode::None);
        mgr.release_all(2, None, ElrMode::None);
    }

    #[test]
    fn exclusive_lock_blocks_until_released() {
        let mgr = Arc::new(LockManager::new(config()));
        let x = OkvlMode::key_only(Mode::X, 1);
        mgr.acquire(1, 10, 200, x.clone()).unwrap();

        let mgr2 = mgr.clone();
        let handle = std::thread::spawn(move || mgr2.acquire(2, 10, 200, x));
        std::thread::sleep(Duration::from_millis(30));
        mgr.release_all(1, Some(Lsn::new(0, 5)), ElrMode::None);
        handle.join().unwrap().unwrap();
        mgr.release_all(2, None, ElrMode::None);
    }

    #[test]
    fn release_all_frees_intent_locks_not_just_key_locks() {
        // T1 holds X on store 10/key 1 (IX intent on the store). Until
        // release_all actually releases that IX intent, T2's S-mode request
        // on a different key in the same store can never be granted.
        let mgr = Arc::new(LockManager::new(config()));
        let x = OkvlMode::key_only(Mode::X, 1);
        mgr.acquire(1, 10, 1, x).unwrap();
        mgr.release_all(1, None, ElrMode::None);

        let s = OkvlMode::key_only(Mode::S, 1);
        mgr.acquire(2, 10, 2, s).unwrap();
        mgr.release_all(2, None, ElrMode::None);
    }

    #[test]
    fn release_reads_keeps_exclusive_locks_held() {
        // T1 holds S on key 1 and X on key 2 in the same store. Releasing
        // reads only frees key 1; key 2 stays held until release_all.
        let mgr = Arc::new(LockManager::new(config()));
        mgr.acquire(1, 10, 1, OkvlMode::key_only(Mode::S, 1)).unwrap();
        mgr.acquire(1, 10, 2, OkvlMode::key_only(Mode::X, 1)).unwrap();

        mgr.release_reads(1, None);

        // The S lock is gone: a conflicting X request from another xct
        // succeeds immediately.
        mgr.acquire(2, 10, 1, OkvlMode::key_only(Mode::X, 1)).unwrap();
        mgr.release_all(2, None, ElrMode::None);

        // The X lock is still held: a conflicting request from another xct
        // blocks until the remaining release_all.
        let mgr2 = mgr.clone();
        let handle = std::thread::spawn(move || mgr2.acquire(3, 10, 2, OkvlMode::key_only(Mode::X, 1)));
        std::thread::sleep(Duration::from_millis(30));
        assert!(!handle.is_finished());

        mgr.release_all(1, None, ElrMode::None);
        handle.join().unwrap().unwrap();
        mgr.release_all(3, None, ElrMode::None);
    }

    #[test]
    fn circular_wait_yields_exactly_one_deadlock_victim() {
        // T1 holds X on key A, T2 holds X on key B; T2 then waits on A
        // while T1 waits on B, closing the cycle (a minimal repro of
        // spec §8 scenario 3's circular-wait shape).
        let mgr = Arc::new(LockManager::new(config()));
        let lock_a = OkvlMode::key_only(Mode::X, 1);
        let lock_b = OkvlMode::key_only(Mode::X, 1);

        mgr.acquire(1, 10, 1, lock_a.clone()).unwrap();
        mgr.acquire(2, 10, 2, lock_b.clone()).unwrap();

        let mgr_t2 = mgr.clone();
        let lock_a2 = lock_a.clone();
        let t2 = std::thread::spawn(move || mgr_t2.acquire(2, 10, 1, lock_a2));

        std::thread::sleep(Duration::from_millis(20));

        let mgr_t1 = mgr.clone();
        let lock_b2 = lock_b.clone();
        let t1 = std::thread::spawn(move || mgr_t1.acquire(1, 10, 2, lock_b2));

        let r2 = t2.join().unwrap();
        let r1 = t1.join().unwrap();
        let failures = [&r2, &r1].iter().filter(|r| r.is_err()).count();
        assert_eq!(failures, 1);
    }
}
