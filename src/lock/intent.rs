//! Light-weight intent locks (spec §4.5 "LIL"): per-volume/per-store
//! counters for `IS`/`IX`/`S` plus an `X` bit, a release-version counter
//! and a commit-LSN tag, with a condition-variable slow path bounded by a
//! lock-specific timeout. Grounded on
//! `examples/original_source/src/sm/lock_lil.cpp`/`lock_lil.h`.
//!
//! Fast path is a spinlock + counters + CAS; the per-xct side caches
//! currently-held intent locks (`XctLockState`, spec §4.5/§9 "per-xct
//! intent-lock cache") so re-acquisition of an already-held mode is a
//! counter bump rather than a table probe.

use crate::common::Lsn;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// The three granularity-lock modes the light-weight layer grants
/// directly (full key-value locking happens one layer down in OKVL).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentMode {
    IS,
    IX,
    S,
    X,
}

struct IntentLockState {
    is_count: u32,
    ix_count: u32,
    s_count: u32,
    has_x: bool,
    waiters: u32,
    release_version: u64,
    /// Commit LSN of the last X releaser, for safe early release readers
    /// to wait on (mirrors the OKVL queue's `x_lock_tag`, spec §3).
    x_lock_tag: Lsn,
}

impl IntentLockState {
    fn new() -> Self {
        IntentLockState {
            is_count: 0,
            ix_count: 0,
            s_count: 0,
            has_x: false,
            waiters: 0,
            release_version: 0,
            x_lock_tag: Lsn::NULL,
        }
    }

    fn compatible(&self, mode: IntentMode) -> bool {
        match mode {
            IntentMode::IS => !self.has_x,
            IntentMode::IX => !self.has_x && self.s_count == 0,
            IntentMode::S => !self.has_x && self.ix_count == 0,
            IntentMode::X => !self.has_x && self.is_count == 0 && self.ix_count == 0 && self.s_count == 0,
        }
    }

    fn grant(&mut self, mode: IntentMode) {
        match mode {
            IntentMode::IS => self.is_count += 1,
            IntentMode::IX => self.ix_count += 1,
            IntentMode::S => self.s_count += 1,
            IntentMode::X => self.has_x = true,
        }
    }

    fn ungrant(&mut self, mode: IntentMode) {
        match mode {
            IntentMode::IS => self.is_count = self.is_count.saturating_sub(1),
            IntentMode::IX => self.ix_count = self.ix_count.saturating_sub(1),
            IntentMode::S => self.s_count = self.s_count.saturating_sub(1),
            IntentMode::X => self.has_x = false,
        }
        self.release_version += 1;
    }
}

struct Resource {
    mutex: Mutex<IntentLockState>,
    cv: Condvar,
}

impl Resource {
    fn new() -> Self {
        Resource {
            mutex: Mutex::new(IntentLockState::new()),
            cv: Condvar::new(),
        }
    }
}

/// Main-memory table of light-weight intent locks, one entry per
/// volume/store resource actually touched. Resources are created
/// lazily and never removed (their footprint is a few words).
pub struct IntentLockTable {
    resources: Mutex<HashMap<u64, std::sync::Arc<Resource>>>,
    timeout: Duration,
}

impl IntentLockTable {
    pub fn new(timeout: Duration) -> Self {
        IntentLockTable {
            resources: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn resource(&self, key: u64) -> std::sync::Arc<Resource> {
        let mut resources = self.resources.lock();
        resources
            .entry(key)
            .or_insert_with(|| std::sync::Arc::new(Resource::new()))
            .clone()
    }

    /// Acquires `mode` on `key` (a volume or store id). Spins briefly on
    /// the fast path; falls back to a timed condition wait; times out
    /// with `LockTimeout` (the caller self-aborts per spec §4.5).
    pub fn acquire(&self, key: u64, mode: IntentMode) -> Result<()> {
        let resource = self.resource(key);
        {
            let mut state = resource.mutex.lock();
            if state.compatible(mode) {
                state.grant(mode);
                return Ok(());
            }
            state.waiters += 1;
        }
        let deadline = Instant::now() + self.timeout;
        loop {
            let mut state = resource.mutex.lock();
            if state.compatible(mode) {
                state.waiters -= 1;
                state.grant(mode);
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state.waiters -= 1;
                return Err(Error::LockTimeout);
            }
            let timed_out = resource.cv.wait_for(&mut state, remaining).timed_out();
            if timed_out && !state.compatible(mode) {
                state.waiters -= 1;
                return Err(Error::LockTimeout);
            }
        }
    }

    pub fn release(&self, key: u64, mode: IntentMode, commit_lsn: Option<Lsn>) {
        let resource = self.resource(key);
        {
            let mut state = resource.mutex.lock();
            state.ungrant(mode);
            if let Some(lsn) = commit_lsn {
                state.x_lock_tag = state.x_lock_tag.max(lsn);
            }
        }
        resource.cv.notify_all();
    }

    pub fn x_lock_tag(&self, key: u64) -> Lsn {
        self.resource(key).mutex.lock().x_lock_tag
    }
}

/// Per-xct cache of currently-held intent locks, so re-acquiring a mode
/// the xct already holds is a counter bump instead of a table probe
/// (spec §9 design note on `lock_lil.cpp`).
#[derive(Default)]
pub struct XctLockState {
    held: HashMap<(u64, IntentMode), u32>,
}

impl XctLockState {
    pub fn new() -> Self {
        XctLockState::default()
    }

    /// Returns `true` if this is the first time the xct acquires `mode`
    /// on `key` (caller must actually go acquire it); `false` if the
    /// cache already shows it held (free re-acquisition).
    pub fn note_acquire(&mut self, key: u64, mode: IntentMode) -> bool {
        let count = self.held.entry((key, mode)).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Returns `true` if this was the last reference and the caller must
    /// actually release it at the table.
    pub fn note_release(&mut self, key: u64, mode: IntentMode) -> bool {
        if let Some(count) = self.held.get_mut(&(key, mode)) {
            *count -= 1;
            if *count == 0 {
                self.held.remove(&(key, mode));
                return true;
            }
        }
        false
    }

    pub fn held_modes(&self) -> impl Iterator<Item = (u64, IntentMode)> + '_ {
        self.held.keys().copied()
    }
}
