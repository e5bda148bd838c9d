//! Shared read/write spin latch (spec §4.3, C3). Grounded on
//! `examples/original_source/src/common/srwlock.h`'s `mcs_rwlock`: a
//! many-reader/one-writer spin lock meant to protect short critical
//! sections (a handful of instructions), never to put a thread to sleep.
//!
//! The original packs `2*readers + writer` into one machine word and
//! updates it with a single CAS; we do the same with a 32-bit atomic. The
//! original additionally queues long-spinning writers on an MCS lock to
//! stay fair under contention (`queue_based_lock_t`); we approximate that
//! with a bounded exponential backoff rather than a full MCS queue, since
//! this crate has no other user of MCS queueing and a second lock-free
//! primitive would duplicate C2 for no spec-visible benefit.

use std::sync::atomic::{AtomicU32, Ordering};

const WRITER: u32 = 0x1;
const READER: u32 = 0x2;

/// Mode a [`RwSpinLatch`] is currently held in, as observed by any thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    None,
    Reader,
    Writer,
}

/// Many-reader/one-writer spin lock. Latch state for a single BCB or lock
/// queue lives behind one of these.
pub struct RwSpinLatch {
    holders: AtomicU32,
}

impl Default for RwSpinLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RwSpinLatch {
    pub const fn new() -> Self {
        RwSpinLatch {
            holders: AtomicU32::new(0),
        }
    }

    pub fn mode(&self) -> LatchMode {
        match self.holders.load(Ordering::Acquire) {
            0 => LatchMode::None,
            WRITER => LatchMode::Writer,
            n if n & WRITER != 0 => LatchMode::Writer,
            _ => LatchMode::Reader,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.holders.load(Ordering::Acquire) != 0
    }

    pub fn num_readers(&self) -> u32 {
        let holders = self.holders.load(Ordering::Acquire);
        if holders & WRITER != 0 {
            0
        } else {
            holders / READER
        }
    }

    /// Non-blocking read acquire.
    pub fn attempt_read(&self) -> bool {
        let mut cur = self.holders.load(Ordering::Relaxed);
        loop {
            if cur & WRITER != 0 {
                return false;
            }
            match self.holders.compare_exchange_weak(
                cur,
                cur + READER,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Spin until acquired in read mode.
    pub fn acquire_read(&self) {
        let mut spins = 0u32;
        while !self.attempt_read() {
            backoff(&mut spins);
        }
    }

    pub fn release_read(&self) {
        let prev = self.holders.fetch_sub(READER, Ordering::AcqRel);
        debug_assert!(prev & WRITER == 0 && prev >= READER, "release_read without a reader held");
    }

    /// Non-blocking write acquire.
    pub fn attempt_write(&self) -> bool {
        self.holders
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn acquire_write(&self) {
        let mut spins = 0u32;
        while !self.attempt_write() {
            backoff(&mut spins);
        }
    }

    pub fn release_write(&self) {
        let prev = self.holders.swap(0, Ordering::AcqRel);
        debug_assert_eq!(prev, WRITER, "release_write without sole writer held");
    }

    /// Upgrade read -> write. Succeeds only if this is the sole reader
    /// (spec: "fails if any other threads are waiting/holding").
    pub fn attempt_upgrade(&self) -> bool {
        self.holders
            .compare_exchange(READER, WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Atomically downgrade write -> read.
    pub fn downgrade(&self) {
        let prev = self.holders.swap(READER, Ordering::AcqRel);
        debug_assert_eq!(prev, WRITER, "downgrade without sole writer held");
    }
}

#[inline]
fn backoff(spins: &mut u32) {
    *spins += 1;
    if *spins < 32 {
        for _ in 0..(*spins).min(16) {
            std::hint::spin_loop();
        }
    } else {
        std::thread::yield_now();
    }
}

/// RAII read guard, mirroring the original's `spinlock_read_critical_section`.
pub struct ReadGuard<'a> {
    latch: &'a RwSpinLatch,
}

impl<'a> ReadGuard<'a> {
    pub fn new(latch: &'a RwSpinLatch) -> Self {
        latch.acquire_read();
        ReadGuard { latch }
    }

    /// Wraps a read latch the caller has already acquired (e.g. via a
    /// raw `attempt_read`/`acquire_read` as part of a larger protocol
    /// step), so `Drop` still releases it exactly once.
    pub fn from_acquired(latch: &'a RwSpinLatch) -> Self {
        ReadGuard { latch }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.latch.release_read();
    }
}

/// RAII write guard, mirroring `spinlock_write_critical_section`.
pub struct WriteGuard<'a> {
    latch: &'a RwSpinLatch,
}

impl<'a> WriteGuard<'a> {
    pub fn new(latch: &'a RwSpinLatch) -> Self {
        latch.acquire_write();
        WriteGuard { latch }
    }

    /// Wraps a write latch the caller has already acquired.
    pub fn from_acquired(latch: &'a RwSpinLatch) -> Self {
        WriteGuard { latch }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.latch.release_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn readers_coexist_writer_excludes() {
        let latch = RwSpinLatch::new();
        assert!(latch.attempt_read());
        assert!(latch.attempt_read());
        assert!(!latch.attempt_write());
        latch.release_read();
        latch.release_read();
        assert!(latch.attempt_write());
        assert!(!latch.attempt_read());
        latch.release_write();
    }

    #[test]
    fn upgrade_succeeds_only_as_sole_reader() {
        let latch = RwSpinLatch::new();
        latch.acquire_read();
        assert!(latch.attempt_upgrade());
        latch.downgrade();
        latch.acquire_read();
        assert!(!latch.attempt_upgrade());
        latch.release_read();
        latch.release_read();
    }

    #[test]
    fn concurrent_readers_and_writers_stay_exclusive() {
        let latch = Arc::new(RwSpinLatch::new());
        let counter = Arc::new(AtomicU32::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let latch = latch.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    latch.acquire_write();
                    let before = counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(before % 1, 0);
                    latch.release_write();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1600);
    }
}
