// Cross-component integration tests for the storage engine core.
// Exercises XctManager + LockManager + BufferPool + LogManager + CheckpointManager
// together through their public APIs, rather than one component in isolation.
// Test ID format: ENGINE-XXX, matching spec.md §8's concrete scenarios.

use rusty_db::buffer::{BufferPool, FixMode, Fixed};
use rusty_db::checkpoint::CheckpointManager;
use rusty_db::common::{EngineConfig, PageId, PageTag};
use rusty_db::lock::{LockManager, Mode, OkvlMode};
use rusty_db::log::{Category, LogManager, RecordType};
use rusty_db::storage::Volume;
use rusty_db::xct::XctManager;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    _dir: tempfile::TempDir,
    log: Arc<LogManager>,
    lock_manager: Arc<LockManager>,
    buffer: Arc<BufferPool>,
    xct_manager: Arc<XctManager>,
    chkpt: Arc<CheckpointManager>,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = EngineConfig::default();
    cfg.log_dir = dir.path().join("log");
    cfg.log_partition_size = 1 << 20;
    cfg.buffer_pool_pages = 16;
    cfg.gc_segments_per_generation = 4;
    cfg.gc_segment_size = 64;
    cfg.okvl_partitions = 1;
    let cfg = Arc::new(cfg);

    let log = LogManager::open(&cfg).unwrap();
    let lock_manager = Arc::new(LockManager::new(cfg.clone()));
    let buffer = Arc::new(BufferPool::new(cfg.clone(), log.clone()));
    let volume = Volume::from_config(&cfg, dir.path().join("data.vol"), 1).unwrap();
    buffer.mount_volume(Arc::new(volume));
    let xct_manager = XctManager::new(cfg.clone(), log.clone(), lock_manager.clone());
    let chkpt = CheckpointManager::new(cfg, log.clone(), buffer.clone(), xct_manager.clone());

    Harness { _dir: dir, log, lock_manager, buffer, xct_manager, chkpt }
}

fn key_hash(name: &str) -> u64 {
    // Stand-in for the spec's string-key hashing (okvl_prefix_len /
    // okvl_uniquefier_len, spec §6); any stable hash works for these tests
    // since only equality between calls with the same name matters.
    name.bytes().fold(0u64, |acc, b| acc.wrapping_mul(131).wrapping_add(b as u64))
}

// ENGINE-001: a full xct lifecycle through XctManager's own API: begin,
// acquire a lock, fix a page, log an update, commit, and see the write
// survive into a checkpoint's dirty-page snapshot.
#[test]
fn engine_001_full_lifecycle_through_checkpoint() {
    let h = harness();
    let xct = h.xct_manager.begin();
    xct.acquire_lock(1, key_hash("row-1"), OkvlMode::key_only(Mode::X, 1)).unwrap();

    let page_id = PageId::new(1, 1, 1);
    let mut fixed = h.buffer.fix(page_id, FixMode::Exclusive, true, None).unwrap();
    let page = match &mut fixed {
        Fixed::Write(w) => w,
        _ => unreachable!(),
    };
    let rec = xct
        .get_logbuf(RecordType::Application, Category::UNDO | Category::REDO, page_id, PageTag::File)
        .with_payload(vec![7, 7, 7]);
    xct.give_logbuf(rec, page).unwrap();
    drop(fixed);
    assert_eq!(h.buffer.dirty_count(), 1);

    let commit_lsn = h.xct_manager.commit(&xct, false).unwrap();
    assert!(!commit_lsn.is_null());

    let master_lsn = h.chkpt.take().unwrap();
    assert!(!master_lsn.is_null());
    assert!(h.log.durable_lsn() >= master_lsn);
}

// ENGINE-002: abort rolls back the logged write and releases the lock so a
// second xct can immediately acquire the same key.
#[test]
fn engine_002_abort_releases_locks_for_next_xct() {
    let h = harness();
    let xct1 = h.xct_manager.begin();
    xct1.acquire_lock(1, key_hash("row-2"), OkvlMode::key_only(Mode::X, 1)).unwrap();

    let page_id = PageId::new(1, 1, 2);
    let mut fixed = h.buffer.fix(page_id, FixMode::Exclusive, true, None).unwrap();
    let page = match &mut fixed {
        Fixed::Write(w) => w,
        _ => unreachable!(),
    };
    let rec = xct1
        .get_logbuf(RecordType::Application, Category::UNDO, page_id, PageTag::File)
        .with_payload(vec![1]);
    xct1.give_logbuf(rec, page).unwrap();
    drop(fixed);

    h.xct_manager.abort(&xct1, false).unwrap();

    // Lock is free again: a second xct can take an exclusive lock on the
    // same key without blocking.
    let xct2 = h.xct_manager.begin();
    xct2.acquire_lock(1, key_hash("row-2"), OkvlMode::key_only(Mode::X, 1)).unwrap();
    h.xct_manager.commit(&xct2, false).unwrap();
}

// ENGINE-003 (spec §8 scenario 3, literal W/R/W triangle): T1 writes
// `aunq2`; T2 reads `aunq3` then waits on `aunq2`, then requests write on
// `aunq4`; T3 writes `aunq4` then waits on `aunq2`, then requests write on
// `aunq3`. After T1 commits, exactly one of {T2, T3} is victimized with a
// deadlock error; the other commits.
#[test]
fn engine_003_three_way_deadlock_triangle() {
    let h = harness();
    let store = 1u32;
    let h_aunq2 = key_hash("aunq2");
    let h_aunq3 = key_hash("aunq3");
    let h_aunq4 = key_hash("aunq4");

    let t1 = h.xct_manager.begin();
    t1.acquire_lock(store, h_aunq2, OkvlMode::key_only(Mode::X, 1)).unwrap();

    let t2 = h.xct_manager.begin();
    t2.acquire_lock(store, h_aunq3, OkvlMode::key_only(Mode::S, 1)).unwrap();

    let t3 = h.xct_manager.begin();
    t3.acquire_lock(store, h_aunq4, OkvlMode::key_only(Mode::X, 1)).unwrap();

    let t2_thread = {
        let t2 = t2.clone();
        std::thread::spawn(move || {
            t2.acquire_lock(store, h_aunq2, OkvlMode::key_only(Mode::X, 1))?;
            t2.acquire_lock(store, h_aunq4, OkvlMode::key_only(Mode::X, 1))
        })
    };
    std::thread::sleep(Duration::from_millis(20));

    let t3_thread = {
        let t3 = t3.clone();
        std::thread::spawn(move || {
            t3.acquire_lock(store, h_aunq2, OkvlMode::key_only(Mode::X, 1))?;
            t3.acquire_lock(store, h_aunq3, OkvlMode::key_only(Mode::X, 1))
        })
    };
    std::thread::sleep(Duration::from_millis(20));

    h.xct_manager.commit(&t1, false).unwrap();

    let r2 = t2_thread.join().unwrap();
    let r3 = t3_thread.join().unwrap();
    let failures = [&r2, &r3].iter().filter(|r| r.is_err()).count();
    assert_eq!(failures, 1, "exactly one of {{T2, T3}} must be the deadlock victim");

    if r2.is_ok() {
        h.xct_manager.commit(&t2, false).unwrap();
        h.xct_manager.abort(&t3, false).unwrap();
    } else {
        h.xct_manager.commit(&t3, false).unwrap();
        h.xct_manager.abort(&t2, false).unwrap();
    }
}

// ENGINE-004 (spec §8 scenario 4): T1 writes P and commits under `elr_sx`,
// tagging the lock queue with its commit LSN. T2, a read-only xct that
// observed that tag, must flush the log through T1's commit LSN before its
// own commit can return.
#[test]
fn engine_004_elr_reader_flushes_through_writer_commit() {
    let h = harness();
    let key = key_hash("shared-row");

    let t1 = h.xct_manager.begin();
    t1.acquire_lock(1, key, OkvlMode::key_only(Mode::X, 1)).unwrap();
    let page_id = PageId::new(1, 1, 5);
    let mut fixed = h.buffer.fix(page_id, FixMode::Exclusive, true, None).unwrap();
    let page = match &mut fixed {
        Fixed::Write(w) => w,
        _ => unreachable!(),
    };
    let rec = t1.get_logbuf(RecordType::Application, Category::REDO, page_id, PageTag::File);
    t1.give_logbuf(rec, page).unwrap();
    drop(fixed);
    let t1_commit_lsn = h.xct_manager.commit(&t1, false).unwrap();

    let t2 = h.xct_manager.begin();
    t2.acquire_lock(1, key, OkvlMode::key_only(Mode::S, 1)).unwrap();
    assert!(t2.read_watermark() >= t1_commit_lsn);

    let t2_commit_lsn = h.xct_manager.commit(&t2, false).unwrap();
    assert!(!t2_commit_lsn.is_null());
    assert!(h.log.durable_lsn() >= t1_commit_lsn);
}

// ENGINE-005 (spec §8 scenario 6): a write-order-dependency cycle is
// rejected and leaves the dependency graph unchanged. Three distinct pages
// fixed for the first time against a fresh pool land on frames 0, 1, 2 in
// order (same assumption the buffer pool's own unit tests make).
#[test]
fn engine_005_write_order_cycle_rejected() {
    let h = harness();
    for page_no in [10u32, 11, 12] {
        let fixed = h.buffer.fix(PageId::new(1, 1, page_no), FixMode::Exclusive, true, None).unwrap();
        h.buffer.unfix(fixed, false, false);
    }

    h.buffer.register_write_order_dependency(1, 0).unwrap();
    h.buffer.register_write_order_dependency(2, 1).unwrap();
    let err = h.buffer.register_write_order_dependency(0, 2);
    assert!(err.is_err());
}

// ENGINE-006: two back-to-back checkpoints with no intervening activity
// leave a strictly later master LSN but report the same min_rec_lsn
// watermark (spec §8 "Checkpoint idempotence").
#[test]
fn engine_006_checkpoint_idempotence() {
    let h = harness();
    let lsn1 = h.chkpt.take().unwrap();
    let min1 = h.buffer.min_rec_lsn();
    let lsn2 = h.chkpt.take().unwrap();
    let min2 = h.buffer.min_rec_lsn();
    assert!(lsn2 > lsn1);
    assert_eq!(min1, min2);
    let _ = h.lock_manager;
}
