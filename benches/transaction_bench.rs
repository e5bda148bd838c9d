// Transaction context performance benchmarks: begin/commit lifecycle,
// OKVL lock acquisition across modes, concurrent xct throughput, and
// Dreadlocks deadlock detection under circular waits (spec §4.5, §4.8).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusty_db::common::EngineConfig;
use rusty_db::lock::{LockManager, Mode, OkvlMode};
use rusty_db::log::LogManager;
use rusty_db::xct::XctManager;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn create_manager() -> (Arc<XctManager>, Arc<LockManager>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.log_dir = temp_dir.path().join("log");
    config.log_partition_size = 1 << 20;
    config.okvl_partitions = 4;
    let config = Arc::new(config);

    let log = LogManager::open(&config).unwrap();
    let lock_manager = Arc::new(LockManager::new(config.clone()));
    let xct_manager = XctManager::new(config, log, lock_manager.clone());
    (xct_manager, lock_manager, temp_dir)
}

fn bench_begin_commit(c: &mut Criterion) {
    let (manager, _lock_manager, _temp) = create_manager();

    c.bench_function("begin_commit", |b| {
        b.iter(|| {
            let xct = manager.begin();
            black_box(xct.tid());
            manager.commit(&xct, false).ok();
        });
    });
}

fn bench_lock_acquisition(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_acquisition");

    let modes = vec![Mode::S, Mode::X, Mode::IS, Mode::IX];

    for mode in modes {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{:?}", mode)),
            &mode,
            |b, &mode| {
                let (manager, lock_manager, _temp) = create_manager();
                let mut counter = 0u64;
                b.iter(|| {
                    let xct = manager.begin();
                    counter += 1;
                    let okvl = OkvlMode::key_only(mode, 1);
                    lock_manager
                        .acquire(xct.tid(), 1, counter, okvl)
                        .ok();
                    lock_manager.release_all(xct.tid(), None, rusty_db::common::ElrMode::None);
                    manager.commit(&xct, false).ok();
                });
            },
        );
    }

    group.finish();
}

fn bench_concurrent_transactions(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_transactions");

    for num_threads in [1usize, 2, 4, 8, 16] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            &num_threads,
            |b, &num_threads| {
                let (manager, _lock_manager, _temp) = create_manager();

                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let manager = manager.clone();
                            std::thread::spawn(move || {
                                for _ in 0..10 {
                                    let xct = manager.begin();
                                    manager.commit(&xct, false).ok();
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        handle.join().ok();
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_lock_contention(c: &mut Criterion) {
    let (manager, lock_manager, _temp) = create_manager();

    c.bench_function("lock_contention_same_key", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let manager = manager.clone();
                    let lock_manager = lock_manager.clone();
                    std::thread::spawn(move || {
                        for _ in 0..10 {
                            let xct = manager.begin();
                            let okvl = OkvlMode::key_only(Mode::X, 1);
                            // Hotspot: every thread targets the same
                            // (store, key) pair, forcing serialization
                            // through the queue's FIFO wait path.
                            if lock_manager.acquire(xct.tid(), 7, 1, okvl).is_ok() {
                                lock_manager.release_all(xct.tid(), None, rusty_db::common::ElrMode::None);
                            }
                            manager.commit(&xct, false).ok();
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().ok();
            }
        });
    });
}

fn bench_deadlock_detection(c: &mut Criterion) {
    let (manager, lock_manager, _temp) = create_manager();

    c.bench_function("deadlock_detection", |b| {
        b.iter(|| {
            let xct1 = manager.begin();
            let xct2 = manager.begin();

            lock_manager
                .acquire(xct1.tid(), 1, 100, OkvlMode::key_only(Mode::X, 1))
                .ok();
            lock_manager
                .acquire(xct2.tid(), 1, 200, OkvlMode::key_only(Mode::X, 1))
                .ok();

            let lm2 = lock_manager.clone();
            let t2_tid = xct2.tid();
            let waiter = std::thread::spawn(move || {
                lm2.acquire(t2_tid, 1, 100, OkvlMode::key_only(Mode::X, 1))
            });

            std::thread::sleep(Duration::from_millis(5));
            let _ = lock_manager.acquire(xct1.tid(), 1, 200, OkvlMode::key_only(Mode::X, 1));

            waiter.join().ok();

            lock_manager.release_all(xct1.tid(), None, rusty_db::common::ElrMode::None);
            lock_manager.release_all(xct2.tid(), None, rusty_db::common::ElrMode::None);
            manager.commit(&xct1, false).ok();
            manager.commit(&xct2, false).ok();
        });
    });
}

criterion_group!(
    benches,
    bench_begin_commit,
    bench_lock_acquisition,
    bench_concurrent_transactions,
    bench_lock_contention,
    bench_deadlock_detection
);
criterion_main!(benches);
