// Buffer pool performance benchmarks: page fix/unfix, clock-replacement
// eviction under pool pressure, and concurrent access patterns (spec
// §4.6, C6).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusty_db::buffer::{BufferPool, Fixed, FixMode};
use rusty_db::common::{EngineConfig, PageId, PageTag};
use rusty_db::log::LogManager;
use rusty_db::storage::Volume;
use std::sync::Arc;
use tempfile::TempDir;

fn create_buffer_pool(num_frames: usize) -> (Arc<BufferPool>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.buffer_pool_pages = num_frames;
    config.log_dir = temp_dir.path().join("log");
    config.log_partition_size = 1 << 20;
    let config = Arc::new(config);

    let log = LogManager::open(&config).unwrap();
    let pool = Arc::new(BufferPool::new(config.clone(), log));
    let volume = Volume::from_config(&config, temp_dir.path().join("data.vol"), 1).unwrap();
    pool.mount_volume(Arc::new(volume));
    (pool, temp_dir)
}

fn bench_page_fix_unfix(c: &mut Criterion) {
    let (pool, _temp) = create_buffer_pool(1000);
    c.bench_function("fix_unfix", |b| {
        b.iter(|| {
            let page_id = PageId::new(1, 1, 1);
            if let Ok(fixed) = pool.fix(black_box(page_id), FixMode::Shared, false, None) {
                pool.unfix(fixed, false, true);
            }
        });
    });
}

fn bench_eviction_under_pressure(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction_under_pressure");

    for num_frames in [64usize, 256, 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_frames),
            &num_frames,
            |b, &num_frames| {
                let (pool, _temp) = create_buffer_pool(num_frames);
                b.iter(|| {
                    // Touch more distinct pages than frames to force the
                    // clock hand to evict on every iteration.
                    for page in 0..(num_frames as u32 * 2) {
                        let page_id = PageId::new(1, 1, page);
                        if let Ok(fixed) = pool.fix(black_box(page_id), FixMode::Shared, true, None) {
                            pool.unfix(fixed, false, true);
                        }
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_concurrent_fix(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_fix");

    for num_threads in [1usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            &num_threads,
            |b, &num_threads| {
                let (pool, _temp) = create_buffer_pool(1000);
                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|i| {
                            let pool = pool.clone();
                            std::thread::spawn(move || {
                                for j in 0..10u32 {
                                    let page_id = PageId::new(1, 1, (i as u32) * 10 + j);
                                    if let Ok(fixed) = pool.fix(page_id, FixMode::Shared, true, None) {
                                        pool.unfix(fixed, false, true);
                                    }
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

fn bench_dirty_and_force(c: &mut Criterion) {
    let (pool, _temp) = create_buffer_pool(1000);

    c.bench_function("dirty_and_force_all", |b| {
        b.iter(|| {
            for page in 0..64u32 {
                let page_id = PageId::new(1, 1, page);
                if let Ok(fixed) = pool.fix(page_id, FixMode::Exclusive, true, None) {
                    black_box(fixed.page().page_id());
                    pool.unfix(fixed, true, true);
                }
            }
            pool.force_all().unwrap();
        });
    });
}

fn bench_page_table_lookup(c: &mut Criterion) {
    let (pool, _temp) = create_buffer_pool(10_000);

    for page in 0..5000u32 {
        let page_id = PageId::new(1, 1, page);
        if let Ok(fixed) = pool.fix(page_id, FixMode::Shared, true, None) {
            pool.unfix(fixed, false, false);
        }
    }

    c.bench_function("page_table_lookup", |b| {
        b.iter(|| {
            for page in (0..5000u32).step_by(100) {
                let page_id = PageId::new(1, 1, page);
                if let Ok(fixed) = pool.fix(black_box(page_id), FixMode::Shared, false, None) {
                    match &fixed {
                        Fixed::Read(g) => black_box(g.page_id()),
                        Fixed::Write(g) => black_box(g.page_id()),
                    };
                    pool.unfix(fixed, false, false);
                }
            }
        });
    });
}

criterion_group!(
    benches,
    bench_page_fix_unfix,
    bench_eviction_under_pressure,
    bench_concurrent_fix,
    bench_dirty_and_force,
    bench_page_table_lookup
);
criterion_main!(benches);
