//! Benchmark for `PersistentTreeMap` vs standard `BTreeMap`.
//!
//! Compares the persistent map against Rust's standard `BTreeMap` for
//! common operations. The comparison is indicative only: the standard map
//! mutates in place, while every persistent operation produces a new
//! version.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use persimap::PersistentTreeMap;
use std::collections::BTreeMap;

// =============================================================================
// insert Benchmark
// =============================================================================

fn benchmark_insert(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("insert");

    for size in [100, 1000, 10000] {
        group.bench_with_input(
            BenchmarkId::new("PersistentTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = PersistentTreeMap::new();
                    for index in 0..size {
                        map = map.insert(black_box(index), black_box(index * 2));
                    }
                    black_box(map)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("BTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = BTreeMap::new();
                    for index in 0..size {
                        map.insert(black_box(index), black_box(index * 2));
                    }
                    black_box(map)
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// get Benchmark
// =============================================================================

fn benchmark_get(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("get");

    for size in [100, 1000, 10000] {
        let persistent_map: PersistentTreeMap<i32, i32> =
            (0..size).map(|index| (index, index * 2)).collect();
        let standard_map: BTreeMap<i32, i32> = (0..size).map(|index| (index, index * 2)).collect();

        group.bench_with_input(
            BenchmarkId::new("PersistentTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut sum = 0;
                    for key in 0..size {
                        if let Some(&value) = persistent_map.get(&black_box(key)) {
                            sum += value;
                        }
                    }
                    black_box(sum)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("BTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut sum = 0;
                    for key in 0..size {
                        if let Some(&value) = standard_map.get(&black_box(key)) {
                            sum += value;
                        }
                    }
                    black_box(sum)
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// erase Benchmark
// =============================================================================

fn benchmark_erase(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("erase");

    for size in [100, 1000, 10000] {
        let persistent_map: PersistentTreeMap<i32, i32> =
            (0..size).map(|index| (index, index * 2)).collect();
        let standard_map: BTreeMap<i32, i32> = (0..size).map(|index| (index, index * 2)).collect();

        group.bench_with_input(
            BenchmarkId::new("PersistentTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = persistent_map.clone();
                    for key in 0..size {
                        map = map.erase(&black_box(key));
                    }
                    black_box(map)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("BTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut map = standard_map.clone();
                    for key in 0..size {
                        map.remove(&black_box(key));
                    }
                    black_box(map)
                });
            },
        );
    }

    group.finish();
}

// =============================================================================
// iterate Benchmark
// =============================================================================

fn benchmark_iterate(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("iterate");

    for size in [100, 1000, 10000] {
        let persistent_map: PersistentTreeMap<i32, i32> =
            (0..size).map(|index| (index, index * 2)).collect();
        let standard_map: BTreeMap<i32, i32> = (0..size).map(|index| (index, index * 2)).collect();

        group.bench_with_input(
            BenchmarkId::new("PersistentTreeMap", size),
            &size,
            |bencher, _| {
                bencher.iter(|| {
                    let sum: i64 = persistent_map.values().map(|&value| i64::from(value)).sum();
                    black_box(sum)
                });
            },
        );

        group.bench_with_input(BenchmarkId::new("BTreeMap", size), &size, |bencher, _| {
            bencher.iter(|| {
                let sum: i64 = standard_map.values().map(|&value| i64::from(value)).sum();
                black_box(sum)
            });
        });
    }

    group.finish();
}

// =============================================================================
// version snapshot Benchmark
// =============================================================================

fn benchmark_snapshot(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("snapshot_per_insert");

    for size in [100, 1000] {
        // Keeping every intermediate version alive is where structural
        // sharing pays off against full copies.
        group.bench_with_input(
            BenchmarkId::new("PersistentTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut versions = Vec::with_capacity(size as usize);
                    let mut map = PersistentTreeMap::new();
                    for index in 0..size {
                        map = map.insert(black_box(index), black_box(index));
                        versions.push(map.clone());
                    }
                    black_box(versions)
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("BTreeMap", size),
            &size,
            |bencher, &size| {
                bencher.iter(|| {
                    let mut versions = Vec::with_capacity(size as usize);
                    let mut map = BTreeMap::new();
                    for index in 0..size {
                        map.insert(black_box(index), black_box(index));
                        versions.push(map.clone());
                    }
                    black_box(versions)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_insert,
    benchmark_get,
    benchmark_erase,
    benchmark_iterate,
    benchmark_snapshot
);
criterion_main!(benches);
