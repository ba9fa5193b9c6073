//! Micro-benchmarks for tree operations

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use gbptree::{GbpTree, LongLayout, TreeBuilder};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

const PAGE_SIZE: usize = 8192;

fn populated(count: u64) -> (GbpTree<LongLayout>, TempDir) {
    let dir = TempDir::new().unwrap();
    let tree = GbpTree::open_or_create(dir.path().join("bench.db"), LongLayout::new(), PAGE_SIZE).unwrap();
    let mut writer = tree.writer().unwrap();
    for key in 0..count {
        writer.put(&key, &key).unwrap();
    }
    writer.close().unwrap();
    tree.checkpoint().unwrap();
    (tree, dir)
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");

    for size in [1_000u64, 10_000] {
        group.bench_with_input(BenchmarkId::new("sequential", size), &size, |b, &size| {
            b.iter_batched(
                || TreeBuilder::new(LongLayout::new()).page_size(PAGE_SIZE).open_in_memory().unwrap(),
                |tree| {
                    let mut writer = tree.writer().unwrap();
                    for key in 0..size {
                        writer.put(&key, &key).unwrap();
                    }
                    writer.close().unwrap();
                },
                BatchSize::SmallInput,
            );
        });

        group.bench_with_input(BenchmarkId::new("random", size), &size, |b, &size| {
            let mut rng = StdRng::seed_from_u64(size);
            let keys: Vec<u64> = (0..size).map(|_| rng.gen()).collect();
            b.iter_batched(
                || TreeBuilder::new(LongLayout::new()).page_size(PAGE_SIZE).open_in_memory().unwrap(),
                |tree| {
                    let mut writer = tree.writer().unwrap();
                    for key in &keys {
                        writer.put(key, key).unwrap();
                    }
                    writer.close().unwrap();
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let (tree, _dir) = populated(100_000);
    let mut rng = StdRng::seed_from_u64(1);

    c.bench_function("get_random", |b| {
        b.iter(|| {
            let key = rng.gen_range(0..100_000u64);
            black_box(tree.get(&key).unwrap());
        });
    });
}

fn bench_seek(c: &mut Criterion) {
    let (tree, _dir) = populated(100_000);
    let mut group = c.benchmark_group("seek");

    for len in [10u64, 1_000] {
        group.bench_with_input(BenchmarkId::new("forward", len), &len, |b, &len| {
            b.iter(|| {
                let count = tree.seek(50_000, 50_000 + len).unwrap().count();
                black_box(count);
            });
        });
        group.bench_with_input(BenchmarkId::new("backward", len), &len, |b, &len| {
            b.iter(|| {
                let count = tree.seek(50_000 + len, 50_000).unwrap().count();
                black_box(count);
            });
        });
    }

    group.finish();
}

fn bench_checkpoint(c: &mut Criterion) {
    let (tree, _dir) = populated(10_000);
    let mut round = 0u64;

    c.bench_function("checkpoint_after_100_updates", |b| {
        b.iter(|| {
            round += 1;
            let mut writer = tree.writer().unwrap();
            for key in (round % 100..10_000).step_by(100) {
                writer.put(&key, &round).unwrap();
            }
            writer.close().unwrap();
            tree.checkpoint().unwrap();
        });
    });
}

criterion_group!(benches, bench_insert, bench_get, bench_seek, bench_checkpoint);
criterion_main!(benches);
