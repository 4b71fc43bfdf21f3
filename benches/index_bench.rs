//! Benchmarks for the index store
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use storyshot::index::{
    CleanupOptions, IndexFormat, IndexStoreConfig, Reconciler, ResultMetrics, ResultStatus, ResultsIndex,
    SnapshotIndex,
};
use tempfile::tempdir;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("button--variant-{}", i)).collect()
}

fn bench_get_or_create(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("get_or_create_id");

    for size in [100, 1000] {
        let keys = keys(size);
        group.throughput(Throughput::Elements(size as u64));

        group.bench_with_input(BenchmarkId::new("insert", size), &keys, |b, keys| {
            b.iter(|| {
                rt.block_on(async {
                    let dir = tempdir().unwrap();
                    let store = SnapshotIndex::open(dir.path(), IndexStoreConfig::snapshots()).await.unwrap();
                    for key in keys {
                        black_box(store.get_or_create_id(key, None, None).await);
                    }
                })
            })
        });

        let dir = tempdir().unwrap();
        let store = rt.block_on(async {
            let store = SnapshotIndex::open(dir.path(), IndexStoreConfig::snapshots()).await.unwrap();
            for key in &keys {
                store.get_or_create_id(key, Some("chromium"), Some("desktop")).await;
            }
            store
        });

        group.bench_with_input(BenchmarkId::new("lookup", size), &keys, |b, keys| {
            b.iter(|| {
                rt.block_on(async {
                    for key in keys {
                        black_box(store.get_or_create_id(key, Some("chromium"), Some("desktop")).await);
                    }
                })
            })
        });
    }

    group.finish();
}

fn bench_flush(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("flush");

    for format in [IndexFormat::Json, IndexFormat::Jsonl] {
        let dir = tempdir().unwrap();
        let config = IndexStoreConfig::results().format(format);
        let store = rt.block_on(async {
            let store = ResultsIndex::open(dir.path(), config).await.unwrap();
            for (i, key) in keys(1000).iter().enumerate() {
                let id = format!("{:032x}", i);
                store
                    .set_entry(key, &id, ResultStatus::Failed, ResultMetrics::default())
                    .await;
            }
            store
        });

        group.bench_function(format!("{:?}_1000", format).to_lowercase(), |b| {
            b.iter(|| rt.block_on(async { store.flush().await.unwrap() }))
        });
    }

    group.finish();
}

fn bench_reconcile(c: &mut Criterion) {
    let rt = runtime();

    c.bench_function("reconcile_orphans_1000", |b| {
        b.iter(|| {
            rt.block_on(async {
                let dir = tempdir().unwrap();
                let store = Arc::new(SnapshotIndex::open(dir.path(), IndexStoreConfig::snapshots()).await.unwrap());
                for key in keys(1000) {
                    store.get_or_create_id(&key, None, None).await;
                }
                let options = CleanupOptions {
                    orphans: true,
                    ..Default::default()
                };
                black_box(Reconciler::new(store).run(options, None).await)
            })
        })
    });
}

criterion_group!(benches, bench_get_or_create, bench_flush, bench_reconcile);
criterion_main!(benches);
