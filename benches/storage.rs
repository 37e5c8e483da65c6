//! Storage adapter benchmarks.

use attribution_sdk::storage::{KeyValueAdapter, MemoryKv, StructuredAdapter};
use attribution_sdk::{StorageAdapter, StorageRecord, StoreName};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tempfile::TempDir;

fn queue_record(created_at: i64) -> StorageRecord {
    StorageRecord::new(
        StoreName::Queue,
        json!({
            "created_at": created_at,
            "url": "/event",
            "method": "POST",
            "params": {"event_token": "abc123", "revenue": 1.5},
            "retry_count": 0
        }),
    )
    .unwrap()
}

/// Reading a queue back from a log with varying compaction intervals
fn bench_log_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_replay");

    for compact_after in [16, 256, 4096] {
        group.bench_with_input(
            BenchmarkId::new("compact_after", compact_after),
            &compact_after,
            |b, &compact_after| {
                let dir = TempDir::new().unwrap();
                let adapter = StructuredAdapter::open(dir.path(), usize::MAX, compact_after).unwrap();

                // Push and deliver, leaving a short tail like a live queue
                for i in 0..1000 {
                    adapter.put(queue_record(i)).unwrap();
                    if i >= 10 {
                        adapter
                            .delete(StoreName::Queue, &(i - 10).into())
                            .unwrap();
                    }
                }

                b.iter(|| {
                    // A fresh handle replays the whole log
                    let reopened =
                        StructuredAdapter::open(dir.path(), usize::MAX, compact_after).unwrap();
                    black_box(reopened.get_all(StoreName::Queue).unwrap());
                });
            },
        );
    }

    group.finish();
}

fn bench_structured_put(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let adapter = StructuredAdapter::open(dir.path(), usize::MAX, 256).unwrap();
    let mut key = 0;

    c.bench_function("structured_put", |b| {
        b.iter(|| {
            key += 1;
            adapter.put(black_box(queue_record(key))).unwrap();
        });
    });
}

/// Whole-collection rewrite cost grows with the store
fn bench_key_value_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_value_put");

    for existing in [10, 100, 1000] {
        group.bench_with_input(
            BenchmarkId::new("existing", existing),
            &existing,
            |b, &existing| {
                let adapter = KeyValueAdapter::new(MemoryKv::new(), usize::MAX);
                for i in 0..existing {
                    adapter.put(queue_record(i)).unwrap();
                }
                let mut key = existing;

                b.iter(|| {
                    key += 1;
                    adapter.put(black_box(queue_record(key))).unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_log_replay,
    bench_structured_put,
    bench_key_value_put
);
criterion_main!(benches);
