// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Benchmarks for the partition hot paths: indexer lookups and read-cache
//! checks dominate the per-request cost.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use cesiumkv::partition::indexer::Indexer;
use cesiumkv::partition::read_cache::ReadCache;
use cesiumkv::txn::{arbitrate, Mtr, Priority};
use cesiumkv::{FieldValue, Key, Record, Timestamp};

fn key(i: u64) -> Key {
    Key::new("bench", format!("pk{i:08}"), "")
}

fn record(i: u64) -> Record {
    Record {
        schema_name: "bench".to_string(),
        schema_version: 1,
        fields: vec![
            Some(FieldValue::String(format!("pk{i:08}"))),
            Some(FieldValue::Int64(i as i64)),
        ],
    }
}

fn bench_indexer_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("indexer");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert_committed", |b| {
        let mut idx = Indexer::new();
        let mut ts = 0u64;
        b.iter(|| {
            ts += 1;
            idx.insert_committed(key(ts % 1024), Timestamp::from_nanos(ts), Some(record(ts)))
                .unwrap();
        })
    });

    group.bench_function("get_version", |b| {
        let mut idx = Indexer::new();
        for ts in 1..=8u64 {
            for i in 0..1024u64 {
                idx.insert_committed(
                    key(i),
                    Timestamp::from_nanos(ts * 10_000 + i),
                    Some(record(i)),
                )
                .unwrap();
            }
        }
        let probe = key(512);
        let read_ts = Timestamp::from_nanos(50_000);
        b.iter(|| black_box(idx.get_version_not_newer_than(&probe, &read_ts)))
    });

    group.finish();
}

fn bench_read_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_cache");
    group.throughput(Throughput::Elements(1));

    group.bench_function("mark_and_check", |b| {
        let mut cache = ReadCache::new(1024, Timestamp::ZERO);
        let mut ts = 0u64;
        b.iter(|| {
            ts += 1;
            let k = key(ts % 2048);
            cache.mark_key(&k, Timestamp::from_nanos(ts));
            black_box(cache.check_key(&k))
        })
    });

    group.finish();
}

fn bench_push_arbitration(c: &mut Criterion) {
    let challenger = Mtr::new(Timestamp::from_nanos(80), Priority::MEDIUM, 7);
    let incumbent = Mtr::new(Timestamp::from_nanos(100), Priority::MEDIUM, 9);

    c.bench_function("push::arbitrate", |b| {
        b.iter(|| black_box(arbitrate(&challenger, &incumbent)))
    });
}

criterion_group!(
    benches,
    bench_indexer_insert,
    bench_read_cache,
    bench_push_arbitration
);
criterion_main!(benches);
