//! Basic benchmarks for the `paged_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use paged_pool::{HeaderKind, PagedPool};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const OBJECT_SIZE: usize = 64;

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("pool_basic");

    group.bench_function("allocate_free_cycle", |b| {
        let mut pool = PagedPool::builder()
            .object_size(OBJECT_SIZE)
            .build()
            .unwrap();

        b.iter(|| {
            let payload = black_box(pool.allocate(None).unwrap());

            // SAFETY: the payload came from this pool and is freed exactly once.
            unsafe { pool.free(payload).unwrap() };
        });
    });

    group.bench_function("allocate_free_cycle_debug", |b| {
        let mut pool = PagedPool::builder()
            .object_size(OBJECT_SIZE)
            .pad_bytes(4)
            .header(HeaderKind::Basic)
            .debug(true)
            .build()
            .unwrap();

        b.iter(|| {
            let payload = black_box(pool.allocate(None).unwrap());

            // SAFETY: the payload came from this pool and is freed exactly once.
            unsafe { pool.free(payload).unwrap() };
        });
    });

    group.bench_function("allocate_free_cycle_passthrough", |b| {
        let mut pool = PagedPool::builder()
            .object_size(OBJECT_SIZE)
            .passthrough(true)
            .build()
            .unwrap();

        b.iter(|| {
            let payload = black_box(pool.allocate(None).unwrap());

            // SAFETY: the payload came from this pool and is freed exactly once.
            unsafe { pool.free(payload).unwrap() };
        });
    });

    group.bench_function("fill_and_drain_page", |b| {
        let mut pool = PagedPool::builder()
            .object_size(OBJECT_SIZE)
            .build()
            .unwrap();

        let per_page = pool.config().objects_per_page().get();
        let mut held = Vec::with_capacity(per_page);

        b.iter(|| {
            for _ in 0..per_page {
                held.push(pool.allocate(None).unwrap());
            }
            for payload in held.drain(..) {
                // SAFETY: each payload came from this pool and is freed exactly once.
                unsafe { pool.free(payload).unwrap() };
            }
        });
    });

    group.finish();
}
