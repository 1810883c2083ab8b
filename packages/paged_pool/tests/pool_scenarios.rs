//! End-to-end scenarios exercising the public pool surface: construction,
//! growth, the page cap, corruption and double-free detection, and
//! empty-page reclamation.

#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]

use std::ptr::NonNull;

use new_zealand::nz;
use paged_pool::{HeaderKind, PagedPool, PoolError};

/// Four 8-byte payloads per page, no header, no pads, no alignment.
fn scenario_pool() -> PagedPool {
    PagedPool::builder()
        .object_size(8)
        .debug(true)
        .build()
        .unwrap()
}

fn within_page(pool: &PagedPool, page_base: NonNull<u8>, payload: NonNull<u8>) -> bool {
    let base = page_base.as_ptr() as usize;
    let address = payload.as_ptr() as usize;
    address >= base && address < base + pool.geometry().page_size()
}

#[test]
fn construction_creates_one_populated_page() {
    let pool = scenario_pool();
    let stats = pool.stats();

    assert_eq!(stats.pages_in_use, 1);
    assert_eq!(stats.free_objects, 4);
    assert_eq!(stats.objects_in_use, 0);
    assert_eq!(stats.object_size, 8);
    assert!(pool.page_list().is_some());
    assert!(pool.free_list().is_some());
}

#[test]
fn first_page_serves_four_blocks_then_a_second_page_grows() {
    let mut pool = scenario_pool();
    let first_page = pool.page_list().unwrap();

    let mut held = Vec::new();
    for _ in 0..4 {
        held.push(pool.allocate(None).unwrap());
    }

    // Pairwise distinct, all within the first page.
    for (i, a) in held.iter().enumerate() {
        assert!(within_page(&pool, first_page, *a));
        for b in held.iter().skip(i + 1) {
            assert_ne!(a, b);
        }
    }
    assert_eq!(pool.stats().pages_in_use, 1);

    let fifth = pool.allocate(None).unwrap();
    assert_eq!(pool.stats().pages_in_use, 2);
    assert!(!within_page(&pool, first_page, fifth));
}

#[test]
fn page_cap_rejects_the_fifth_allocation() {
    let mut pool = PagedPool::builder()
        .object_size(8)
        .max_pages(nz!(1))
        .debug(true)
        .build()
        .unwrap();

    for _ in 0..4 {
        _ = pool.allocate(None).unwrap();
    }

    let error = pool.allocate(None).unwrap_err();
    assert!(matches!(error, PoolError::NoPages { .. }));
}

#[test]
fn corrupted_left_pad_fails_the_free() {
    let mut pool = PagedPool::builder()
        .object_size(8)
        .pad_bytes(2)
        .debug(true)
        .build()
        .unwrap();

    let payload = pool.allocate(None).unwrap();

    // Both pads were painted two bytes wide around every payload.
    unsafe {
        for offset in 1..=2 {
            assert_eq!(
                payload.byte_sub(offset).read(),
                paged_pool::PAD_PATTERN
            );
            assert_eq!(
                payload.byte_add(7 + offset).read(),
                paged_pool::PAD_PATTERN
            );
        }
    }

    // One overwritten pad byte is enough to fail the free.
    unsafe { payload.byte_sub(2).write(0x00) };
    let error = unsafe { pool.free(payload) }.unwrap_err();
    assert!(matches!(error, PoolError::CorruptedBlock { .. }));
}

#[test]
fn double_free_is_rejected_on_the_second_call() {
    let mut pool = scenario_pool();

    let payload = pool.allocate(None).unwrap();
    unsafe { pool.free(payload).unwrap() };

    let error = unsafe { pool.free(payload) }.unwrap_err();
    assert!(matches!(error, PoolError::MultipleFree { .. }));
}

#[test]
fn reclaiming_releases_the_fully_free_page_and_its_free_list_nodes() {
    let mut pool = scenario_pool();

    let mut first_page = Vec::new();
    for _ in 0..4 {
        first_page.push(pool.allocate(None).unwrap());
    }

    let mut second_page = Vec::new();
    for _ in 0..4 {
        second_page.push(pool.allocate(None).unwrap());
    }
    assert_eq!(pool.stats().pages_in_use, 2);

    // Only the second page's blocks come back.
    for payload in second_page {
        unsafe { pool.free(payload).unwrap() };
    }
    assert_eq!(pool.stats().free_objects, 4);

    assert_eq!(pool.free_empty_pages(), 1);

    let stats = pool.stats();
    assert_eq!(stats.pages_in_use, 1);
    assert_eq!(stats.free_objects, 0);
    assert!(pool.free_list().is_none());
}

#[test]
fn allocate_free_round_trip_restores_the_counters() {
    let mut pool = scenario_pool();
    _ = pool.allocate(None).unwrap();

    let before = pool.stats();

    let payload = pool.allocate(None).unwrap();
    unsafe { pool.free(payload).unwrap() };

    let after = pool.stats();
    assert_eq!(
        after.allocations - before.allocations,
        after.deallocations - before.deallocations
    );
    assert_eq!(after.free_objects, before.free_objects);
    assert_eq!(after.objects_in_use, before.objects_in_use);
}

#[test]
fn freed_block_is_reused_first() {
    let mut pool = scenario_pool();

    let first = pool.allocate(None).unwrap();
    unsafe { pool.free(first).unwrap() };
    let second = pool.allocate(None).unwrap();

    assert_eq!(first, second);
}

#[test]
fn allocation_numbers_increase_strictly_across_reuse() {
    let mut pool = PagedPool::builder()
        .object_size(8)
        .header(HeaderKind::Basic)
        .debug(true)
        .build()
        .unwrap();

    let header_width = pool.geometry().header_width();
    let alloc_num = |payload: NonNull<u8>| unsafe {
        payload.byte_sub(header_width).cast::<u32>().read_unaligned()
    };

    let mut last = 0;
    for round in 0..6 {
        let payload = pool.allocate(None).unwrap();
        let number = alloc_num(payload);
        assert!(number > last, "round {round}: {number} vs {last}");
        last = number;

        unsafe { pool.free(payload).unwrap() };
    }
}

#[test]
fn counters_balance_over_interleaved_traffic() {
    let mut pool = PagedPool::builder()
        .object_size(8)
        .objects_per_page(nz!(4))
        .debug(true)
        .build()
        .unwrap();

    let mut held = Vec::new();
    for step in 0_usize..40 {
        if step % 3 == 2 {
            let payload = held.swap_remove(step % held.len());
            unsafe { pool.free(payload).unwrap() };
        } else {
            held.push(pool.allocate(None).unwrap());
        }

        let stats = pool.stats();
        assert_eq!(
            stats.objects_in_use + stats.free_objects,
            stats.pages_in_use * 4,
            "imbalance at step {step}"
        );
        assert!(stats.most_objects >= stats.objects_in_use);
    }

    for payload in held {
        unsafe { pool.free(payload).unwrap() };
    }

    let stats = pool.stats();
    assert_eq!(stats.objects_in_use, 0);
    assert_eq!(stats.allocations, stats.deallocations);
}
