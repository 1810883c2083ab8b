//! Basic usage example for `PagedPool`.
//!
//! Demonstrates allocating fixed-size payloads, writing through them, and
//! returning them to the pool while watching the statistics move.

use paged_pool::PagedPool;

fn main() {
    let mut pool = PagedPool::builder()
        .object_size_of::<u64>()
        .build()
        .expect("the initial page fits comfortably in memory");

    println!(
        "Created a pool of {}-byte payloads, {} per page",
        pool.stats().object_size,
        pool.config().objects_per_page()
    );

    // Grab three payloads and store values through them.
    let payloads: Vec<_> = (0..3_u64)
        .map(|value| {
            let payload = pool.allocate(None).expect("pool can grow on demand");

            // SAFETY: the payload is a valid u64-sized region we exclusively own.
            unsafe { payload.cast::<u64>().write_unaligned(value * 111) };
            payload
        })
        .collect();

    println!(
        "Allocated {} payloads; {} free blocks remain on the page",
        pool.stats().objects_in_use,
        pool.stats().free_objects
    );

    for payload in &payloads {
        // SAFETY: these are the regions written above.
        let value = unsafe { payload.cast::<u64>().read_unaligned() };
        println!("  payload at {payload:p} holds {value}");
    }

    // Return everything; freed blocks go back to the free list head.
    for payload in payloads {
        // SAFETY: each payload came from this pool and is freed exactly once.
        unsafe { pool.free(payload) }.expect("valid payloads free cleanly");
    }

    let stats = pool.stats();
    println!(
        "After cleanup: {} in use, {} free, {} allocations total, high-water {}",
        stats.objects_in_use, stats.free_objects, stats.allocations, stats.most_objects
    );

    // The single page is now fully free and can be reclaimed.
    let reclaimed = pool.free_empty_pages();
    println!("Reclaimed {reclaimed} empty page(s)");
}
