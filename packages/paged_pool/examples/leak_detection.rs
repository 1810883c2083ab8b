//! Debug-instrumentation example for `PagedPool`.
//!
//! Shows the pad sentinels catching a buffer underrun, the double-free
//! check, and the leak dump reporting payloads never returned to the pool.

use paged_pool::{HeaderKind, PagedPool};

fn main() {
    let mut pool = PagedPool::builder()
        .object_size(16)
        .pad_bytes(4)
        .header(HeaderKind::External)
        .debug(true)
        .build()
        .expect("the initial page fits comfortably in memory");

    let _hero = pool.allocate(Some("hero")).expect("pool can grow on demand");
    let sidekick = pool
        .allocate(Some("sidekick"))
        .expect("pool can grow on demand");
    let villain = pool
        .allocate(Some("villain"))
        .expect("pool can grow on demand");

    // Underrun the villain's payload by one byte, into its left pad.
    // SAFETY: the pad region borders the payload; stomping it is exactly
    // the corruption the instrumentation exists to catch.
    unsafe { villain.byte_sub(1).write(0) };

    let corrupted = pool.validate_pages(|payload, size| {
        println!("validate_pages: corrupt {size}-byte block at {payload:p}");
    });
    println!("{corrupted} corrupted block(s) found");

    // Freeing the corrupted block is refused, and the refusal changes nothing.
    // SAFETY: the payload came from this pool.
    let error = unsafe { pool.free(villain) }.expect_err("pad damage is detected");
    println!("free(villain) rejected: {error}");

    // A double free is refused too.
    // SAFETY: first free of this payload.
    unsafe { pool.free(sidekick) }.expect("valid payloads free cleanly");
    // SAFETY: detecting the second free is the point of the demonstration.
    let error = unsafe { pool.free(sidekick) }.expect_err("double frees are detected");
    println!("free(sidekick) again rejected: {error}");

    // Whatever was never freed shows up in the leak dump.
    let leaks = pool.dump_memory_in_use(|payload, size| {
        println!("leak: {size}-byte block at {payload:p}");
    });
    println!("{leaks} leaked block(s); the pool releases their records on drop");
}
