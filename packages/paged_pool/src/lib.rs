#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A fixed-size object pool allocator with debug instrumentation.
//!
//! This crate provides [`PagedPool`], a memory manager that serves same-sized
//! raw payloads from pre-allocated pages and recycles returned payloads
//! through an intrusive free list. It is a drop-in replacement for per-object
//! dynamic allocation when a program repeatedly creates and destroys many
//! instances of a single type, trading generality for deterministic
//! allocation cost and strong debugging instrumentation.
//!
//! # Key features
//!
//! - **Page-based storage**: payloads live in identically laid out pages,
//!   acquired from the host allocator as the pool grows and returned by
//!   [`free_empty_pages()`](PagedPool::free_empty_pages).
//! - **Intrusive LIFO free list**: a free payload's own first bytes link it
//!   to the next free payload, so recycling costs no extra memory.
//! - **Debug painting**: distinct byte patterns mark unallocated, allocated
//!   and freed payloads, pads and alignment slack, making memory misuse
//!   visible in a debugger and detectable by the pool itself.
//! - **Corruption detection**: with debug checks on,
//!   [`free()`](PagedPool::free) rejects out-of-bounds pointers, buffer
//!   overruns and underruns caught by pad sentinels, and double frees.
//! - **Per-block headers**: optional bookkeeping per payload, from a bare
//!   allocation counter to a heap-allocated record with a caller label.
//! - **Leak reporting**: [`dump_memory_in_use()`](PagedPool::dump_memory_in_use)
//!   walks the pages and reports every payload still held by a client.
//!
//! The pool serves raw byte regions of a fixed size. It does not track
//! object types, run constructors or destructors, or honor per-allocation
//! size requests; interpretation of the bytes is the caller's
//! responsibility.
//!
//! # Example
//!
//! ```rust
//! use paged_pool::{HeaderKind, PagedPool};
//!
//! // A pool of 24-byte payloads with full debug instrumentation.
//! let mut pool = PagedPool::builder()
//!     .object_size(24)
//!     .pad_bytes(4)
//!     .header(HeaderKind::Basic)
//!     .debug(true)
//!     .build()?;
//!
//! let payload = pool.allocate(None)?;
//!
//! // SAFETY: the payload is a valid 24-byte region that we exclusively own.
//! unsafe { payload.write_bytes(0x42, 24) };
//!
//! // No leaks reported after everything is returned.
//! // SAFETY: the payload came from this pool and is freed exactly once.
//! unsafe { pool.free(payload) }?;
//! assert_eq!(pool.dump_memory_in_use(|_, _| {}), 0);
//! # Ok::<(), paged_pool::PoolError>(())
//! ```
//!
//! # Thread safety
//!
//! A pool is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]): it
//! offers no internal locking, and callers that need shared access must
//! supply their own mutual exclusion.

mod builder;
mod config;
mod error;
mod geometry;
mod header;
mod page;
mod pool;
mod stats;

pub use builder::PagedPoolBuilder;
pub use config::{
    HeaderKind, PoolConfig, ALIGN_PATTERN, ALLOCATED_PATTERN, DEFAULT_OBJECTS_PER_PAGE,
    FREED_PATTERN, PAD_PATTERN, UNALLOCATED_PATTERN,
};
pub use error::PoolError;
pub use geometry::PoolGeometry;
pub use header::BlockInfo;
pub use pool::PagedPool;
pub use stats::PoolStats;
