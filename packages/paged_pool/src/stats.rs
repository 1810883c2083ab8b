/// Point-in-time statistics snapshot for a [`PagedPool`](crate::PagedPool).
///
/// Returned by value from [`stats()`](crate::PagedPool::stats), so a snapshot
/// taken before an operation is unaffected by the operation.
///
/// Outside of passthrough mode the counters satisfy
/// `free_objects == pages_in_use * objects_per_page - objects_in_use`
/// whenever no operation is mid-flight.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Size in bytes of each payload handed to clients.
    pub object_size: usize,

    /// Size in bytes of each page, excluding the host allocator's slack.
    pub page_size: usize,

    /// Number of payloads currently on the free list.
    pub free_objects: usize,

    /// Number of payloads currently held by clients.
    pub objects_in_use: usize,

    /// Number of live pages.
    pub pages_in_use: usize,

    /// High-water mark of [`objects_in_use`](Self::objects_in_use);
    /// monotone nondecreasing.
    pub most_objects: usize,

    /// Cumulative number of successful allocations. This is the counter the
    /// basic and extended headers record, so it shares their `u32` width.
    pub allocations: u32,

    /// Cumulative number of successful deallocations.
    pub deallocations: u32,
}
