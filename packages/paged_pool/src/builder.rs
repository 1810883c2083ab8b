use std::num::NonZero;

use crate::error::Result;
use crate::geometry::PTR_WIDTH;
use crate::{HeaderKind, PagedPool, PoolConfig};

/// Builder for configuring and constructing a [`PagedPool`].
///
/// The object size is mandatory and must be set with either
/// [`object_size()`](Self::object_size) or
/// [`object_size_of::<T>()`](Self::object_size_of) before calling
/// [`build()`](Self::build). Every other setting has a default: four blocks
/// per page, no page cap, no pads, no header, no alignment, debug checks
/// off, pooling on.
///
/// # Examples
///
/// ```rust
/// use paged_pool::{HeaderKind, PagedPool};
///
/// // Size from an explicit byte count.
/// let pool = PagedPool::builder().object_size(48).build()?;
///
/// // Size from a type, with debug instrumentation.
/// let pool = PagedPool::builder()
///     .object_size_of::<[u64; 4]>()
///     .pad_bytes(2)
///     .header(HeaderKind::Basic)
///     .debug(true)
///     .build()?;
/// # Ok::<(), paged_pool::PoolError>(())
/// ```
#[derive(Debug)]
#[must_use]
pub struct PagedPoolBuilder {
    object_size: Option<usize>,
    config: PoolConfig,
}

impl PagedPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            object_size: None,
            config: PoolConfig::default(),
        }
    }

    /// Sets the payload size in bytes.
    ///
    /// # Panics
    ///
    /// Panics if the size cannot hold the intrusive free-list link (one
    /// pointer's width).
    pub fn object_size(mut self, size: usize) -> Self {
        assert!(
            size >= PTR_WIDTH,
            "object size {size} cannot hold the intrusive free-list link ({PTR_WIDTH} bytes)"
        );
        self.object_size = Some(size);
        self
    }

    /// Sets the payload size from a type.
    ///
    /// This is a convenience over [`object_size()`](Self::object_size); the
    /// pool still serves raw bytes and never constructs or drops a `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is smaller than the intrusive free-list link (one
    /// pointer's width).
    pub fn object_size_of<T>(self) -> Self {
        self.object_size(size_of::<T>())
    }

    /// Sets the number of payload blocks per page.
    pub fn objects_per_page(mut self, count: NonZero<usize>) -> Self {
        self.config.objects_per_page = count;
        self
    }

    /// Caps the number of live pages. Unset means unbounded.
    pub fn max_pages(mut self, cap: NonZero<usize>) -> Self {
        self.config.max_pages = Some(cap);
        self
    }

    /// Enables or disables debug painting and free-path validation.
    ///
    /// Can also be toggled later with
    /// [`set_debug()`](PagedPool::set_debug).
    pub fn debug(mut self, enabled: bool) -> Self {
        self.config.debug = enabled;
        self
    }

    /// Sets the width of the sentinel pad placed on each side of every
    /// payload. Pads are painted and checked only while debug is on.
    pub fn pad_bytes(mut self, width: usize) -> Self {
        self.config.pad_bytes = width;
        self
    }

    /// Selects the per-block header flavor.
    pub fn header(mut self, kind: HeaderKind) -> Self {
        self.config.header = kind;
        self
    }

    /// Sets the byte alignment of the page header and the block stride.
    ///
    /// Zero (the default) disables alignment.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is neither zero nor a power of two.
    pub fn alignment(mut self, alignment: usize) -> Self {
        assert!(
            alignment == 0 || alignment.is_power_of_two(),
            "alignment must be zero or a power of two, got {alignment}"
        );
        self.config.alignment = alignment;
        self
    }

    /// Routes every operation to the host allocator instead of the pool.
    ///
    /// Counters are still maintained, which makes this mode useful as a
    /// baseline when measuring the pool.
    pub fn passthrough(mut self, enabled: bool) -> Self {
        self.config.passthrough = enabled;
        self
    }

    /// Builds the pool.
    ///
    /// Outside of passthrough mode the pool starts with one page already
    /// populated, so construction can fail the same way growth does.
    ///
    /// # Errors
    ///
    /// [`PoolError::NoMemory`](crate::PoolError::NoMemory) when the host
    /// allocator refuses the initial page.
    ///
    /// # Panics
    ///
    /// Panics if no object size has been set.
    pub fn build(self) -> Result<PagedPool> {
        let object_size = self.object_size.expect(
            "object size must be set using .object_size() or .object_size_of::<T>() before calling .build()",
        );

        PagedPool::new_inner(object_size, self.config)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;

    #[test]
    fn defaults_match_the_documented_configuration() {
        let pool = PagedPool::builder().object_size(8).build().unwrap();
        let config = pool.config();

        assert!(!config.passthrough());
        assert_eq!(config.objects_per_page(), nz!(4));
        assert_eq!(config.max_pages(), None);
        assert!(!config.debug());
        assert_eq!(config.pad_bytes(), 0);
        assert_eq!(config.header(), HeaderKind::None);
        assert_eq!(config.alignment(), 0);
    }

    #[test]
    fn settings_reach_the_pool() {
        let pool = PagedPool::builder()
            .object_size(16)
            .objects_per_page(nz!(2))
            .max_pages(nz!(3))
            .debug(true)
            .pad_bytes(4)
            .header(HeaderKind::Extended { user_bytes: 2 })
            .alignment(16)
            .build()
            .unwrap();

        let config = pool.config();
        assert_eq!(config.objects_per_page(), nz!(2));
        assert_eq!(config.max_pages(), Some(nz!(3)));
        assert!(config.debug());
        assert_eq!(config.pad_bytes(), 4);
        assert_eq!(config.header(), HeaderKind::Extended { user_bytes: 2 });
        assert_eq!(config.alignment(), 16);
        assert_eq!(pool.stats().free_objects, 2);
    }

    #[test]
    #[should_panic]
    fn missing_object_size_panics() {
        _ = PagedPool::builder().build();
    }

    #[test]
    #[should_panic]
    fn undersized_object_panics() {
        _ = PagedPool::builder().object_size(1);
    }

    #[test]
    #[should_panic]
    fn non_power_of_two_alignment_panics() {
        _ = PagedPool::builder().object_size(8).alignment(12);
    }
}
