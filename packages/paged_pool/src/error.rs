use thiserror::Error;

/// Errors that can occur when allocating from or returning memory to a pool.
///
/// The boundary, corruption and double-free variants are only ever produced
/// while debug checks are enabled; without them a bad pointer goes undetected.
/// [`NoMemory`](PoolError::NoMemory) and [`NoPages`](PoolError::NoPages)
/// are raised regardless of the debug state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The host allocator refused to provide backing storage.
    #[error("host allocator refused {requested} bytes")]
    NoMemory {
        /// Number of bytes requested from the host allocator.
        requested: usize,
    },

    /// Growing the pool would exceed the configured page cap.
    #[error("page cap reached: {max_pages} pages are already live")]
    NoPages {
        /// The configured maximum number of live pages.
        max_pages: usize,
    },

    /// A pointer passed to `free` does not address a payload in any live page.
    #[error("pointer {address:#x} does not address a payload in any live page")]
    BadBoundary {
        /// The offending address.
        address: usize,
    },

    /// The pad bytes around a payload no longer carry the pad pattern.
    #[error("pad bytes around payload {address:#x} have been overwritten")]
    CorruptedBlock {
        /// Address of the payload whose pads are damaged.
        address: usize,
    },

    /// `free` was invoked on a payload that is already on the free list.
    #[error("payload {address:#x} has already been freed")]
    MultipleFree {
        /// Address of the payload that was freed twice.
        address: usize,
    },
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`PoolError`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, PoolError>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PoolError: Send, Sync, Debug);

    #[test]
    fn messages_carry_context() {
        let error = PoolError::NoPages { max_pages: 2 };
        assert!(error.to_string().contains('2'));

        let error = PoolError::BadBoundary { address: 0xABCD };
        assert!(error.to_string().contains("0xabcd"));
    }

    #[test]
    fn errors_work_in_result_context() {
        let result: Result<()> = Err(PoolError::NoMemory { requested: 4096 });
        assert!(result.is_err());
    }
}
