use std::alloc::{alloc, alloc_zeroed, dealloc};
use std::ptr::NonNull;

use crate::error::{PoolError, Result};
use crate::geometry::{PoolGeometry, PTR_WIDTH};
use crate::page::{self, Page};
use crate::{
    header, HeaderKind, PagedPoolBuilder, PoolConfig, PoolStats, ALIGN_PATTERN, ALLOCATED_PATTERN,
    FREED_PATTERN, PAD_PATTERN, UNALLOCATED_PATTERN,
};

/// A fixed-size object pool allocator.
///
/// `PagedPool` hands out same-sized raw payloads from pre-allocated pages and
/// recycles returned payloads through an intrusive LIFO free list, trading
/// the generality of the host allocator for constant-cost allocation and
/// strong debugging instrumentation.
///
/// # Key features
///
/// - **Deterministic hot paths**: allocation pops the free list, freeing
///   pushes it; geometry is precomputed so both reduce to pointer arithmetic.
/// - **Debug painting**: with debug checks enabled, payloads and pads carry
///   distinct byte patterns through their lifecycle, and `free` detects
///   out-of-bounds pointers, pad corruption and double frees.
/// - **Per-block headers**: optional bookkeeping in front of every payload,
///   from an allocation counter up to a heap-allocated labeled record.
/// - **Empty-page reclamation**: [`free_empty_pages()`](Self::free_empty_pages)
///   returns fully-free pages to the host allocator.
/// - **Passthrough mode**: the same surface backed directly by the host
///   allocator, for measuring what the pool buys you.
///
/// The pool serves raw byte regions: it does not run constructors or drop
/// logic on payload contents, and interpretation of the bytes is entirely
/// the caller's business.
///
/// # Example
///
/// ```rust
/// use paged_pool::PagedPool;
///
/// let mut pool = PagedPool::builder().object_size_of::<u64>().build()?;
///
/// let payload = pool.allocate(None)?;
///
/// // SAFETY: the payload is a valid u64-sized region that we exclusively own.
/// unsafe { payload.cast::<u64>().write_unaligned(42) };
/// // SAFETY: same region, written just above.
/// assert_eq!(unsafe { payload.cast::<u64>().read_unaligned() }, 42);
///
/// // SAFETY: the payload came from this pool and is freed exactly once.
/// unsafe { pool.free(payload) }?;
///
/// assert_eq!(pool.stats().objects_in_use, 0);
/// # Ok::<(), paged_pool::PoolError>(())
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) but deliberately not [`Sync`]; wrap
/// it in your own mutual exclusion if you need to share it.
#[derive(Debug)]
pub struct PagedPool {
    config: PoolConfig,
    geometry: PoolGeometry,

    /// Head of the singly linked page chain; each page's first bytes link to
    /// the page allocated before it.
    page_list: Option<Page>,

    /// Head of the intrusive free list threaded through the first bytes of
    /// every currently-unallocated payload, across all pages.
    free_list: Option<NonNull<u8>>,

    stats: PoolStats,
}

impl PagedPool {
    /// Creates a builder for configuring and constructing a [`PagedPool`].
    ///
    /// The object size must be specified with either
    /// [`object_size()`](PagedPoolBuilder::object_size) or
    /// [`object_size_of::<T>()`](PagedPoolBuilder::object_size_of) before
    /// calling [`build()`](PagedPoolBuilder::build).
    #[inline]
    pub fn builder() -> PagedPoolBuilder {
        PagedPoolBuilder::new()
    }

    /// Creates a new pool with the given validated configuration.
    ///
    /// Used internally by the builder. Pooled mode starts with one page
    /// ready; passthrough mode serves straight from the host allocator and
    /// never grows a page.
    pub(crate) fn new_inner(object_size: usize, config: PoolConfig) -> Result<Self> {
        let geometry = PoolGeometry::calculate(object_size, &config);

        let mut pool = Self {
            config,
            geometry,
            page_list: None,
            free_list: None,
            stats: PoolStats {
                object_size,
                page_size: geometry.page_size(),
                ..PoolStats::default()
            },
        };

        if !pool.config.passthrough {
            pool.allocate_new_page()?;
        }

        Ok(pool)
    }

    /// Hands out one payload of the configured object size.
    ///
    /// The payload is popped from the free list, growing a fresh page first
    /// when the list is empty. The label is recorded only by the
    /// [`External`](HeaderKind::External) header flavor; other flavors
    /// ignore it.
    ///
    /// Allocation numbers recorded in headers are 1-based and strictly
    /// increasing over the pool's lifetime, even across free-and-reuse.
    ///
    /// # Errors
    ///
    /// [`PoolError::NoPages`] when growing would exceed the page cap, and
    /// [`PoolError::NoMemory`] when the host allocator refuses a page.
    ///
    /// # Example
    ///
    /// ```rust
    /// use new_zealand::nz;
    /// use paged_pool::{PagedPool, PoolError};
    ///
    /// let mut pool = PagedPool::builder()
    ///     .object_size(8)
    ///     .max_pages(nz!(1))
    ///     .build()?;
    ///
    /// // The single permitted page holds four payloads by default.
    /// let mut held = Vec::new();
    /// for _ in 0..4 {
    ///     held.push(pool.allocate(None)?);
    /// }
    ///
    /// let error = pool.allocate(None).unwrap_err();
    /// assert!(matches!(error, PoolError::NoPages { .. }));
    /// # Ok::<(), paged_pool::PoolError>(())
    /// ```
    pub fn allocate(&mut self, label: Option<&str>) -> Result<NonNull<u8>> {
        if self.config.passthrough {
            let layout = self.geometry.object_layout();

            // SAFETY: the layout has non-zero size; payloads are at least
            // one pointer wide.
            let payload = NonNull::new(unsafe { alloc(layout) }).ok_or(PoolError::NoMemory {
                requested: layout.size(),
            })?;

            self.note_allocated();

            // Nothing ever joins the free list in passthrough mode, so the
            // decrement clamps at zero instead of wrapping the gauge.
            self.stats.free_objects = self.stats.free_objects.saturating_sub(1);

            return Ok(payload);
        }

        if self.free_list.is_none() {
            self.allocate_new_page()?;
        }

        // SAFETY: the free list threads through payloads of live pages.
        let payload = unsafe { self.pop_free() }
            .expect("a page was just created, so the free list cannot be empty");

        if self.config.debug {
            // SAFETY: the payload spans object_size bytes inside a live page.
            unsafe {
                payload.write_bytes(ALLOCATED_PATTERN, self.geometry.object_size());
            }
        }

        self.note_allocated();

        if self.geometry.header_width() > 0 {
            // SAFETY: the payload came off the free list, so it is a block
            // of a live page with its header region in front of it.
            let header = unsafe { self.header_of(payload) };

            // SAFETY: the header region is header_width bytes wide and was
            // cleared by page creation or the previous free.
            unsafe {
                header::write_allocated(header, self.config.header, self.stats.allocations, label);
            }
        }

        Ok(payload)
    }

    /// Returns a payload to the pool.
    ///
    /// With debug checks enabled the pointer is validated first: it must
    /// land exactly on a payload of a live page
    /// ([`PoolError::BadBoundary`]), its pads must be intact
    /// ([`PoolError::CorruptedBlock`]) and it must not already be free
    /// ([`PoolError::MultipleFree`]). A rejected free changes nothing: no
    /// counter moves and the block stays as it was.
    ///
    /// Double frees are recognized through the freed signature byte just
    /// past the intrusive link, or by scanning the free list when the
    /// payload is exactly one link wide and has no room for the signature.
    ///
    /// # Errors
    ///
    /// See above; none of the validation errors can occur while debug
    /// checks are off.
    ///
    /// # Safety
    ///
    /// `payload` must have been returned by [`allocate()`](Self::allocate)
    /// on this pool and not freed since. With debug checks enabled,
    /// violations are detected and reported as errors; without them, an
    /// invalid pointer corrupts the pool.
    ///
    /// # Example
    ///
    /// ```rust
    /// use paged_pool::{PagedPool, PoolError};
    ///
    /// let mut pool = PagedPool::builder().object_size(8).debug(true).build()?;
    ///
    /// let payload = pool.allocate(None)?;
    /// // SAFETY: first free of a payload from this pool.
    /// unsafe { pool.free(payload) }?;
    ///
    /// // SAFETY: detecting this double free is exactly what debug checks do.
    /// let error = unsafe { pool.free(payload) }.unwrap_err();
    /// assert!(matches!(error, PoolError::MultipleFree { .. }));
    /// # Ok::<(), paged_pool::PoolError>(())
    /// ```
    pub unsafe fn free(&mut self, payload: NonNull<u8>) -> Result<()> {
        if self.config.passthrough {
            // SAFETY: passthrough payloads come from the host-allocator
            // branch of allocate, which used this same layout.
            unsafe {
                dealloc(payload.as_ptr(), self.geometry.object_layout());
            }

            self.note_deallocated();
            return Ok(());
        }

        if self.config.debug {
            self.locate_payload(payload)?;

            // SAFETY: the boundary check above proved the payload is a
            // block of a live page, so its pads border it in bounds.
            if !unsafe { self.pads_intact(payload) } {
                return Err(PoolError::CorruptedBlock {
                    address: payload.as_ptr() as usize,
                });
            }

            // SAFETY: same bounds argument as above.
            unsafe { self.check_not_already_free(payload) }?;

            // SAFETY: same bounds argument as above.
            unsafe {
                payload.write_bytes(FREED_PATTERN, self.geometry.object_size());
            }
        }

        if self.geometry.header_width() > 0 {
            // SAFETY: the caller's contract (or the boundary check) places
            // the header region directly in front of the payload.
            let header = unsafe { self.header_of(payload) };

            // SAFETY: the header holds bookkeeping written by allocate.
            unsafe {
                header::clear_freed(header, self.config.header);
            }
        }

        // SAFETY: the payload is at least one link wide and is exclusively
        // ours again.
        unsafe {
            self.push_free(payload);
        }

        self.note_deallocated();
        Ok(())
    }

    /// Releases every page whose payloads are all free, returning how many
    /// pages were released.
    ///
    /// Emptiness is detected from the free list itself: a page is empty iff
    /// all of its payloads appear there. Free-list nodes of a released page
    /// are unlinked, so [`PoolStats::free_objects`] drops by the page's
    /// block count per released page.
    pub fn free_empty_pages(&mut self) -> usize {
        let mut freed = 0_usize;

        // First pass: trim empty pages off the head of the page list.
        while let Some(page) = self.page_list {
            if !self.is_page_empty(page) {
                break;
            }

            // SAFETY: the head of the page list is live.
            self.page_list = unsafe { page.next() };
            self.release_page(page);
            freed = freed.wrapping_add(1);
        }

        // Second pass: scan the remainder with a trailing predecessor.
        if let Some(mut prev) = self.page_list {
            // SAFETY: pages reachable from the page list are live.
            let mut current = unsafe { prev.next() };

            while let Some(current_page) = current {
                if self.is_page_empty(current_page) {
                    // SAFETY: current_page is live.
                    let after = unsafe { current_page.next() };

                    // SAFETY: prev is live; relinking it excises the
                    // current page from the chain.
                    unsafe {
                        prev.set_next(after);
                    }
                    self.release_page(current_page);

                    // SAFETY: prev is still live.
                    current = unsafe { prev.next() };
                    freed = freed.wrapping_add(1);
                } else {
                    prev = current_page;

                    // SAFETY: current_page is live.
                    current = unsafe { current_page.next() };
                }
            }
        }

        freed
    }

    /// Invokes `callback` with the payload address and object size of every
    /// block still held by a client, returning how many there were.
    ///
    /// Liveness comes from the per-block bookkeeping: the in-use flag for
    /// the basic and extended flavors, info-pointer non-nullness for the
    /// external flavor. With [`HeaderKind::None`] there is no bookkeeping to
    /// consult and every block is skipped.
    pub fn dump_memory_in_use(&self, mut callback: impl FnMut(NonNull<u8>, usize)) -> usize {
        let object_size = self.geometry.object_size();
        let mut leaks = 0_usize;

        let mut current = self.page_list;
        while let Some(current_page) = current {
            for index in 0..self.geometry.objects_per_page().get() {
                // SAFETY: index is within the page; the page is live.
                let header = unsafe { current_page.header(index, &self.geometry) };

                // SAFETY: header regions were initialized at page creation
                // and maintained by allocate/free since.
                let in_use = unsafe { header::is_in_use(header, self.config.header) };

                if in_use == Some(true) {
                    leaks = leaks.wrapping_add(1);

                    // SAFETY: index is within the page; the page is live.
                    callback(
                        unsafe { current_page.payload(index, &self.geometry) },
                        object_size,
                    );
                }
            }

            // SAFETY: current_page is live.
            current = unsafe { current_page.next() };
        }

        leaks
    }

    /// Scans the pads of every block of every page, invoking `callback`
    /// once per corrupted block with the payload address and object size,
    /// and returning the number of corrupted blocks.
    ///
    /// Returns zero without scanning when debug checks are off or when the
    /// pool carries no pads.
    pub fn validate_pages(&self, mut callback: impl FnMut(NonNull<u8>, usize)) -> usize {
        if !self.config.debug || self.geometry.pad_bytes() == 0 {
            return 0;
        }

        let object_size = self.geometry.object_size();
        let mut corrupted = 0_usize;

        let mut current = self.page_list;
        while let Some(current_page) = current {
            for index in 0..self.geometry.objects_per_page().get() {
                // SAFETY: index is within the page; the page is live.
                let payload = unsafe { current_page.payload(index, &self.geometry) };

                // SAFETY: the pads of an in-range block border its payload
                // inside the page.
                if !unsafe { self.pads_intact(payload) } {
                    corrupted = corrupted.wrapping_add(1);
                    callback(payload, object_size);
                }
            }

            // SAFETY: current_page is live.
            current = unsafe { current_page.next() };
        }

        corrupted
    }

    /// Enables or disables debug painting and the free-path validation.
    ///
    /// Blocks that existed before enabling carry whatever bytes they carry;
    /// only blocks painted after this call participate reliably in the
    /// signature-based checks.
    pub fn set_debug(&mut self, enabled: bool) {
        self.config.debug = enabled;
    }

    /// Head of the intrusive free list, if any payload is free.
    #[must_use]
    pub fn free_list(&self) -> Option<NonNull<u8>> {
        self.free_list
    }

    /// Base address of the most recently created live page, if any.
    #[must_use]
    pub fn page_list(&self) -> Option<NonNull<u8>> {
        self.page_list.map(Page::base)
    }

    /// The pool's configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The pool's precomputed page geometry.
    #[must_use]
    pub fn geometry(&self) -> &PoolGeometry {
        &self.geometry
    }

    /// A point-in-time snapshot of the pool's statistics.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Trivial accessor; mutation just breaks every stats assert.
    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// Grows the pool by one page and threads all of its payloads onto the
    /// free list.
    fn allocate_new_page(&mut self) -> Result<()> {
        if let Some(cap) = self.config.max_pages {
            if self.stats.pages_in_use >= cap.get() {
                return Err(PoolError::NoPages {
                    max_pages: cap.get(),
                });
            }
        }

        let layout = self.geometry.page_layout();

        // SAFETY: the layout has non-zero size; a page holds at least one
        // payload plus the link slot.
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(PoolError::NoMemory {
            requested: layout.size(),
        })?;
        let new_page = Page::new(base);

        if self.config.debug {
            // Paint everything as alignment slack first; block init below
            // repaints the regions that are not slack.
            // SAFETY: the allocation spans page_size bytes and more.
            unsafe {
                base.write_bytes(ALIGN_PATTERN, self.geometry.page_size());
            }
        }

        // SAFETY: the fresh allocation is a live page.
        unsafe {
            new_page.set_next(self.page_list);
        }
        self.page_list = Some(new_page);

        // Cannot overflow: each page is a distinct host allocation.
        self.stats.pages_in_use = self.stats.pages_in_use.wrapping_add(1);

        let header_width = self.geometry.header_width();
        for index in 0..self.geometry.objects_per_page().get() {
            if header_width > 0 {
                // SAFETY: index is within the page; the header region lies
                // inside the allocation.
                let header = unsafe { new_page.header(index, &self.geometry) };

                // SAFETY: the header region is header_width bytes wide.
                unsafe {
                    header.write_bytes(0, header_width);
                }
            }

            // SAFETY: index is within the page.
            let payload = unsafe { new_page.payload(index, &self.geometry) };

            // The intrusive link goes in before any painting so the paint
            // cannot clobber it.
            // SAFETY: the payload is at least one link wide.
            unsafe {
                self.push_free(payload);
            }

            if self.config.debug {
                // SAFETY: the payload spans at least link-width bytes.
                let past_link = unsafe { payload.byte_add(PTR_WIDTH) };

                // SAFETY: the unallocated paint starts past the link slot
                // and stays within the payload.
                unsafe {
                    past_link.write_bytes(
                        UNALLOCATED_PATTERN,
                        self.geometry.object_size().wrapping_sub(PTR_WIDTH),
                    );
                }

                let pad = self.geometry.pad_bytes();
                if pad > 0 {
                    // SAFETY: the left pad directly precedes the payload,
                    // inside the page.
                    let left_pad = unsafe { payload.byte_sub(pad) };

                    // SAFETY: pad bytes are within the page.
                    unsafe {
                        left_pad.write_bytes(PAD_PATTERN, pad);
                    }

                    // SAFETY: the right pad directly follows the payload,
                    // inside the page.
                    let right_pad = unsafe { payload.byte_add(self.geometry.object_size()) };

                    // SAFETY: pad bytes are within the page.
                    unsafe {
                        right_pad.write_bytes(PAD_PATTERN, pad);
                    }
                }
            }
        }

        Ok(())
    }

    /// Pushes a payload onto the free-list head.
    ///
    /// # Safety
    ///
    /// `payload` must address at least one link's width of writable bytes
    /// that no client holds.
    unsafe fn push_free(&mut self, payload: NonNull<u8>) {
        // SAFETY: forwarded contract.
        unsafe {
            page::write_free_link(payload, self.free_list);
        }
        self.free_list = Some(payload);

        // Cannot overflow: bounded by pages_in_use * objects_per_page.
        self.stats.free_objects = self.stats.free_objects.wrapping_add(1);
    }

    /// Pops the free-list head, if any.
    ///
    /// # Safety
    ///
    /// The free list must be intact: every node holding a link written by
    /// [`push_free`](Self::push_free) within a live page.
    unsafe fn pop_free(&mut self) -> Option<NonNull<u8>> {
        let head = self.free_list?;

        // SAFETY: forwarded contract.
        self.free_list = unsafe { page::read_free_link(head) };

        // Cannot underflow: the list was just observed non-empty.
        self.stats.free_objects = self.stats.free_objects.wrapping_sub(1);

        Some(head)
    }

    /// Header address of the block owning `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must be a payload address of a live page of this pool.
    unsafe fn header_of(&self, payload: NonNull<u8>) -> NonNull<u8> {
        // Cannot underflow address zero: the page header region sits in
        // front of the first payload.
        let backstep = self
            .geometry
            .pad_bytes()
            .wrapping_add(self.geometry.header_width());

        // SAFETY: the header region of a valid block lies within its page.
        unsafe { payload.byte_sub(backstep) }
    }

    /// Resolves a pointer to the page and block index it addresses,
    /// strictly: the pointer must land exactly on a payload start.
    fn locate_payload(&self, payload: NonNull<u8>) -> Result<(Page, usize)> {
        let address = payload.as_ptr() as usize;

        let mut current = self.page_list;
        while let Some(current_page) = current {
            if current_page.contains(payload, &self.geometry) {
                return current_page
                    .payload_index_of(payload, &self.geometry)
                    .map(|index| (current_page, index))
                    .ok_or(PoolError::BadBoundary { address });
            }

            // SAFETY: current_page is live.
            current = unsafe { current_page.next() };
        }

        Err(PoolError::BadBoundary { address })
    }

    /// Whether both pads around `payload` still carry the pad pattern.
    ///
    /// Vacuously true for padless pools.
    ///
    /// # Safety
    ///
    /// `payload` must be a payload address of a live page of this pool.
    unsafe fn pads_intact(&self, payload: NonNull<u8>) -> bool {
        let pad = self.geometry.pad_bytes();
        if pad == 0 {
            return true;
        }

        // SAFETY: the left pad directly precedes the payload within the page.
        let left_pad = unsafe { payload.byte_sub(pad) };

        // SAFETY: pad bytes are readable and unaliased during the check.
        let left = unsafe { std::slice::from_raw_parts(left_pad.as_ptr(), pad) };

        // SAFETY: the right pad directly follows the payload within the page.
        let right_pad = unsafe { payload.byte_add(self.geometry.object_size()) };

        // SAFETY: pad bytes are readable and unaliased during the check.
        let right = unsafe { std::slice::from_raw_parts(right_pad.as_ptr(), pad) };

        left.iter().chain(right).all(|&byte| byte == PAD_PATTERN)
    }

    /// Rejects a payload that is already on the free list.
    ///
    /// Uses the freed signature byte just past the link slot when the
    /// payload has room for one; otherwise falls back to scanning the free
    /// list, which the signature exists to avoid.
    ///
    /// # Safety
    ///
    /// `payload` must be a payload address of a live page of this pool.
    unsafe fn check_not_already_free(&self, payload: NonNull<u8>) -> Result<()> {
        let address = payload.as_ptr() as usize;

        if self.geometry.object_size() > PTR_WIDTH {
            // SAFETY: the byte past the link slot is within the payload.
            let signature = unsafe { payload.byte_add(PTR_WIDTH) };

            // Free paints the whole payload, then the link overwrites its
            // first bytes; allocate repaints everything. So this byte is
            // the freed pattern exactly while the block sits free.
            // SAFETY: as above.
            if unsafe { signature.read() } == FREED_PATTERN {
                return Err(PoolError::MultipleFree { address });
            }

            return Ok(());
        }

        // The payload is exactly one link wide, leaving no room for the
        // signature byte.
        let mut current = self.free_list;
        while let Some(node) = current {
            if node == payload {
                return Err(PoolError::MultipleFree { address });
            }

            // SAFETY: free-list nodes hold links written by push_free.
            current = unsafe { page::read_free_link(node) };
        }

        Ok(())
    }

    /// Whether every payload of `page` is on the free list.
    fn is_page_empty(&self, page: Page) -> bool {
        let objects_per_page = self.geometry.objects_per_page().get();
        let mut tally = 0_usize;

        let mut current = self.free_list;
        while let Some(node) = current {
            if page.contains(node, &self.geometry) {
                tally = tally.wrapping_add(1);
                if tally >= objects_per_page {
                    return true;
                }
            }

            // SAFETY: free-list nodes hold links written by push_free.
            current = unsafe { page::read_free_link(node) };
        }

        false
    }

    /// Unlinks every free-list node belonging to `page`, then returns the
    /// page's storage to the host allocator.
    ///
    /// The caller must already have removed `page` from the page list.
    fn release_page(&mut self, page: Page) {
        // Drop matching nodes off the head of the free list first.
        while let Some(node) = self.free_list {
            if !page.contains(node, &self.geometry) {
                break;
            }

            // SAFETY: free-list nodes hold links written by push_free.
            self.free_list = unsafe { page::read_free_link(node) };

            // Cannot underflow: a node was just unlinked.
            self.stats.free_objects = self.stats.free_objects.wrapping_sub(1);
        }

        // Then excise matching interior nodes with a trailing predecessor.
        if let Some(mut prev) = self.free_list {
            // SAFETY: free-list nodes hold links written by push_free.
            let mut current = unsafe { page::read_free_link(prev) };

            while let Some(node) = current {
                if page.contains(node, &self.geometry) {
                    // SAFETY: both nodes are live; relinking the
                    // predecessor excises the node.
                    let after = unsafe { page::read_free_link(node) };
                    // SAFETY: as above.
                    unsafe {
                        page::write_free_link(prev, after);
                    }
                    current = after;

                    // Cannot underflow: a node was just unlinked.
                    self.stats.free_objects = self.stats.free_objects.wrapping_sub(1);
                } else {
                    prev = node;

                    // SAFETY: as above.
                    current = unsafe { page::read_free_link(node) };
                }
            }
        }

        // SAFETY: the page came from alloc_zeroed with this same layout and
        // is no longer reachable from the page list or the free list.
        unsafe {
            dealloc(page.base().as_ptr(), self.geometry.page_layout());
        }

        // Cannot underflow: the page was live until this call.
        self.stats.pages_in_use = self.stats.pages_in_use.wrapping_sub(1);
    }

    /// Counter updates shared by both allocate paths.
    fn note_allocated(&mut self) {
        // Cannot overflow: bounded by live allocations, which are bounded
        // by address space.
        self.stats.objects_in_use = self.stats.objects_in_use.wrapping_add(1);
        self.stats.allocations = self.stats.allocations.wrapping_add(1);
        self.stats.most_objects = self.stats.most_objects.max(self.stats.objects_in_use);
    }

    /// Counter updates shared by both free paths. Runs only after every
    /// validation passed, so a rejected free leaves the counters untouched.
    fn note_deallocated(&mut self) {
        self.stats.deallocations = self.stats.deallocations.wrapping_add(1);

        // With debug checks off a stray pointer cannot be detected;
        // clamping beats wrapping the gauge around.
        self.stats.objects_in_use = self.stats.objects_in_use.saturating_sub(1);
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(debug_assertions)]
    /// Verifies the free-list/counter bookkeeping against the actual page
    /// contents. Debug builds only; used by tests.
    pub(crate) fn integrity_check(&self) {
        if self.config.passthrough {
            return;
        }

        let mut observed_free = 0_usize;
        let mut current = self.free_list;
        while let Some(node) = current {
            assert!(
                self.locate_payload(node).is_ok(),
                "free-list node {:#x} does not resolve to a payload of a live page",
                node.as_ptr() as usize
            );
            observed_free = observed_free.wrapping_add(1);

            // SAFETY: free-list nodes hold links written by push_free.
            current = unsafe { page::read_free_link(node) };
        }

        assert_eq!(
            observed_free, self.stats.free_objects,
            "free-list length does not match the free_objects counter"
        );

        assert_eq!(
            self.stats.free_objects.wrapping_add(self.stats.objects_in_use),
            self.stats
                .pages_in_use
                .wrapping_mul(self.geometry.objects_per_page().get()),
            "counters do not account for every block of every live page"
        );
    }
}

impl Drop for PagedPool {
    fn drop(&mut self) {
        let mut current = self.page_list;
        while let Some(current_page) = current {
            // SAFETY: pages on the page list are live until this walk
            // releases them.
            let next = unsafe { current_page.next() };

            if self.config.header == HeaderKind::External {
                // Clients may never have returned some blocks; their info
                // records are still ours to destroy.
                for index in 0..self.geometry.objects_per_page().get() {
                    // SAFETY: index is within the page; the page is live.
                    let header = unsafe { current_page.header(index, &self.geometry) };

                    // SAFETY: free blocks hold a nulled slot, live blocks
                    // an owning pointer.
                    unsafe {
                        header::release_external(header);
                    }
                }
            }

            // SAFETY: the page came from alloc_zeroed with this layout.
            unsafe {
                dealloc(current_page.base().as_ptr(), self.geometry.page_layout());
            }

            current = next;
        }
    }
}

// SAFETY: PagedPool contains raw pointers, but they all reference memory the
// pool itself owns; nothing is shared with other threads and no thread-local
// state is involved. All mutation goes through &mut self.
unsafe impl Send for PagedPool {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::items_after_statements,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::BlockInfo;

    assert_impl_all!(PagedPool: Send);
    assert_not_impl_any!(PagedPool: Sync);

    fn small_pool() -> PagedPool {
        PagedPool::builder()
            .object_size(8)
            .debug(true)
            .build()
            .unwrap()
    }

    #[test]
    fn smoke_test() {
        let mut pool = small_pool();

        let a = pool.allocate(None).unwrap();
        let b = pool.allocate(None).unwrap();
        assert_ne!(a, b);

        unsafe {
            a.cast::<u64>().write_unaligned(0xDEAD_BEEF);
            b.cast::<u64>().write_unaligned(0xCAFE_F00D);
            assert_eq!(a.cast::<u64>().read_unaligned(), 0xDEAD_BEEF);
            assert_eq!(b.cast::<u64>().read_unaligned(), 0xCAFE_F00D);
        }

        unsafe {
            pool.free(a).unwrap();
            pool.free(b).unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.deallocations, 2);
        assert_eq!(stats.objects_in_use, 0);

        pool.integrity_check();
    }

    #[test]
    fn lifo_reuse() {
        let mut pool = small_pool();

        let first = pool.allocate(None).unwrap();
        unsafe { pool.free(first).unwrap() };
        let second = pool.allocate(None).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn growth_allocates_new_page_only_when_exhausted() {
        let mut pool = small_pool();
        assert_eq!(pool.stats().pages_in_use, 1);

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.allocate(None).unwrap());
        }
        assert_eq!(pool.stats().pages_in_use, 1);

        held.push(pool.allocate(None).unwrap());
        assert_eq!(pool.stats().pages_in_use, 2);

        pool.integrity_check();
    }

    #[test]
    fn page_cap_is_enforced() {
        let mut pool = PagedPool::builder()
            .object_size(8)
            .max_pages(nz!(1))
            .build()
            .unwrap();

        for _ in 0..4 {
            _ = pool.allocate(None).unwrap();
        }

        let error = pool.allocate(None).unwrap_err();
        assert!(matches!(error, PoolError::NoPages { max_pages: 1 }));
    }

    #[test]
    fn counters_track_mixed_sequences() {
        let mut pool = PagedPool::builder()
            .object_size(16)
            .objects_per_page(nz!(3))
            .debug(true)
            .build()
            .unwrap();

        let mut held = Vec::new();
        for round in 0..5 {
            for _ in 0..=round {
                held.push(pool.allocate(None).unwrap());
            }
            if round % 2 == 1 {
                let payload = held.swap_remove(round / 2);
                unsafe { pool.free(payload).unwrap() };
            }

            let stats = pool.stats();
            assert_eq!(
                stats.objects_in_use + stats.free_objects,
                stats.pages_in_use * 3
            );
            assert!(stats.most_objects >= stats.objects_in_use);

            pool.integrity_check();
        }
    }

    #[test]
    fn most_objects_is_a_high_water_mark() {
        let mut pool = small_pool();

        let a = pool.allocate(None).unwrap();
        let b = pool.allocate(None).unwrap();
        assert_eq!(pool.stats().most_objects, 2);

        unsafe {
            pool.free(a).unwrap();
            pool.free(b).unwrap();
        }
        assert_eq!(pool.stats().most_objects, 2);

        _ = pool.allocate(None).unwrap();
        assert_eq!(pool.stats().most_objects, 2);
    }

    #[test]
    fn painting_follows_the_block_lifecycle() {
        let mut pool = PagedPool::builder()
            .object_size(16)
            .pad_bytes(2)
            .debug(true)
            .build()
            .unwrap();

        // A fresh block: link in front, unallocated pattern behind it.
        let head = pool.free_list().unwrap();
        unsafe {
            for offset in PTR_WIDTH..16 {
                assert_eq!(head.byte_add(offset).read(), UNALLOCATED_PATTERN);
            }
            for offset in 1..=2 {
                assert_eq!(head.byte_sub(offset).read(), PAD_PATTERN);
                assert_eq!(head.byte_add(15 + offset).read(), PAD_PATTERN);
            }
        }

        let payload = pool.allocate(None).unwrap();
        unsafe {
            for offset in 0..16 {
                assert_eq!(payload.byte_add(offset).read(), ALLOCATED_PATTERN);
            }
        }

        unsafe { pool.free(payload).unwrap() };
        unsafe {
            // The freed paint covers everything past the re-written link.
            for offset in PTR_WIDTH..16 {
                assert_eq!(payload.byte_add(offset).read(), FREED_PATTERN);
            }
        }
    }

    #[test]
    fn boundary_check_rejects_foreign_and_interior_pointers() {
        let mut pool = small_pool();
        let payload = pool.allocate(None).unwrap();

        // A pointer into the middle of a payload is rejected.
        let interior = unsafe { payload.byte_add(1) };
        let error = unsafe { pool.free(interior) }.unwrap_err();
        assert!(matches!(error, PoolError::BadBoundary { .. }));

        // A pointer outside every page is rejected.
        let mut foreign = [0_u8; 8];
        let foreign = NonNull::new(foreign.as_mut_ptr()).unwrap();
        let error = unsafe { pool.free(foreign) }.unwrap_err();
        assert!(matches!(error, PoolError::BadBoundary { .. }));

        // The rejected frees changed nothing.
        assert_eq!(pool.stats().deallocations, 0);
        assert_eq!(pool.stats().objects_in_use, 1);
    }

    #[test]
    fn pad_corruption_is_detected_on_free() {
        let mut pool = PagedPool::builder()
            .object_size(8)
            .pad_bytes(2)
            .debug(true)
            .build()
            .unwrap();

        let payload = pool.allocate(None).unwrap();

        // A one-byte underrun.
        unsafe { payload.byte_sub(1).write(0) };

        let error = unsafe { pool.free(payload) }.unwrap_err();
        assert!(matches!(error, PoolError::CorruptedBlock { .. }));
        assert_eq!(pool.stats().objects_in_use, 1);
    }

    #[test]
    fn double_free_detected_via_signature_byte() {
        // Payloads wider than the link slot carry the freed signature.
        let mut pool = PagedPool::builder()
            .object_size(16)
            .debug(true)
            .build()
            .unwrap();

        let payload = pool.allocate(None).unwrap();
        unsafe { pool.free(payload).unwrap() };

        let error = unsafe { pool.free(payload) }.unwrap_err();
        assert!(matches!(error, PoolError::MultipleFree { .. }));

        // The rejected free did not double-count.
        assert_eq!(pool.stats().deallocations, 1);
    }

    #[test]
    fn double_free_detected_via_free_list_scan() {
        // A link-wide payload has no room for the signature byte; the
        // check falls back to scanning the free list.
        let mut pool = small_pool();

        let payload = pool.allocate(None).unwrap();
        unsafe { pool.free(payload).unwrap() };

        let error = unsafe { pool.free(payload) }.unwrap_err();
        assert!(matches!(error, PoolError::MultipleFree { .. }));

        pool.integrity_check();
    }

    #[test]
    fn no_validation_without_debug() {
        let mut pool = PagedPool::builder()
            .object_size(8)
            .pad_bytes(2)
            .build()
            .unwrap();

        let payload = pool.allocate(None).unwrap();

        // Stomp a pad; without debug checks the free goes through.
        unsafe { payload.byte_sub(1).write(0) };
        unsafe { pool.free(payload).unwrap() };

        assert_eq!(pool.stats().deallocations, 1);
    }

    #[test]
    fn free_empty_pages_releases_only_fully_free_pages() {
        let mut pool = small_pool();

        let mut first_page = Vec::new();
        for _ in 0..4 {
            first_page.push(pool.allocate(None).unwrap());
        }

        let mut second_page = Vec::new();
        for _ in 0..4 {
            second_page.push(pool.allocate(None).unwrap());
        }
        assert_eq!(pool.stats().pages_in_use, 2);

        for payload in second_page {
            unsafe { pool.free(payload).unwrap() };
        }

        assert_eq!(pool.free_empty_pages(), 1);

        let stats = pool.stats();
        assert_eq!(stats.pages_in_use, 1);
        assert_eq!(stats.free_objects, 0);
        assert!(pool.free_list().is_none());

        pool.integrity_check();

        // The remaining page still serves its blocks.
        for payload in first_page {
            unsafe { pool.free(payload).unwrap() };
        }
        assert_eq!(pool.free_empty_pages(), 1);
        assert_eq!(pool.stats().pages_in_use, 0);

        // And the pool regrows on demand afterwards.
        _ = pool.allocate(None).unwrap();
        assert_eq!(pool.stats().pages_in_use, 1);
    }

    #[test]
    fn free_empty_pages_excises_interior_pages() {
        let mut pool = small_pool();

        // Three pages: the page list runs newest-first, so freeing the
        // middle page's blocks exercises the interior unlink path.
        let mut held = Vec::new();
        for _ in 0..12 {
            held.push(pool.allocate(None).unwrap());
        }
        assert_eq!(pool.stats().pages_in_use, 3);

        // Blocks 4..8 came from the middle page of the final chain.
        for payload in held.drain(4..8) {
            unsafe { pool.free(payload).unwrap() };
        }

        assert_eq!(pool.free_empty_pages(), 1);
        assert_eq!(pool.stats().pages_in_use, 2);

        pool.integrity_check();
    }

    #[test]
    fn free_empty_pages_with_nothing_to_do() {
        let mut pool = small_pool();
        _ = pool.allocate(None).unwrap();

        // The only page has a live block.
        assert_eq!(pool.free_empty_pages(), 0);
        assert_eq!(pool.stats().pages_in_use, 1);
    }

    #[test]
    fn basic_header_records_allocation_numbers() {
        let mut pool = PagedPool::builder()
            .object_size(8)
            .header(HeaderKind::Basic)
            .debug(true)
            .build()
            .unwrap();

        let first = pool.allocate(None).unwrap();
        let second = pool.allocate(None).unwrap();

        let read_header = |payload: NonNull<u8>| unsafe {
            let header = payload.byte_sub(HeaderKind::Basic.width());
            (
                header.cast::<u32>().read_unaligned(),
                header.byte_add(4).read(),
            )
        };

        assert_eq!(read_header(first), (1, 1));
        assert_eq!(read_header(second), (2, 1));

        unsafe { pool.free(first).unwrap() };
        assert_eq!(read_header(first), (0, 0));

        // Reuse keeps the numbers strictly increasing.
        let third = pool.allocate(None).unwrap();
        assert_eq!(third, first);
        assert_eq!(read_header(third), (3, 1));
    }

    #[test]
    fn extended_header_use_count_survives_reuse() {
        let kind = HeaderKind::Extended { user_bytes: 4 };
        let mut pool = PagedPool::builder()
            .object_size(8)
            .header(kind)
            .build()
            .unwrap();

        let width = kind.width();
        for expected_uses in 1..=3_u16 {
            let payload = pool.allocate(None).unwrap();

            unsafe {
                let header = payload.byte_sub(width);
                assert_eq!(
                    header.byte_add(4).cast::<u16>().read_unaligned(),
                    expected_uses
                );

                pool.free(payload).unwrap();
            }
        }
    }

    #[test]
    fn external_header_lifecycle() {
        let mut pool = PagedPool::builder()
            .object_size(8)
            .header(HeaderKind::External)
            .build()
            .unwrap();

        let payload = pool.allocate(Some("hero")).unwrap();

        unsafe {
            let slot = payload
                .byte_sub(HeaderKind::External.width())
                .cast::<*mut BlockInfo>();
            let info = &*slot.read_unaligned();
            assert!(info.in_use);
            assert_eq!(info.label.as_deref(), Some("hero"));
            assert_eq!(info.alloc_num, 1);
        }

        unsafe { pool.free(payload).unwrap() };

        unsafe {
            let slot = payload
                .byte_sub(HeaderKind::External.width())
                .cast::<*mut BlockInfo>();
            assert!(slot.read_unaligned().is_null());
        }
    }

    #[test]
    fn external_headers_released_on_drop() {
        let mut pool = PagedPool::builder()
            .object_size(8)
            .header(HeaderKind::External)
            .build()
            .unwrap();

        // Leak two labeled blocks into the drop path; the destructor must
        // release their info records (verified under Miri / leak checkers).
        _ = pool.allocate(Some("first")).unwrap();
        _ = pool.allocate(Some("second")).unwrap();
    }

    #[test]
    fn dump_memory_in_use_reports_live_blocks() {
        let mut pool = PagedPool::builder()
            .object_size(8)
            .header(HeaderKind::Basic)
            .build()
            .unwrap();

        let a = pool.allocate(None).unwrap();
        let b = pool.allocate(None).unwrap();
        let c = pool.allocate(None).unwrap();
        unsafe { pool.free(b).unwrap() };

        let mut reported = Vec::new();
        let leaks = pool.dump_memory_in_use(|payload, size| {
            assert_eq!(size, 8);
            reported.push(payload);
        });

        assert_eq!(leaks, 2);
        assert!(reported.contains(&a));
        assert!(reported.contains(&c));
        assert!(!reported.contains(&b));
    }

    #[test]
    fn dump_memory_in_use_without_bookkeeping_reports_nothing() {
        let mut pool = small_pool();
        _ = pool.allocate(None).unwrap();

        assert_eq!(pool.dump_memory_in_use(|_, _| panic!("no callback")), 0);
    }

    #[test]
    fn dump_memory_in_use_with_external_headers() {
        let mut pool = PagedPool::builder()
            .object_size(8)
            .header(HeaderKind::External)
            .build()
            .unwrap();

        let a = pool.allocate(Some("kept")).unwrap();
        let b = pool.allocate(None).unwrap();
        unsafe { pool.free(b).unwrap() };

        let mut reported = Vec::new();
        let leaks = pool.dump_memory_in_use(|payload, _| reported.push(payload));

        assert_eq!(leaks, 1);
        assert_eq!(reported, vec![a]);
    }

    #[test]
    fn validate_pages_reports_each_corrupt_block_once() {
        let mut pool = PagedPool::builder()
            .object_size(8)
            .pad_bytes(2)
            .debug(true)
            .build()
            .unwrap();

        let a = pool.allocate(None).unwrap();
        let b = pool.allocate(None).unwrap();

        // Overrun a, underrun b.
        unsafe {
            a.byte_add(8).write(0x11);
            b.byte_sub(2).write(0x22);
        }

        let mut reported = Vec::new();
        let corrupted = pool.validate_pages(|payload, size| {
            assert_eq!(size, 8);
            reported.push(payload);
        });

        assert_eq!(corrupted, 2);
        assert!(reported.contains(&a));
        assert!(reported.contains(&b));
    }

    #[test]
    fn validate_pages_is_a_no_op_without_debug_or_pads() {
        let mut padless = small_pool();
        _ = padless.allocate(None).unwrap();
        assert_eq!(padless.validate_pages(|_, _| panic!("no callback")), 0);

        let mut dark = PagedPool::builder()
            .object_size(8)
            .pad_bytes(2)
            .build()
            .unwrap();
        let payload = dark.allocate(None).unwrap();
        unsafe { payload.byte_sub(1).write(0) };
        assert_eq!(dark.validate_pages(|_, _| panic!("no callback")), 0);
    }

    #[test]
    fn set_debug_enables_validation_later() {
        let mut pool = PagedPool::builder().object_size(16).build().unwrap();

        let payload = pool.allocate(None).unwrap();
        pool.set_debug(true);

        let interior = unsafe { payload.byte_add(1) };
        let error = unsafe { pool.free(interior) }.unwrap_err();
        assert!(matches!(error, PoolError::BadBoundary { .. }));
    }

    #[test]
    fn passthrough_delegates_to_the_host_allocator() {
        let mut pool = PagedPool::builder()
            .object_size(32)
            .passthrough(true)
            .build()
            .unwrap();

        assert!(pool.page_list().is_none());
        assert!(pool.free_list().is_none());
        assert_eq!(pool.stats().pages_in_use, 0);

        let payload = pool.allocate(None).unwrap();
        unsafe {
            payload.write_bytes(0x5A, 32);
        }

        let stats = pool.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.objects_in_use, 1);
        assert_eq!(stats.most_objects, 1);
        assert_eq!(stats.free_objects, 0);

        unsafe { pool.free(payload).unwrap() };

        let stats = pool.stats();
        assert_eq!(stats.deallocations, 1);
        assert_eq!(stats.objects_in_use, 0);
        assert_eq!(stats.pages_in_use, 0);
    }

    #[test]
    fn introspection_exposes_lists_and_config() {
        let pool = small_pool();

        assert!(pool.page_list().is_some());
        assert!(pool.free_list().is_some());
        assert_eq!(pool.config().objects_per_page().get(), 4);
        assert!(pool.config().debug());
        assert_eq!(pool.geometry().object_size(), 8);
        assert_eq!(pool.stats().page_size, pool.geometry().page_size());
    }

    #[test]
    fn alignment_places_payloads_on_stride_boundaries() {
        let mut pool = PagedPool::builder()
            .object_size(10)
            .header(HeaderKind::Basic)
            .pad_bytes(2)
            .alignment(8)
            .debug(true)
            .build()
            .unwrap();

        let page_base = pool.page_list().unwrap().as_ptr() as usize;
        let geometry = *pool.geometry();

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.allocate(None).unwrap());
        }

        for payload in &held {
            let offset = payload.as_ptr() as usize - page_base;
            assert!(offset >= geometry.page_header_size());
            assert_eq!((offset - geometry.page_header_size()) % geometry.stride(), 0);
        }

        for payload in held {
            unsafe { pool.free(payload).unwrap() };
        }
        pool.integrity_check();
    }
}
