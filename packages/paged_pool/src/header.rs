use std::ptr::NonNull;

use crate::config::{BASIC_TAIL_WIDTH, USE_COUNT_WIDTH};
use crate::HeaderKind;

/// Bookkeeping record owned by a block while the external header flavor is
/// active.
///
/// The block's header bytes hold an owning pointer to this record between
/// `allocate` and `free`; the pool creates it on allocation and destroys it
/// on free (or when the pool itself is dropped with the block still live).
#[derive(Debug)]
pub struct BlockInfo {
    /// Whether the owning block is currently held by a client.
    pub in_use: bool,

    /// Copy of the label passed to `allocate`, if any.
    pub label: Option<String>,

    /// The allocation number under which the block was handed out.
    pub alloc_num: u32,
}

/// Offset of the allocation-number/flag/slack tail within the header.
fn tail_offset(kind: HeaderKind) -> usize {
    match kind {
        HeaderKind::None | HeaderKind::Basic | HeaderKind::External => 0,
        HeaderKind::Extended { user_bytes } => {
            // Cannot overflow: the geometry computation already sized a page
            // around this header width.
            user_bytes.wrapping_add(USE_COUNT_WIDTH)
        }
    }
}

/// Offset of the in-use flag byte within the header.
fn flag_offset(kind: HeaderKind) -> usize {
    // The flag sits right after the four-byte allocation number.
    tail_offset(kind).wrapping_add(size_of::<u32>())
}

/// Records an allocation in the header region of a block.
///
/// For the extended flavor the use-count is bumped while the caller-owned
/// leading bytes are left untouched. For the external flavor a fresh
/// [`BlockInfo`] is heap-allocated and its owning pointer stored.
///
/// # Safety
///
/// `header` must address at least `kind.width()` writable bytes, and for the
/// external flavor the existing pointer slot must be null or stale (the
/// block must not currently own a live record).
pub(crate) unsafe fn write_allocated(
    header: NonNull<u8>,
    kind: HeaderKind,
    allocation_number: u32,
    label: Option<&str>,
) {
    match kind {
        HeaderKind::None => {}
        HeaderKind::Basic | HeaderKind::Extended { .. } => {
            if let HeaderKind::Extended { user_bytes } = kind {
                // SAFETY: the use-count lives within the header region per
                // the flavor layout.
                let use_count = unsafe { header.byte_add(user_bytes) }.cast::<u16>();

                // SAFETY: unaligned because header addresses carry no
                // alignment guarantee.
                let uses = unsafe { use_count.read_unaligned() };

                // SAFETY: as above.
                unsafe {
                    use_count.write_unaligned(uses.wrapping_add(1));
                }
            }

            // SAFETY: the allocation number lies within the header region
            // per the flavor layout.
            let number_slot = unsafe { header.byte_add(tail_offset(kind)) }.cast::<u32>();

            // SAFETY: unaligned because header addresses carry no alignment
            // guarantee.
            unsafe {
                number_slot.write_unaligned(allocation_number);
            }

            // SAFETY: the flag byte lies within the header region per the
            // flavor layout.
            let flag = unsafe { header.byte_add(flag_offset(kind)) };

            // SAFETY: single byte within the header region.
            unsafe {
                flag.write(1);
            }
        }
        HeaderKind::External => {
            let info = Box::new(BlockInfo {
                in_use: true,
                label: label.map(String::from),
                alloc_num: allocation_number,
            });

            // SAFETY: the external header region is exactly one pointer
            // wide; unaligned because header addresses carry no alignment
            // guarantee.
            unsafe {
                header
                    .cast::<*mut BlockInfo>()
                    .write_unaligned(Box::into_raw(info));
            }
        }
    }
}

/// Clears the header region of a block as it returns to the free list.
///
/// The basic flavor zeroes its whole header; the extended flavor zeroes only
/// the allocation-number/flag/slack tail so the caller-owned bytes and the
/// use-count survive reuse; the external flavor destroys the owned
/// [`BlockInfo`].
///
/// # Safety
///
/// Same contract as [`write_allocated`], and for the external flavor the
/// pointer slot must hold either null or a pointer previously produced by
/// [`write_allocated`] on this slot.
pub(crate) unsafe fn clear_freed(header: NonNull<u8>, kind: HeaderKind) {
    match kind {
        HeaderKind::None => {}
        HeaderKind::Basic | HeaderKind::Extended { .. } => {
            // SAFETY: the tail lies within the header region per the flavor
            // layout.
            let tail = unsafe { header.byte_add(tail_offset(kind)) };

            // SAFETY: the tail is BASIC_TAIL_WIDTH bytes wide.
            unsafe {
                tail.write_bytes(0, BASIC_TAIL_WIDTH);
            }
        }
        // SAFETY: forwarded contract.
        HeaderKind::External => unsafe { release_external(header) },
    }
}

/// Whether the header region marks its block as held by a client.
///
/// Returns `None` for [`HeaderKind::None`], which records nothing.
///
/// # Safety
///
/// `header` must address at least `kind.width()` readable bytes that were
/// initialized by page creation, [`write_allocated`] or [`clear_freed`].
pub(crate) unsafe fn is_in_use(header: NonNull<u8>, kind: HeaderKind) -> Option<bool> {
    match kind {
        HeaderKind::None => None,
        HeaderKind::Basic | HeaderKind::Extended { .. } => {
            // SAFETY: the flag byte lies within the header region.
            let flag = unsafe { header.byte_add(flag_offset(kind)) };

            // SAFETY: single initialized byte.
            Some(unsafe { flag.read() } != 0)
        }
        HeaderKind::External => {
            // SAFETY: the external header region is exactly one pointer wide.
            Some(!unsafe { header.cast::<*mut BlockInfo>().read_unaligned() }.is_null())
        }
    }
}

/// Destroys the [`BlockInfo`] owned by an external-flavor header, if any,
/// and nulls the pointer slot.
///
/// # Safety
///
/// `header` must address one pointer's worth of readable and writable bytes
/// holding either null or a pointer previously produced by
/// [`write_allocated`] on this slot.
pub(crate) unsafe fn release_external(header: NonNull<u8>) {
    let slot = header.cast::<*mut BlockInfo>();

    // SAFETY: the slot is one pointer wide per the caller's contract.
    let info = unsafe { slot.read_unaligned() };

    if !info.is_null() {
        // SAFETY: non-null slot contents are owning pointers created by
        // Box::into_raw in write_allocated and not yet released.
        drop(unsafe { Box::from_raw(info) });

        // SAFETY: same slot as above.
        unsafe {
            slot.write_unaligned(std::ptr::null_mut());
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use super::*;

    fn buffer_header(buffer: &mut [u8]) -> NonNull<u8> {
        NonNull::new(buffer.as_mut_ptr()).unwrap()
    }

    #[test]
    fn basic_header_records_and_clears() {
        let mut buffer = [0_u8; 8];
        let header = buffer_header(&mut buffer);

        unsafe {
            write_allocated(header, HeaderKind::Basic, 7, None);
            assert_eq!(is_in_use(header, HeaderKind::Basic), Some(true));
        }

        assert_eq!(u32::from_ne_bytes(buffer[0..4].try_into().unwrap()), 7);
        assert_eq!(buffer[4], 1);

        let header = buffer_header(&mut buffer);
        unsafe {
            clear_freed(header, HeaderKind::Basic);
            assert_eq!(is_in_use(header, HeaderKind::Basic), Some(false));
        }

        assert_eq!(buffer, [0_u8; 8]);
    }

    #[test]
    fn extended_header_preserves_user_bytes_and_use_count() {
        let kind = HeaderKind::Extended { user_bytes: 4 };
        let mut buffer = [0_u8; 14];
        buffer[0..4].copy_from_slice(b"mine");
        let header = buffer_header(&mut buffer);

        unsafe {
            write_allocated(header, kind, 3, None);
            clear_freed(header, kind);
            write_allocated(header, kind, 4, None);
        }

        // Caller bytes untouched, use-count bumped once per allocation.
        assert_eq!(&buffer[0..4], b"mine");
        assert_eq!(u16::from_ne_bytes(buffer[4..6].try_into().unwrap()), 2);
        assert_eq!(u32::from_ne_bytes(buffer[6..10].try_into().unwrap()), 4);
        assert_eq!(buffer[10], 1);
    }

    #[test]
    fn none_header_reports_nothing() {
        let mut buffer = [0_u8; 1];
        let header = buffer_header(&mut buffer);

        assert_eq!(unsafe { is_in_use(header, HeaderKind::None) }, None);
    }

    #[test]
    fn external_header_owns_its_record() {
        let mut buffer = [0_u8; size_of::<*mut u8>()];
        let header = buffer_header(&mut buffer);

        unsafe {
            write_allocated(header, HeaderKind::External, 11, Some("widget"));

            let info_ptr = header.cast::<*mut BlockInfo>().read_unaligned();
            let info = &*info_ptr;
            assert!(info.in_use);
            assert_eq!(info.label.as_deref(), Some("widget"));
            assert_eq!(info.alloc_num, 11);

            assert_eq!(is_in_use(header, HeaderKind::External), Some(true));

            clear_freed(header, HeaderKind::External);
            assert_eq!(is_in_use(header, HeaderKind::External), Some(false));

            // Releasing again is a no-op on the nulled slot.
            release_external(header);
        }
    }
}
