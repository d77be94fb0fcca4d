// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! C entry points for a reader living in another language.
//!
//! Every function takes the region as `(start, size, page_size)` and never
//! panics on bad arguments: an invalid region or index yields `-1`, `false`
//! or `0`. The pure lookups are checked with `#[no_panic::no_panic]` when the
//! `no_panic` feature is enabled in release builds.

use crate::abi::{chunk_size, SharedMemoryAbi, MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::layout::{PageLayout, NUM_PAGE_LAYOUTS};

#[inline(always)]
unsafe fn page_of(
    start: *mut u8,
    size: usize,
    page_size: usize,
    page_idx: usize,
) -> Option<SharedMemoryAbi> {
    let abi = SharedMemoryAbi::init_ffi(start, size, page_size)?;
    (page_idx < abi.num_pages()).then_some(abi)
}

/// Returns the 2-bit state of a chunk (`Free=0, BeingWritten=1, BeingRead=2,
/// Complete=3`), or -1 if the region or page index is invalid.
///
/// # Safety
/// `start` must point to a mapped region of `size` bytes shared with the producer.
#[cfg_attr(all(feature = "no_panic", not(debug_assertions)), no_panic::no_panic)]
#[no_mangle]
pub unsafe extern "C" fn ddog_trace_shm_chunk_state(
    start: *mut u8,
    size: usize,
    page_size: usize,
    page_idx: usize,
    chunk_idx: usize,
) -> i32 {
    match page_of(start, size, page_size, page_idx) {
        Some(abi) => abi.layout_word(page_idx).chunk_state(chunk_idx).bits() as i32,
        None => -1,
    }
}

/// Claims every complete chunk of a page. Returns false if the page is not
/// readable yet or the arguments are invalid.
///
/// # Safety
/// Same as [`ddog_trace_shm_chunk_state`].
#[no_mangle]
pub unsafe extern "C" fn ddog_trace_shm_try_acquire_all_chunks_for_reading(
    start: *mut u8,
    size: usize,
    page_size: usize,
    page_idx: usize,
) -> bool {
    match page_of(start, size, page_size, page_idx) {
        Some(abi) => abi.try_acquire_all_chunks_for_reading(page_idx),
        None => false,
    }
}

/// Frees the chunks claimed by
/// [`ddog_trace_shm_try_acquire_all_chunks_for_reading`]. Returns true if
/// the page went back to unpartitioned.
///
/// # Safety
/// Same as [`ddog_trace_shm_chunk_state`]. The caller must be done reading
/// the page.
#[no_mangle]
pub unsafe extern "C" fn ddog_trace_shm_release_all_chunks_as_free(
    start: *mut u8,
    size: usize,
    page_size: usize,
    page_idx: usize,
) -> bool {
    match page_of(start, size, page_size, page_idx) {
        Some(abi) => abi.release_all_chunks_as_free(page_idx),
        None => false,
    }
}

/// Size in bytes, header included, of a chunk for the given page size and
/// layout bits. 0 if either is invalid or the layout has no chunks.
#[cfg_attr(all(feature = "no_panic", not(debug_assertions)), no_panic::no_panic)]
#[no_mangle]
pub extern "C" fn ddog_trace_shm_chunk_size(page_size: usize, layout: u32) -> usize {
    if page_size % MIN_PAGE_SIZE != 0
        || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
        || layout as usize >= NUM_PAGE_LAYOUTS
    {
        return 0;
    }
    chunk_size(page_size, PageLayout::from_bits(layout).num_chunks())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{ChunkHeader, Identifier, Packets, WriterId};
    use crate::region::MappedRegion;

    #[test]
    fn invalid_arguments_return_sentinels() {
        unsafe {
            assert_eq!(
                ddog_trace_shm_chunk_state(core::ptr::null_mut(), 4096, 4096, 0, 0),
                -1
            );
            let region = MappedRegion::anonymous(4096).unwrap();
            let start = region.as_non_null().cast::<u8>().as_ptr();
            assert_eq!(ddog_trace_shm_chunk_state(start, 4096, 4096, 1, 0), -1);
            assert_eq!(ddog_trace_shm_chunk_state(start, 4096, 1234, 0, 0), -1);
            assert!(!ddog_trace_shm_try_acquire_all_chunks_for_reading(
                start, 4096, 4096, 3
            ));
        }
        assert_eq!(ddog_trace_shm_chunk_size(4096, 9), 0);
        assert_eq!(ddog_trace_shm_chunk_size(100, 1), 0);
        assert_eq!(ddog_trace_shm_chunk_size(4096, 0), 0);
        assert_eq!(ddog_trace_shm_chunk_size(4096, 3), 1020);
        assert_eq!(ddog_trace_shm_chunk_size(8192, 5), 584);
    }

    #[test]
    fn reads_a_page_written_through_the_rust_api() {
        let region = MappedRegion::anonymous(4096).unwrap();
        let abi = unsafe { SharedMemoryAbi::new(region.as_non_null(), 4096).unwrap() };
        let start = region.as_non_null().cast::<u8>().as_ptr();

        assert!(abi.try_partition_page(0, PageLayout::Div2, 0));
        let header = ChunkHeader {
            identifier: Identifier::new(WriterId::new(1).unwrap(), 0),
            packets: Packets::default(),
        };
        let chunk = abi.try_acquire_chunk_for_writing(0, 1, &header).unwrap();
        unsafe {
            assert_eq!(ddog_trace_shm_chunk_state(start, 4096, 4096, 0, 1), 1);
            assert!(!ddog_trace_shm_try_acquire_all_chunks_for_reading(
                start, 4096, 4096, 0
            ));
        }
        assert_eq!(abi.release_chunk_as_complete(chunk).unwrap(), None);
        unsafe {
            assert_eq!(ddog_trace_shm_chunk_state(start, 4096, 4096, 0, 1), 3);
            assert!(ddog_trace_shm_try_acquire_all_chunks_for_reading(
                start, 4096, 4096, 0
            ));
            assert_eq!(ddog_trace_shm_chunk_state(start, 4096, 4096, 0, 1), 2);
            assert!(ddog_trace_shm_release_all_chunks_as_free(
                start, 4096, 4096, 0
            ));
            assert_eq!(ddog_trace_shm_chunk_state(start, 4096, 4096, 0, 1), 0);
        }
        assert!(abi.is_page_free(0));
    }
}
