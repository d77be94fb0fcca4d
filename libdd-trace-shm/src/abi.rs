// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lock-free operations over the shared page/chunk region.
//!
//! The region is caller-owned memory (usually a `MAP_SHARED` mapping) divided
//! into `size / page_size` pages. A page is lazily partitioned into 1, 2, 4, 7
//! or 14 equal chunks. Each chunk moves through
//!
//! ```text
//!   Free -> BeingWritten -> Complete -> BeingRead -> Free
//!           (producer)                  (reader)
//! ```
//!
//! Every transition is one CAS on the page layout word (see
//! [`LayoutWord`]). Nothing here blocks or allocates: an operation either
//! succeeds, returns a failure value meaning "retry or pick another chunk", or,
//! for a protocol violation, panics.
//!
//! # Memory ordering
//!
//! - The producer's payload writes happen-before the `AcqRel` CAS that moves
//!   the chunk to `Complete`. The reader's `AcqRel` CAS that moves it to
//!   `BeingRead` therefore observes every payload byte.
//! - The chunk header `identifier` is stored with `Release` right after the
//!   chunk becomes `BeingWritten`; the packet count is stored with `Release`
//!   after each packet.

use crate::header::{
    ChunkHeader, Identifier, PageHeader, Packets, RawChunkHeader, CHUNK_ALIGNMENT,
    CHUNK_HEADER_SIZE, PAGE_HEADER_SIZE,
};
use crate::layout::{ChunkState, LayoutWord, PageLayout, MAX_CHUNKS_PER_PAGE, NUM_PAGE_LAYOUTS};
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::Ordering;
use thiserror::Error;

pub const MIN_PAGE_SIZE: usize = 4096;
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Number of CAS attempts [`SharedMemoryAbi::release_chunk`] makes before
/// giving up on a contended page.
pub const MAX_RELEASE_ATTEMPTS: u32 = 64;

/// Returns the largest 4-byte aligned chunk size for `num_chunks` chunks in a page.
pub(crate) const fn chunk_size(page_size: usize, num_chunks: usize) -> usize {
    if num_chunks == 0 {
        return 0;
    }
    ((page_size - PAGE_HEADER_SIZE) / num_chunks) & !(CHUNK_ALIGNMENT - 1)
}

/// The region handed to the ABI does not satisfy the size constraints.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AbiError {
    #[error("page size {0} is not a multiple of 4096")]
    PageSizeNotAligned(usize),
    #[error("page size {0} is outside of [4096, 65536]")]
    PageSizeOutOfRange(usize),
    #[error("region size {size} is not a non-zero multiple of the page size {page_size}")]
    RegionSizeMismatch { size: usize, page_size: usize },
    #[error("region start {0:#x} is not 8-byte aligned")]
    MisalignedStart(usize),
}

/// Failure of [`SharedMemoryAbi::release_chunk`] that leaves the page valid.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// The page layout kept changing under us. The chunk is handed back so
    /// the release can be retried later; its state is unchanged.
    #[error("gave up releasing chunk {chunk_idx} of page {page_idx} after {attempts} attempts")]
    RetriesExhausted {
        chunk: Chunk,
        page_idx: usize,
        chunk_idx: usize,
        attempts: u32,
    },
}

/// A chunk currently held by this process, either for writing or for reading.
///
/// A `Chunk` is an ownership token: it is handed out by a successful acquire
/// and consumed by the matching release. It is not `Clone`.
pub struct Chunk {
    begin: NonNull<u8>,
    size: usize,
}

// SAFETY: a Chunk only points into the shared region, which outlives it per the
// SharedMemoryAbi construction contract. Header access goes through atomics
// and payload mutation requires `&mut self`.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    fn new(begin: NonNull<u8>, size: usize) -> Self {
        assert!(
            begin.as_ptr() as usize % CHUNK_ALIGNMENT == 0,
            "chunk start is not {CHUNK_ALIGNMENT}-byte aligned"
        );
        assert!(size > CHUNK_HEADER_SIZE, "chunk of {size} bytes has no payload");
        Self { begin, size }
    }

    #[inline]
    fn header(&self) -> &RawChunkHeader {
        // SAFETY: `begin` is 4-byte aligned and points to at least
        // CHUNK_HEADER_SIZE bytes inside the region.
        unsafe { &*(self.begin.as_ptr() as *const RawChunkHeader) }
    }

    #[inline]
    pub(crate) fn begin_addr(&self) -> usize {
        self.begin.as_ptr() as usize
    }

    /// Total size of the chunk, header included.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn payload_size(&self) -> usize {
        self.size - CHUNK_HEADER_SIZE
    }

    /// Writer id and chunk id, loaded with `Acquire`.
    pub fn identifier(&self) -> Identifier {
        Identifier::unpack(self.header().identifier.load(Ordering::Acquire))
    }

    /// Packet count and flags, loaded with `Acquire`.
    pub fn packet_count_and_flags(&self) -> Packets {
        Packets::unpack(self.header().packets.load(Ordering::Acquire))
    }

    /// Bumps the packet count, optionally flagging the last packet as
    /// continuing in the next chunk.
    ///
    /// Only the owning writer mutates the header while the chunk is
    /// `BeingWritten`, so no CAS is needed. The store is `Release` so a reader
    /// that sees the new count also sees the packet bytes.
    pub fn increment_packet_count(&mut self, last_packet_is_partial: bool) {
        let header = self.header();
        let mut packets = Packets::unpack(header.packets.load(Ordering::Relaxed));
        packets.count = packets.count.wrapping_add(1);
        if last_packet_is_partial {
            packets.flags |= Packets::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK;
        }
        header.packets.store(packets.pack(), Ordering::Release);
    }

    /// ORs `flags` into the packet flags.
    pub fn set_packet_flags(&mut self, flags: u8) {
        let header = self.header();
        let mut packets = Packets::unpack(header.packets.load(Ordering::Relaxed));
        packets.flags |= flags;
        header.packets.store(packets.pack(), Ordering::Release);
    }

    pub fn payload(&self) -> &[u8] {
        // SAFETY: the payload lies within the chunk, which lies within the
        // region. Only the holder of this token may write it.
        unsafe {
            core::slice::from_raw_parts(
                self.begin.as_ptr().add(CHUNK_HEADER_SIZE),
                self.payload_size(),
            )
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in `payload`, plus `&mut self` guarantees exclusivity
        // within this process and the chunk state excludes the reader.
        unsafe {
            core::slice::from_raw_parts_mut(
                self.begin.as_ptr().add(CHUNK_HEADER_SIZE),
                self.payload_size(),
            )
        }
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("begin", &self.begin)
            .field("size", &self.size)
            .finish()
    }
}

/// View over a caller-provided shared region.
///
/// Holds only the start pointer, the size, the page size and the chunk size
/// table derived from it. Several `SharedMemoryAbi` values (in one or several
/// processes) may describe the same memory concurrently.
pub struct SharedMemoryAbi {
    start: NonNull<u8>,
    size: usize,
    page_size: usize,
    num_pages: usize,
    chunk_sizes: [usize; NUM_PAGE_LAYOUTS],
}

// SAFETY: all shared state is reached through atomics in the page and chunk
// headers; the struct itself is immutable after construction.
unsafe impl Send for SharedMemoryAbi {}
unsafe impl Sync for SharedMemoryAbi {}

impl fmt::Debug for SharedMemoryAbi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMemoryAbi")
            .field("start", &self.start)
            .field("size", &self.size)
            .field("page_size", &self.page_size)
            .finish()
    }
}

impl SharedMemoryAbi {
    /// Creates a view over `region`, split into pages of `page_size` bytes.
    ///
    /// The region is not modified: a zero-filled region is a region where
    /// every page is unpartitioned, and an already populated region (e.g. the
    /// other side's mapping) is picked up as is.
    ///
    /// # Safety
    /// - `region` must point to readable and writable memory of `region.len()` bytes.
    /// - The memory must stay mapped for the lifetime of the returned value and of every
    ///   [`Chunk`] obtained from it.
    /// - The memory must only be modified through `SharedMemoryAbi` operations, in this process or
    ///   in any other process mapping it.
    pub unsafe fn new(region: NonNull<[u8]>, page_size: usize) -> Result<Self, AbiError> {
        let size = region.len();
        let start = region.cast::<u8>();
        Self::validate(start.as_ptr() as usize, size, page_size)?;

        let mut chunk_sizes = [0; NUM_PAGE_LAYOUTS];
        for (bits, chunk_size_slot) in chunk_sizes.iter_mut().enumerate() {
            let layout = PageLayout::from_bits(bits as u32);
            *chunk_size_slot = chunk_size(page_size, layout.num_chunks());
        }

        Ok(Self {
            start,
            size,
            page_size,
            num_pages: size / page_size,
            chunk_sizes,
        })
    }

    fn validate(start: usize, size: usize, page_size: usize) -> Result<(), AbiError> {
        if page_size % MIN_PAGE_SIZE != 0 {
            return Err(AbiError::PageSizeNotAligned(page_size));
        }
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(AbiError::PageSizeOutOfRange(page_size));
        }
        if size == 0 || size % page_size != 0 {
            return Err(AbiError::RegionSizeMismatch { size, page_size });
        }
        if start % 8 != 0 {
            return Err(AbiError::MisalignedStart(start));
        }
        Ok(())
    }

    /// Panic-free constructor for the FFI layer.
    ///
    /// # Safety
    /// Same requirements as [`new`](Self::new).
    #[cfg(feature = "ffi")]
    #[inline(always)]
    pub(crate) unsafe fn init_ffi(start: *mut u8, size: usize, page_size: usize) -> Option<Self> {
        let start = NonNull::new(start)?;
        Self::new(NonNull::slice_from_raw_parts(start, size), page_size).ok()
    }

    // -- Geometry -----------------------------------------------------------

    #[inline]
    pub fn start(&self) -> NonNull<u8> {
        self.start
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    /// Size of each chunk, header included, for a page partitioned as `layout`.
    #[inline]
    pub fn chunk_size_for_layout(&self, layout: PageLayout) -> usize {
        self.chunk_sizes[layout.bits() as usize]
    }

    #[inline]
    fn page_start(&self, page_idx: usize) -> *mut u8 {
        assert!(
            page_idx < self.num_pages,
            "page {page_idx} out of range ({} pages)",
            self.num_pages
        );
        // SAFETY: page_idx < num_pages, so the offset stays within the region.
        unsafe { self.start.as_ptr().add(page_idx * self.page_size) }
    }

    #[inline]
    fn page_header(&self, page_idx: usize) -> &PageHeader {
        // SAFETY: every page starts with a PageHeader and pages are 4096-byte
        // multiples from an 8-byte aligned start.
        unsafe { &*(self.page_start(page_idx) as *const PageHeader) }
    }

    /// Computes the chunk address for a layout already known to contain `chunk_idx`.
    fn chunk_unchecked(&self, page_idx: usize, layout: LayoutWord, chunk_idx: usize) -> Chunk {
        debug_assert!(chunk_idx < layout.num_chunks());
        let chunk_size = self.chunk_size_for_layout(layout.page_layout());
        let offset = PAGE_HEADER_SIZE + chunk_idx * chunk_size;
        // SAFETY: offset + chunk_size <= page_size by construction of the chunk size table.
        let begin = unsafe { NonNull::new_unchecked(self.page_start(page_idx).add(offset)) };
        Chunk::new(begin, chunk_size)
    }

    // -- Page state ---------------------------------------------------------

    /// Relaxed load of the layout word of a page.
    #[inline]
    pub fn layout_word(&self, page_idx: usize) -> LayoutWord {
        LayoutWord::from_raw(self.page_header(page_idx).layout.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn page_layout(&self, page_idx: usize) -> PageLayout {
        self.layout_word(page_idx).page_layout()
    }

    /// State of a chunk. `Free` if the page does not have that many chunks.
    #[inline]
    pub fn chunk_state(&self, page_idx: usize, chunk_idx: usize) -> ChunkState {
        self.layout_word(page_idx).chunk_state(chunk_idx)
    }

    #[inline]
    pub fn is_page_free(&self, page_idx: usize) -> bool {
        !self.layout_word(page_idx).is_partitioned()
    }

    #[inline]
    pub fn is_page_complete(&self, page_idx: usize) -> bool {
        self.layout_word(page_idx).all_chunks_in(ChunkState::Complete)
    }

    /// Bitmap of the `Free` chunks of a page.
    #[inline]
    pub fn get_free_chunks(&self, page_idx: usize) -> u32 {
        self.layout_word(page_idx).free_chunks()
    }

    /// Trace buffer the page belongs to. Only meaningful while partitioned.
    #[inline]
    pub fn target_buffer(&self, page_idx: usize) -> u16 {
        self.page_header(page_idx)
            .target_buffer
            .load(Ordering::Acquire)
    }

    /// Locates a chunk without changing its state.
    ///
    /// Returns `None` if the page is not partitioned with at least
    /// `chunk_idx + 1` chunks.
    ///
    /// # Safety
    /// The returned token does not own the chunk. The caller must already hold
    /// the chunk (e.g. as `BeingRead` after
    /// [`try_acquire_all_chunks_for_reading`](Self::try_acquire_all_chunks_for_reading)),
    /// or only use it for header loads.
    pub unsafe fn get_chunk(&self, page_idx: usize, chunk_idx: usize) -> Option<Chunk> {
        let layout = self.layout_word(page_idx);
        if chunk_idx >= layout.num_chunks() {
            return None;
        }
        Some(self.chunk_unchecked(page_idx, layout, chunk_idx))
    }

    /// Maps a chunk back to its `(page, chunk)` coordinates.
    ///
    /// Panics if the chunk does not belong to this region.
    pub fn page_and_chunk_index(&self, chunk: &Chunk) -> (usize, usize) {
        let start = self.start.as_ptr() as usize;
        let begin = chunk.begin_addr();
        assert!(
            begin >= start && begin + chunk.size() <= start + self.size,
            "chunk {begin:#x} is outside of the shared region"
        );
        let rel_addr = begin - start;
        let page_idx = rel_addr / self.page_size;
        let offset = rel_addr % self.page_size;
        assert!(offset >= PAGE_HEADER_SIZE, "chunk overlaps a page header");
        assert!(offset % CHUNK_ALIGNMENT == 0, "misaligned chunk");
        assert!(
            (offset - PAGE_HEADER_SIZE) % chunk.size() == 0,
            "chunk offset {offset} is not a multiple of its size {}",
            chunk.size()
        );
        let chunk_idx = (offset - PAGE_HEADER_SIZE) / chunk.size();
        assert!(chunk_idx < MAX_CHUNKS_PER_PAGE, "chunk index {chunk_idx} out of range");
        (page_idx, chunk_idx)
    }

    // -- Transitions --------------------------------------------------------

    /// Partitions an unpartitioned page and tags it with `target_buffer`.
    ///
    /// Returns `false`, with no side effect, if the page is already
    /// partitioned.
    pub fn try_partition_page(&self, page_idx: usize, layout: PageLayout, target_buffer: u16) -> bool {
        assert!(
            layout.num_chunks() > 0,
            "cannot partition a page with layout {layout:?}"
        );
        let header = self.page_header(page_idx);
        let next_layout = LayoutWord::partitioned(layout);
        if header
            .layout
            .compare_exchange(
                LayoutWord::EMPTY.raw(),
                next_layout.raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_err()
        {
            return false;
        }
        header.target_buffer.store(target_buffer, Ordering::Release);
        true
    }

    /// Moves one chunk `Free -> BeingWritten` or `Complete -> BeingRead`.
    ///
    /// `header` is required when acquiring for writing; its identifier and
    /// packets are written into the chunk with `Release` ordering.
    ///
    /// Returns `None` if the page layout does not have this chunk, if the
    /// chunk is not in the required state, or if the CAS lost against a
    /// concurrent change to any chunk of the page. Callers re-evaluate.
    pub fn try_acquire_chunk(
        &self,
        page_idx: usize,
        chunk_idx: usize,
        desired_state: ChunkState,
        header: Option<&ChunkHeader>,
    ) -> Option<Chunk> {
        let expected_state = match desired_state {
            ChunkState::BeingWritten => {
                assert!(header.is_some(), "acquiring a chunk for writing needs a header");
                ChunkState::Free
            }
            ChunkState::BeingRead => ChunkState::Complete,
            ChunkState::Free | ChunkState::Complete => {
                panic!("{desired_state} is not an acquire state")
            }
        };

        let page_header = self.page_header(page_idx);
        let layout = LayoutWord::from_raw(page_header.layout.load(Ordering::Relaxed));
        if chunk_idx >= layout.num_chunks() || layout.chunk_state(chunk_idx) != expected_state {
            return None;
        }

        let next_layout = layout.with_chunk_state(chunk_idx, desired_state);
        page_header
            .layout
            .compare_exchange(
                layout.raw(),
                next_layout.raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()?;

        let chunk = self.chunk_unchecked(page_idx, layout, chunk_idx);
        if let Some(header) = header.filter(|_| desired_state == ChunkState::BeingWritten) {
            let raw = chunk.header();
            raw.packets.store(header.packets.pack(), Ordering::Relaxed);
            raw.identifier
                .store(header.identifier.pack(), Ordering::Release);
        }
        Some(chunk)
    }

    #[inline]
    pub fn try_acquire_chunk_for_writing(
        &self,
        page_idx: usize,
        chunk_idx: usize,
        header: &ChunkHeader,
    ) -> Option<Chunk> {
        self.try_acquire_chunk(page_idx, chunk_idx, ChunkState::BeingWritten, Some(header))
    }

    #[inline]
    pub fn try_acquire_chunk_for_reading(&self, page_idx: usize, chunk_idx: usize) -> Option<Chunk> {
        self.try_acquire_chunk(page_idx, chunk_idx, ChunkState::BeingRead, None)
    }

    /// Moves a held chunk `BeingWritten -> Complete` or `BeingRead -> Free`.
    ///
    /// Returns `Ok(Some(page_idx))` only if this call brought every chunk of
    /// the page to the target state. Freeing the last non-free chunk also
    /// de-partitions the page (layout word back to 0).
    ///
    /// Retries up to [`MAX_RELEASE_ATTEMPTS`] times when other chunks of the
    /// same page change concurrently.
    ///
    /// Panics if the chunk is not in the expected precondition state.
    pub fn release_chunk(
        &self,
        chunk: Chunk,
        desired_state: ChunkState,
    ) -> Result<Option<usize>, ReleaseError> {
        self.release_chunk_bounded(chunk, desired_state, MAX_RELEASE_ATTEMPTS)
    }

    /// [`release_chunk`](Self::release_chunk) with an explicit retry budget.
    pub fn release_chunk_bounded(
        &self,
        chunk: Chunk,
        desired_state: ChunkState,
        max_attempts: u32,
    ) -> Result<Option<usize>, ReleaseError> {
        let expected_state = match desired_state {
            ChunkState::Complete => ChunkState::BeingWritten,
            ChunkState::Free => ChunkState::BeingRead,
            ChunkState::BeingWritten | ChunkState::BeingRead => {
                panic!("{desired_state} is not a release state")
            }
        };

        let (page_idx, chunk_idx) = self.page_and_chunk_index(&chunk);
        let page_header = self.page_header(page_idx);

        for _ in 0..max_attempts {
            let layout = LayoutWord::from_raw(page_header.layout.load(Ordering::Relaxed));
            assert_eq!(
                chunk.size(),
                self.chunk_size_for_layout(layout.page_layout()),
                "page {page_idx} was re-partitioned while chunk {chunk_idx} was held ({layout:?})"
            );
            let current_state = layout.chunk_state(chunk_idx);
            assert_eq!(
                current_state, expected_state,
                "chunk {chunk_idx} of page {page_idx} is {current_state}, cannot move it to {desired_state}"
            );

            let mut next_layout = layout.with_chunk_state(chunk_idx, desired_state);
            if next_layout.chunk_bits() == 0 {
                next_layout = LayoutWord::EMPTY;
            }

            if page_header
                .layout
                .compare_exchange(
                    layout.raw(),
                    next_layout.raw(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let terminal = LayoutWord::uniform_chunk_bits(layout.num_chunks(), desired_state);
                return Ok((next_layout.chunk_bits() == terminal).then_some(page_idx));
            }
            std::thread::yield_now();
        }

        Err(ReleaseError::RetriesExhausted {
            chunk,
            page_idx,
            chunk_idx,
            attempts: max_attempts,
        })
    }

    #[inline]
    pub fn release_chunk_as_complete(&self, chunk: Chunk) -> Result<Option<usize>, ReleaseError> {
        self.release_chunk(chunk, ChunkState::Complete)
    }

    #[inline]
    pub fn release_chunk_as_free(&self, chunk: Chunk) -> Result<Option<usize>, ReleaseError> {
        self.release_chunk(chunk, ChunkState::Free)
    }

    /// Claims every `Complete` chunk of a page for reading with a single CAS.
    ///
    /// Fails, with no side effect, if the page is unpartitioned, if any chunk
    /// is `BeingWritten`, or if the page changed concurrently. `Free` chunks
    /// stay `Free`.
    pub fn try_acquire_all_chunks_for_reading(&self, page_idx: usize) -> bool {
        let page_header = self.page_header(page_idx);
        let layout = LayoutWord::from_raw(page_header.layout.load(Ordering::Relaxed));
        let num_chunks = layout.num_chunks();
        if num_chunks == 0 {
            return false;
        }

        let mut next_layout = LayoutWord::partitioned(layout.page_layout());
        for chunk_idx in 0..num_chunks {
            let next_state = match layout.chunk_state(chunk_idx) {
                ChunkState::BeingWritten => return false,
                ChunkState::Complete | ChunkState::BeingRead => ChunkState::BeingRead,
                ChunkState::Free => ChunkState::Free,
            };
            next_layout = next_layout.with_chunk_state(chunk_idx, next_state);
        }

        page_header
            .layout
            .compare_exchange(
                layout.raw(),
                next_layout.raw(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Reader-side bulk release of a page claimed with
    /// [`try_acquire_all_chunks_for_reading`](Self::try_acquire_all_chunks_for_reading).
    ///
    /// Every `BeingRead` chunk becomes `Free`. Chunks a producer picked up in
    /// the meantime are left alone. Returns `true` if the page ended up
    /// unpartitioned, in which case the operating system is told its backing
    /// memory can be dropped. A page that was already unpartitioned is left
    /// untouched and reports `false`.
    pub fn release_all_chunks_as_free(&self, page_idx: usize) -> bool {
        let page_header = self.page_header(page_idx);
        let mut released = false;
        for _ in 0..MAX_RELEASE_ATTEMPTS {
            let layout = LayoutWord::from_raw(page_header.layout.load(Ordering::Relaxed));
            if !layout.is_partitioned() {
                // A producer may partition this page at any moment.
                return false;
            }
            let mut next_layout = layout;
            for chunk_idx in 0..layout.num_chunks() {
                if layout.chunk_state(chunk_idx) == ChunkState::BeingRead {
                    next_layout = next_layout.with_chunk_state(chunk_idx, ChunkState::Free);
                }
            }
            if next_layout.chunk_bits() == 0 {
                next_layout = LayoutWord::EMPTY;
            }
            if page_header
                .layout
                .compare_exchange(
                    layout.raw(),
                    next_layout.raw(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                released = !next_layout.is_partitioned();
                break;
            }
            std::thread::yield_now();
        }

        if released {
            self.advise_page_unused(page_idx);
        }
        released
    }

    /// Hints the kernel that the page contents are garbage. The region is
    /// expected to be a shared mapping, which keeps its contents; this only
    /// lowers memory pressure. Failures are ignored.
    #[cfg(unix)]
    fn advise_page_unused(&self, page_idx: usize) {
        // SAFETY: sysconf has no preconditions.
        let os_page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_start = self.page_start(page_idx);
        if os_page_size <= 0
            || page_start as usize % os_page_size as usize != 0
            || self.page_size % os_page_size as usize != 0
        {
            return;
        }
        // SAFETY: the range is one page of the region, aligned to OS pages.
        let ret = unsafe {
            libc::madvise(
                page_start as *mut libc::c_void,
                self.page_size,
                libc::MADV_DONTNEED,
            )
        };
        if ret != 0 {
            tracing::debug!(
                "madvise(MADV_DONTNEED) failed for page {page_idx}: {}",
                std::io::Error::last_os_error()
            );
        }
    }

    #[cfg(not(unix))]
    fn advise_page_unused(&self, _page_idx: usize) {}
}
