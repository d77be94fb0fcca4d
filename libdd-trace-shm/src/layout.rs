// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The page layout word.
//!
//! Every page header starts with one `u32` that packs the partitioning of the
//! page together with the state of each of its chunks:
//!
//! ```text
//!  31  30..28   27..26  ...   3..2     1..0
//! +---+-------+--------+-----+--------+--------+
//! | 0 | layout| chunk13| ... | chunk1 | chunk0 |
//! +---+-------+--------+-----+--------+--------+
//! ```
//!
//! All per-chunk states of a page change together through a single CAS on
//! this word, so a reader never observes a half-applied transition.

use core::fmt;
use serde::{Deserialize, Serialize};

/// Maximum number of chunks a page can be divided into.
pub const MAX_CHUNKS_PER_PAGE: usize = 14;

/// Width in bits of one chunk state.
pub const CHUNK_SHIFT: u32 = 2;

/// Mask of one chunk state, before shifting.
pub const CHUNK_MASK: u32 = 0b11;

/// Bits of the layout word holding chunk states.
pub const ALL_CHUNKS_MASK: u32 = 0x0FFF_FFFF;

/// Bits of the layout word holding the [`PageLayout`].
pub const LAYOUT_MASK: u32 = 0x7000_0000;

/// Position of the [`PageLayout`] within the layout word.
pub const LAYOUT_SHIFT: u32 = 28;

/// Number of encodable page layouts (3 bits).
pub const NUM_PAGE_LAYOUTS: usize = 8;

/// State of a single chunk. Encoded on 2 bits in the layout word.
///
/// Allowed transitions:
/// - `Free -> BeingWritten` (producer)
/// - `BeingWritten -> Complete` (producer)
/// - `Complete -> BeingRead` (reader)
/// - `BeingRead -> Free` (reader)
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChunkState {
    Free = 0,
    BeingWritten = 1,
    BeingRead = 2,
    Complete = 3,
}

impl ChunkState {
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & CHUNK_MASK {
            0 => Self::Free,
            1 => Self::BeingWritten,
            2 => Self::BeingRead,
            _ => Self::Complete,
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "Free",
            Self::BeingWritten => "BeingWritten",
            Self::BeingRead => "BeingRead",
            Self::Complete => "Complete",
        }
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many equal chunks a page is divided into.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageLayout {
    /// The page is not partitioned. Its layout word is 0.
    NotPartitioned = 0,
    Div1 = 1,
    Div2 = 2,
    Div4 = 3,
    Div7 = 4,
    Div14 = 5,
    /// Reserved encodings, they have no chunks.
    Reserved1 = 6,
    Reserved2 = 7,
}

impl PageLayout {
    /// All layouts that actually carry chunks, from the fewest to the most chunks.
    pub const PARTITIONED: [PageLayout; 5] = [
        PageLayout::Div1,
        PageLayout::Div2,
        PageLayout::Div4,
        PageLayout::Div7,
        PageLayout::Div14,
    ];

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 0b111 {
            0 => Self::NotPartitioned,
            1 => Self::Div1,
            2 => Self::Div2,
            3 => Self::Div4,
            4 => Self::Div7,
            5 => Self::Div14,
            6 => Self::Reserved1,
            _ => Self::Reserved2,
        }
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    #[inline]
    pub const fn num_chunks(self) -> usize {
        match self {
            Self::Div1 => 1,
            Self::Div2 => 2,
            Self::Div4 => 4,
            Self::Div7 => 7,
            Self::Div14 => 14,
            Self::NotPartitioned | Self::Reserved1 | Self::Reserved2 => 0,
        }
    }

    /// Maps a chunks-per-page count (1, 2, 4, 7 or 14) to its layout.
    pub const fn from_chunks_per_page(chunks: usize) -> Option<Self> {
        match chunks {
            1 => Some(Self::Div1),
            2 => Some(Self::Div2),
            4 => Some(Self::Div4),
            7 => Some(Self::Div7),
            14 => Some(Self::Div14),
            _ => None,
        }
    }
}

/// Decoded view of a page layout word.
///
/// This is a plain value: loading and storing it is the job of
/// [`SharedMemoryAbi`](crate::SharedMemoryAbi).
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct LayoutWord(u32);

impl LayoutWord {
    /// The layout word of an unpartitioned page.
    pub const EMPTY: LayoutWord = LayoutWord(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// A freshly partitioned page: the given layout with every chunk `Free`.
    #[inline]
    pub const fn partitioned(layout: PageLayout) -> Self {
        Self((layout.bits() << LAYOUT_SHIFT) & LAYOUT_MASK)
    }

    #[inline]
    pub const fn page_layout(self) -> PageLayout {
        PageLayout::from_bits((self.0 & LAYOUT_MASK) >> LAYOUT_SHIFT)
    }

    #[inline]
    pub const fn num_chunks(self) -> usize {
        self.page_layout().num_chunks()
    }

    #[inline]
    pub const fn is_partitioned(self) -> bool {
        self.0 != 0
    }

    #[inline]
    pub const fn chunk_bits(self) -> u32 {
        self.0 & ALL_CHUNKS_MASK
    }

    /// State of chunk `chunk_idx`. Slots past the current partition count
    /// decode as `Free`.
    #[inline]
    pub const fn chunk_state(self, chunk_idx: usize) -> ChunkState {
        if chunk_idx >= self.num_chunks() {
            return ChunkState::Free;
        }
        ChunkState::from_bits(self.0 >> (chunk_idx as u32 * CHUNK_SHIFT))
    }

    /// Returns a copy with only the 2 bits of `chunk_idx` replaced.
    #[inline]
    #[must_use]
    pub const fn with_chunk_state(self, chunk_idx: usize, state: ChunkState) -> Self {
        let shift = chunk_idx as u32 * CHUNK_SHIFT;
        Self((self.0 & !(CHUNK_MASK << shift)) | (state.bits() << shift))
    }

    /// True if the page is partitioned and every one of its chunks is in `state`.
    pub const fn all_chunks_in(self, state: ChunkState) -> bool {
        let num_chunks = self.num_chunks();
        if num_chunks == 0 {
            return false;
        }
        self.chunk_bits() == Self::uniform_chunk_bits(num_chunks, state)
    }

    /// Chunk bits of a page where the first `num_chunks` chunks are in `state`.
    pub(crate) const fn uniform_chunk_bits(num_chunks: usize, state: ChunkState) -> u32 {
        let mut bits = 0;
        let mut i = 0;
        while i < num_chunks {
            bits |= state.bits() << (i as u32 * CHUNK_SHIFT);
            i += 1;
        }
        bits
    }

    /// Bitmap with bit `i` set for every `Free` chunk of the current layout.
    pub const fn free_chunks(self) -> u32 {
        let mut res = 0;
        let mut i = 0;
        while i < self.num_chunks() {
            if let ChunkState::Free = self.chunk_state(i) {
                res |= 1 << i;
            }
            i += 1;
        }
        res
    }
}

impl fmt::Debug for LayoutWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ", self.page_layout())?;
        f.debug_list()
            .entries((0..self.num_chunks()).map(|i| self.chunk_state(i)))
            .finish()
    }
}
