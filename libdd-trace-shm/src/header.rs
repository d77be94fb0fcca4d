// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Page and chunk headers as laid out in the shared region.
//!
//! ```text
//! page:   +---------------+-------------------+----------+
//!         | layout: u32   | target_buffer: u16| rsvd: u16|
//!         +---------------+-------------------+----------+
//! chunk:  +---------------------------+--------------------+
//!         | identifier: u32           | packets: u32       |
//!         | 0..22 chunk_id            | 0..16 count        |
//!         | 22..32 writer_id          | 16..24 flags       |
//!         +---------------------------+--------------------+
//! ```
//!
//! Words are in host byte order. The in-memory structs are only ever reached
//! through [`SharedMemoryAbi`](crate::SharedMemoryAbi); the plain value types
//! ([`Identifier`], [`Packets`], [`ChunkHeader`]) are what callers handle.

use core::mem;
use core::num::NonZeroU16;
use core::sync::atomic::{AtomicU16, AtomicU32};

pub const PAGE_HEADER_SIZE: usize = 8;
pub const CHUNK_HEADER_SIZE: usize = 8;
pub const CHUNK_ALIGNMENT: usize = 4;

/// Largest writer id that fits in the 10-bit field. Id 0 is never handed out.
pub const MAX_WRITER_ID: u16 = (1 << 10) - 1;

/// Chunk ids wrap around after this value.
pub const MAX_CHUNK_ID: u32 = (1 << 22) - 1;

/// Number of distinct target buffers a page can point to.
pub const MAX_TRACE_BUFFERS: usize = 1 << 16;

const CHUNK_ID_BITS: u32 = 22;
const WRITER_ID_MASK: u32 = MAX_WRITER_ID as u32;

#[repr(C)]
pub(crate) struct PageHeader {
    pub(crate) layout: AtomicU32,
    pub(crate) target_buffer: AtomicU16,
    _reserved: u16,
}

#[repr(C)]
pub(crate) struct RawChunkHeader {
    pub(crate) identifier: AtomicU32,
    pub(crate) packets: AtomicU32,
}

const _: () = assert!(mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);
const _: () = assert!(mem::size_of::<RawChunkHeader>() == CHUNK_HEADER_SIZE);
const _: () = assert!(mem::align_of::<RawChunkHeader>() == CHUNK_ALIGNMENT);
const _: () = assert!(mem::size_of::<AtomicU32>() == mem::size_of::<u32>());
const _: () = assert!(mem::size_of::<AtomicU16>() == mem::size_of::<u16>());

/// Identity of one producer-side writer, embedded in every chunk it writes.
///
/// Always in `1..=MAX_WRITER_ID`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriterId(NonZeroU16);

impl WriterId {
    #[inline]
    pub const fn new(id: u16) -> Option<Self> {
        if id > MAX_WRITER_ID {
            return None;
        }
        match NonZeroU16::new(id) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

/// Decoded `identifier` word of a chunk header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Identifier {
    /// Raw writer id. 0 means the chunk was never written.
    pub writer_id: u16,
    pub chunk_id: u32,
}

impl Identifier {
    pub const fn new(writer_id: WriterId, chunk_id: u32) -> Self {
        Self {
            writer_id: writer_id.get(),
            chunk_id: chunk_id & MAX_CHUNK_ID,
        }
    }

    #[inline]
    pub const fn pack(self) -> u32 {
        (self.chunk_id & MAX_CHUNK_ID) | ((self.writer_id as u32 & WRITER_ID_MASK) << CHUNK_ID_BITS)
    }

    #[inline]
    pub const fn unpack(raw: u32) -> Self {
        Self {
            writer_id: ((raw >> CHUNK_ID_BITS) & WRITER_ID_MASK) as u16,
            chunk_id: raw & MAX_CHUNK_ID,
        }
    }
}

/// Decoded `packets` word of a chunk header.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Packets {
    pub count: u16,
    pub flags: u8,
}

impl Packets {
    /// The first packet of this chunk is the tail of the last packet of the
    /// previous chunk of the same writer.
    pub const FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK: u8 = 1 << 0;

    /// The last packet of this chunk continues into the next chunk of the
    /// same writer.
    pub const LAST_PACKET_CONTINUES_ON_NEXT_CHUNK: u8 = 1 << 1;

    #[inline]
    pub const fn pack(self) -> u32 {
        self.count as u32 | ((self.flags as u32) << 16)
    }

    #[inline]
    pub const fn unpack(raw: u32) -> Self {
        Self {
            count: raw as u16,
            flags: (raw >> 16) as u8,
        }
    }

    #[inline]
    pub const fn has_flag(self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Initial chunk header contents, written when a chunk becomes `BeingWritten`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkHeader {
    pub identifier: Identifier,
    pub packets: Packets,
}
