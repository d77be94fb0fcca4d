// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Consumer side: drains complete pages and rebuilds packets.

use crate::abi::{Chunk, SharedMemoryAbi};
use crate::header::{Packets, MAX_CHUNK_ID};
use crate::layout::ChunkState;
use crate::trace_writer::FRAGMENT_HEADER_SIZE;
use std::collections::BTreeMap;
use tracing::warn;

/// Copy of one chunk taken while it was `BeingRead`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk {
    pub page_idx: usize,
    pub chunk_idx: usize,
    pub writer_id: u16,
    pub chunk_id: u32,
    pub target_buffer: u16,
    pub packet_count: u16,
    pub flags: u8,
    pub fragments: Vec<Vec<u8>>,
}

/// A whole packet, possibly joined from several chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub writer_id: u16,
    pub target_buffer: u16,
    pub data: Vec<u8>,
}

/// Claims every `Complete` chunk of a page, copies them out and frees them.
///
/// Returns `None` if the page could not be claimed: unpartitioned, a chunk
/// still `BeingWritten`, or a concurrent change.
pub fn read_page(abi: &SharedMemoryAbi, page_idx: usize) -> Option<Vec<ReadChunk>> {
    if !abi.try_acquire_all_chunks_for_reading(page_idx) {
        return None;
    }

    let target_buffer = abi.target_buffer(page_idx);
    let word = abi.layout_word(page_idx);
    let mut chunks = Vec::new();
    for chunk_idx in 0..word.num_chunks() {
        if word.chunk_state(chunk_idx) != ChunkState::BeingRead {
            continue;
        }
        // SAFETY: the chunk is BeingRead and only this reader frees it.
        let Some(chunk) = (unsafe { abi.get_chunk(page_idx, chunk_idx) }) else {
            continue;
        };
        chunks.push(copy_chunk(&chunk, page_idx, chunk_idx, target_buffer));
    }

    if !chunks.is_empty() {
        abi.release_all_chunks_as_free(page_idx);
    }
    Some(chunks)
}

fn copy_chunk(chunk: &Chunk, page_idx: usize, chunk_idx: usize, target_buffer: u16) -> ReadChunk {
    let identifier = chunk.identifier();
    let packets = chunk.packet_count_and_flags();
    let payload = chunk.payload();

    let mut fragments = Vec::with_capacity(packets.count as usize);
    let mut offset = 0;
    for _ in 0..packets.count {
        let Some(len_bytes) = payload.get(offset..offset + FRAGMENT_HEADER_SIZE) else {
            break;
        };
        let mut len = [0; FRAGMENT_HEADER_SIZE];
        len.copy_from_slice(len_bytes);
        let len = u32::from_le_bytes(len) as usize;
        offset += FRAGMENT_HEADER_SIZE;
        let Some(data) = payload.get(offset..offset + len) else {
            break;
        };
        fragments.push(data.to_vec());
        offset += len;
    }
    if fragments.len() != packets.count as usize {
        warn!(
            page_idx,
            chunk_idx,
            packets = packets.count,
            parsed = fragments.len(),
            "Chunk payload is truncated"
        );
    }

    ReadChunk {
        page_idx,
        chunk_idx,
        writer_id: identifier.writer_id,
        chunk_id: identifier.chunk_id,
        target_buffer,
        packet_count: packets.count,
        flags: packets.flags,
        fragments,
    }
}

/// Joins fragments split across chunks into whole packets.
///
/// Chunks are grouped per writer and ordered by chunk id. A continuation is
/// only joined to the chunk id right before it; packets whose head or tail is
/// missing are discarded.
pub fn reassemble(chunks: impl IntoIterator<Item = ReadChunk>) -> Vec<Packet> {
    let mut by_writer: BTreeMap<u16, Vec<ReadChunk>> = BTreeMap::new();
    for chunk in chunks {
        by_writer.entry(chunk.writer_id).or_default().push(chunk);
    }

    let mut packets = Vec::new();
    for (writer_id, mut chunks) in by_writer {
        sort_by_chunk_id(&mut chunks);

        let mut pending: Option<Vec<u8>> = None;
        let mut prev_chunk_id: Option<u32> = None;
        for chunk in chunks {
            let contiguous =
                prev_chunk_id.is_some_and(|prev| (prev + 1) & MAX_CHUNK_ID == chunk.chunk_id);
            let head = pending.take().filter(|_| contiguous);
            let flags = Packets {
                count: chunk.packet_count,
                flags: chunk.flags,
            };
            let num_fragments = chunk.fragments.len();
            let mut head = Some(head);

            for (i, fragment) in chunk.fragments.into_iter().enumerate() {
                let data = match head.take() {
                    Some(head)
                        if flags.has_flag(Packets::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK) =>
                    {
                        head.map(|mut head| {
                            head.extend_from_slice(&fragment);
                            head
                        })
                    }
                    _ => Some(fragment),
                };

                let is_last = i + 1 == num_fragments;
                if is_last && flags.has_flag(Packets::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK) {
                    pending = data;
                } else if let Some(data) = data {
                    packets.push(Packet {
                        writer_id,
                        target_buffer: chunk.target_buffer,
                        data,
                    });
                }
            }
            prev_chunk_id = Some(chunk.chunk_id);
        }
    }
    packets
}

/// Orders one writer's chunks by id, across the wrap at [`MAX_CHUNK_ID`].
///
/// The sequence is assumed to start right after the largest gap between ids,
/// the wrap-around gap from the last id to the first included.
fn sort_by_chunk_id(chunks: &mut [ReadChunk]) {
    chunks.sort_by_key(|chunk| chunk.chunk_id);
    let (Some(first), Some(last)) = (chunks.first(), chunks.last()) else {
        return;
    };
    let mut base = first.chunk_id;
    let mut largest_gap = first.chunk_id.wrapping_sub(last.chunk_id) & MAX_CHUNK_ID;
    for pair in chunks.windows(2) {
        let gap = pair[1].chunk_id - pair[0].chunk_id;
        if gap > largest_gap {
            largest_gap = gap;
            base = pair[1].chunk_id;
        }
    }
    chunks.sort_by_key(|chunk| chunk.chunk_id.wrapping_sub(base) & MAX_CHUNK_ID);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(writer_id: u16, chunk_id: u32, flags: u8, fragments: &[&[u8]]) -> ReadChunk {
        ReadChunk {
            page_idx: 0,
            chunk_idx: 0,
            writer_id,
            chunk_id,
            target_buffer: 0,
            packet_count: fragments.len() as u16,
            flags,
            fragments: fragments.iter().map(|f| f.to_vec()).collect(),
        }
    }

    const FIRST: u8 = Packets::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK;
    const LAST: u8 = Packets::LAST_PACKET_CONTINUES_ON_NEXT_CHUNK;

    fn data(packets: Vec<Packet>) -> Vec<Vec<u8>> {
        packets.into_iter().map(|p| p.data).collect()
    }

    #[test]
    fn joins_out_of_order_chunks() {
        let packets = reassemble(vec![
            chunk(1, 1, FIRST | LAST, &[b"cd"]),
            chunk(1, 0, LAST, &[b"a", b"b"]),
            chunk(1, 2, FIRST, &[b"e", b"f"]),
        ]);
        assert_eq!(data(packets), vec![b"a".to_vec(), b"bcde".to_vec(), b"f".to_vec()]);
    }

    #[test]
    fn writers_are_kept_apart() {
        let packets = reassemble(vec![
            chunk(2, 0, LAST, &[b"x"]),
            chunk(1, 0, LAST, &[b"a"]),
            chunk(1, 1, FIRST, &[b"b"]),
            chunk(2, 1, FIRST, &[b"y"]),
        ]);
        let got: Vec<_> = packets.iter().map(|p| (p.writer_id, p.data.clone())).collect();
        assert_eq!(got, vec![(1, b"ab".to_vec()), (2, b"xy".to_vec())]);
    }

    #[test]
    fn orphan_fragments_are_dropped() {
        let packets = reassemble(vec![
            // Head chunk 0 never made it, chunk 1 starts with a continuation.
            chunk(1, 1, FIRST, &[b"lost", b"ok"]),
            // Gap in chunk ids: the head in chunk 3 cannot be joined to chunk 5.
            chunk(1, 3, LAST, &[b"head"]),
            chunk(1, 5, FIRST, &[b"tail", b"ok2"]),
            // Writer gave up mid-packet: next chunk does not continue it.
            chunk(1, 6, LAST, &[b"partial"]),
            chunk(1, 7, 0, &[b"fresh"]),
        ]);
        assert_eq!(
            data(packets),
            vec![b"ok".to_vec(), b"ok2".to_vec(), b"fresh".to_vec()]
        );
    }

    #[test]
    fn chunk_ids_wrap_around() {
        let packets = reassemble(vec![
            chunk(1, 1, 0, &[b"after"]),
            chunk(1, 0, FIRST, &[b"ad", b"z"]),
            chunk(1, MAX_CHUNK_ID, LAST, &[b"a", b"he"]),
            chunk(1, MAX_CHUNK_ID - 1, 0, &[b"before"]),
        ]);
        assert_eq!(
            data(packets),
            vec![
                b"before".to_vec(),
                b"a".to_vec(),
                b"head".to_vec(),
                b"z".to_vec(),
                b"after".to_vec()
            ]
        );
    }
}
