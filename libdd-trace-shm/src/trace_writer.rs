// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread writer that serializes packets into arbiter chunks.
//!
//! Each packet is stored as one or more fragments, each framed as
//! `[u32 little-endian length][bytes]` and counted as one packet in the chunk
//! header. A packet that does not fit in the current chunk is split: the
//! chunk holding the head gets `LAST_PACKET_CONTINUES_ON_NEXT_CHUNK`, the next
//! chunk of the same writer gets `FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK`.

use crate::abi::Chunk;
use crate::arbiter::SharedMemoryArbiter;
use crate::header::{ChunkHeader, Identifier, Packets, WriterId, MAX_CHUNK_ID};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Size of the length prefix of a fragment.
pub const FRAGMENT_HEADER_SIZE: usize = 4;

/// What a writer does when the arbiter has no chunk to give.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Give up on the packet right away.
    Drop,
    /// Sleep `interval` between attempts, then give up after `max_attempts`.
    Stall { max_attempts: u32, interval: Duration },
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WriterError {
    #[error("packet dropped, no shared memory chunk available")]
    Dropped,
}

pub struct TraceWriter {
    arbiter: Arc<SharedMemoryArbiter>,
    writer_id: WriterId,
    target_buffer: u16,
    policy: BackpressurePolicy,
    next_chunk_id: u32,
    chunk: Option<Chunk>,
    /// Write offset into the payload of `chunk`.
    offset: usize,
    dropped_packets: u64,
}

impl TraceWriter {
    pub fn new(
        arbiter: Arc<SharedMemoryArbiter>,
        target_buffer: u16,
        policy: BackpressurePolicy,
    ) -> Self {
        let writer_id = arbiter.acquire_writer_id();
        Self {
            arbiter,
            writer_id,
            target_buffer,
            policy,
            next_chunk_id: 0,
            chunk: None,
            offset: 0,
            dropped_packets: 0,
        }
    }

    pub fn writer_id(&self) -> WriterId {
        self.writer_id
    }

    pub fn target_buffer(&self) -> u16 {
        self.target_buffer
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets
    }

    /// Appends one packet. On [`WriterError::Dropped`] the packet is lost; any
    /// head already written is discarded by the reader.
    pub fn write_packet(&mut self, mut packet: &[u8]) -> Result<(), WriterError> {
        let mut continues_from_prev = false;
        loop {
            // An empty packet still needs its length prefix.
            let needed = FRAGMENT_HEADER_SIZE + packet.len().min(1);
            if self.room() < needed {
                self.return_chunk();
                if let Err(e) = self.acquire_chunk(continues_from_prev) {
                    self.dropped_packets += 1;
                    return Err(e);
                }
            }

            let Some(chunk) = self.chunk.as_mut() else {
                return Err(WriterError::Dropped);
            };
            let len = packet.len().min(chunk.payload_size() - self.offset - FRAGMENT_HEADER_SIZE);
            let payload = chunk.payload_mut();
            payload[self.offset..self.offset + FRAGMENT_HEADER_SIZE]
                .copy_from_slice(&(len as u32).to_le_bytes());
            self.offset += FRAGMENT_HEADER_SIZE;
            payload[self.offset..self.offset + len].copy_from_slice(&packet[..len]);
            self.offset += len;
            packet = &packet[len..];

            let partial = !packet.is_empty();
            chunk.increment_packet_count(partial);
            if !partial {
                return Ok(());
            }
            continues_from_prev = true;
        }
    }

    /// Hands the current chunk, if any, back to the arbiter as `Complete`.
    pub fn flush(&mut self) {
        self.return_chunk();
    }

    fn room(&self) -> usize {
        self.chunk
            .as_ref()
            .map_or(0, |chunk| chunk.payload_size() - self.offset)
    }

    fn return_chunk(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            self.arbiter.return_completed_chunk(chunk);
        }
        self.offset = 0;
    }

    fn acquire_chunk(&mut self, continues_from_prev: bool) -> Result<(), WriterError> {
        let header = ChunkHeader {
            identifier: Identifier::new(self.writer_id, self.next_chunk_id),
            packets: Packets {
                count: 0,
                flags: if continues_from_prev {
                    Packets::FIRST_PACKET_CONTINUES_FROM_PREV_CHUNK
                } else {
                    0
                },
            },
        };

        let (max_attempts, interval) = match self.policy {
            BackpressurePolicy::Drop => (1, Duration::ZERO),
            BackpressurePolicy::Stall {
                max_attempts,
                interval,
            } => (max_attempts.max(1), interval),
        };
        for attempt in 1..=max_attempts {
            match self.arbiter.get_new_chunk(&header, self.target_buffer, 0) {
                Ok(chunk) => {
                    self.chunk = Some(chunk);
                    self.offset = 0;
                    self.next_chunk_id = (self.next_chunk_id + 1) & MAX_CHUNK_ID;
                    return Ok(());
                }
                Err(_) if attempt < max_attempts => std::thread::sleep(interval),
                Err(_) => {}
            }
        }
        debug!(
            writer_id = self.writer_id.get(),
            target_buffer = self.target_buffer,
            "Dropping packet, shared memory is full"
        );
        Err(WriterError::Dropped)
    }
}

impl Drop for TraceWriter {
    fn drop(&mut self) {
        self.flush();
        self.arbiter.release_writer_id(self.writer_id);
    }
}

impl std::fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter")
            .field("writer_id", &self.writer_id)
            .field("target_buffer", &self.target_buffer)
            .field("policy", &self.policy)
            .field("next_chunk_id", &self.next_chunk_id)
            .finish()
    }
}
