// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libdd_trace_shm::{
    Chunk, ChunkHeader, ChunkState, Identifier, MappedRegion, PageLayout, Packets, ReleaseError,
    SharedMemoryAbi, WriterId,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const PAGE_SIZE: usize = 4096;

fn header(writer: u16, chunk_id: u32) -> ChunkHeader {
    ChunkHeader {
        identifier: Identifier::new(WriterId::new(writer).unwrap(), chunk_id),
        packets: Packets::default(),
    }
}

/// Releases until the CAS goes through, however contended the page is.
fn release(abi: &SharedMemoryAbi, mut chunk: Chunk, state: ChunkState) -> Option<usize> {
    loop {
        match abi.release_chunk(chunk, state) {
            Ok(page) => return page,
            Err(ReleaseError::RetriesExhausted { chunk: c, .. }) => chunk = c,
        }
    }
}

#[test]
fn partition_has_a_single_winner() {
    const THREADS: usize = 8;
    for _ in 0..50 {
        let region = MappedRegion::anonymous(PAGE_SIZE).unwrap();
        let abi = unsafe { SharedMemoryAbi::new(region.as_non_null(), PAGE_SIZE).unwrap() };
        let barrier = Barrier::new(THREADS);
        let winners = AtomicUsize::new(0);

        thread::scope(|s| {
            for t in 0..THREADS {
                let (abi, barrier, winners) = (&abi, &barrier, &winners);
                s.spawn(move || {
                    barrier.wait();
                    let layout = PageLayout::PARTITIONED[t % PageLayout::PARTITIONED.len()];
                    if abi.try_partition_page(0, layout, t as u16) {
                        winners.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(abi.page_layout(0), layout);
                        assert_eq!(abi.target_buffer(0), t as u16);
                    }
                });
            }
        });
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }
}

/// Producers and readers hammer the same pages. Every chunk a thread holds
/// is stamped with its id; another thread ever seeing that stamp change
/// under it means two threads held the chunk at once.
#[test]
fn chunks_are_held_by_one_thread_at_a_time() {
    const PRODUCERS: u16 = 4;
    const READERS: usize = 2;
    const ITERATIONS: usize = 2000;
    const NUM_PAGES: usize = 2;

    let region = MappedRegion::anonymous(NUM_PAGES * PAGE_SIZE).unwrap();
    let abi = unsafe { SharedMemoryAbi::new(region.as_non_null(), PAGE_SIZE).unwrap() };
    let written = AtomicUsize::new(0);
    let read = AtomicUsize::new(0);

    thread::scope(|s| {
        for writer in 1..=PRODUCERS {
            let (abi, written) = (&abi, &written);
            s.spawn(move || {
                let mut chunk_id = 0;
                for i in 0..ITERATIONS {
                    let page = i % NUM_PAGES;
                    abi.try_partition_page(page, PageLayout::Div4, 0);
                    let free = abi.get_free_chunks(page);
                    if free == 0 {
                        thread::yield_now();
                        continue;
                    }
                    let idx = free.trailing_zeros() as usize;
                    let Some(mut chunk) =
                        abi.try_acquire_chunk_for_writing(page, idx, &header(writer, chunk_id))
                    else {
                        continue;
                    };
                    chunk_id += 1;
                    let stamp = writer as u8;
                    chunk.payload_mut().fill(stamp);
                    thread::yield_now();
                    assert!(chunk.payload().iter().all(|b| *b == stamp));
                    assert_eq!(chunk.identifier().writer_id, writer);
                    release(abi, chunk, ChunkState::Complete);
                    written.fetch_add(1, Ordering::Relaxed);
                }
            });
        }

        for reader in 0..READERS {
            let (abi, read) = (&abi, &read);
            s.spawn(move || {
                let stamp = 0x80 | reader as u8;
                for i in 0..ITERATIONS * 2 {
                    let page = i % NUM_PAGES;
                    for idx in 0..4 {
                        if abi.chunk_state(page, idx) != ChunkState::Complete {
                            continue;
                        }
                        let Some(mut chunk) = abi.try_acquire_chunk_for_reading(page, idx) else {
                            continue;
                        };
                        // The writer's last pass over the payload is visible.
                        let writer = chunk.identifier().writer_id as u8;
                        assert!(chunk.payload().iter().all(|b| *b == writer));
                        chunk.payload_mut().fill(stamp);
                        thread::yield_now();
                        assert!(chunk.payload().iter().all(|b| *b == stamp));
                        release(abi, chunk, ChunkState::Free);
                        read.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    assert!(written.load(Ordering::Relaxed) > 0);
    assert!(read.load(Ordering::Relaxed) <= written.load(Ordering::Relaxed));
}

/// Producer and reader each build their own view of the mapping, as two
/// processes would, and only communicate through the page atomics.
#[test]
fn payload_round_trips_between_two_views() {
    const NUM_PAGES: usize = 4;
    const PACKETS: u32 = 500;

    let region = Arc::new(MappedRegion::anonymous(NUM_PAGES * PAGE_SIZE).unwrap());

    let producer = {
        let region = region.clone();
        thread::spawn(move || {
            let abi = unsafe { SharedMemoryAbi::new(region.as_non_null(), PAGE_SIZE).unwrap() };
            let mut sent = 0;
            let mut page = 0;
            while sent < PACKETS {
                abi.try_partition_page(page, PageLayout::Div7, 9);
                let free = abi.get_free_chunks(page);
                if free == 0 || abi.target_buffer(page) != 9 {
                    page = (page + 1) % NUM_PAGES;
                    thread::yield_now();
                    continue;
                }
                let idx = free.trailing_zeros() as usize;
                let Some(mut chunk) = abi.try_acquire_chunk_for_writing(page, idx, &header(1, sent))
                else {
                    continue;
                };
                let bytes = sent.to_le_bytes();
                for part in chunk.payload_mut().chunks_exact_mut(4) {
                    part.copy_from_slice(&bytes);
                }
                chunk.increment_packet_count(false);
                release(&abi, chunk, ChunkState::Complete);
                sent += 1;
            }
        })
    };

    let abi = unsafe { SharedMemoryAbi::new(region.as_non_null(), PAGE_SIZE).unwrap() };
    let mut received = vec![false; PACKETS as usize];
    let mut count = 0;
    while count < PACKETS {
        for page in 0..NUM_PAGES {
            if !abi.try_acquire_all_chunks_for_reading(page) {
                continue;
            }
            for idx in 0..abi.layout_word(page).num_chunks() {
                if abi.chunk_state(page, idx) != ChunkState::BeingRead {
                    continue;
                }
                assert_eq!(abi.target_buffer(page), 9);
                let chunk = unsafe { abi.get_chunk(page, idx) }.unwrap();
                let id = chunk.identifier();
                assert_eq!(id.writer_id, 1);
                assert_eq!(chunk.packet_count_and_flags().count, 1);
                let expected = id.chunk_id.to_le_bytes();
                assert!(chunk.payload().chunks_exact(4).all(|part| part == expected));
                assert!(!received[id.chunk_id as usize], "chunk {} read twice", id.chunk_id);
                received[id.chunk_id as usize] = true;
                count += 1;
            }
            abi.release_all_chunks_as_free(page);
        }
        thread::yield_now();
    }
    producer.join().unwrap();
    assert!(received.iter().all(|r| *r));
}
