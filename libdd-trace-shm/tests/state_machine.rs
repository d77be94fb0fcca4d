// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Drives the ABI with arbitrary operation sequences and checks every layout
//! word against a plain model of the page/chunk state machine.

use bolero::generator::TypeGenerator;
use libdd_trace_shm::{
    Chunk, ChunkHeader, ChunkState, Identifier, MappedRegion, PageLayout, Packets, SharedMemoryAbi,
    WriterId,
};

const PAGE_SIZE: usize = 4096;
const NUM_PAGES: usize = 4;

#[derive(Debug, TypeGenerator)]
enum Op {
    Partition { page: u8, layout: u8, target_buffer: u16 },
    AcquireForWriting { page: u8, chunk: u8 },
    ReleaseAsComplete { slot: u8 },
    AcquireForReading { page: u8, chunk: u8 },
    ReleaseAsFree { slot: u8 },
    AcquireAllForReading { page: u8 },
    ReleaseAllAsFree { page: u8 },
}

#[derive(Clone, Debug)]
struct PageModel {
    layout: PageLayout,
    target_buffer: u16,
    chunks: Vec<ChunkState>,
}

impl PageModel {
    fn all(&self, state: ChunkState) -> bool {
        self.chunks.iter().all(|s| *s == state)
    }
}

struct Held {
    chunk: Chunk,
    page: usize,
    idx: usize,
}

struct Model {
    pages: Vec<Option<PageModel>>,
    writing: Vec<Held>,
    reading: Vec<Held>,
    next_chunk_id: u32,
}

fn header(chunk_id: u32) -> ChunkHeader {
    ChunkHeader {
        identifier: Identifier::new(WriterId::new(7).unwrap(), chunk_id),
        packets: Packets::default(),
    }
}

fn check_page(abi: &SharedMemoryAbi, model: &Model, page: usize) {
    match &model.pages[page] {
        None => assert!(abi.is_page_free(page), "page {page}: {:?}", abi.layout_word(page)),
        Some(expected) => {
            assert_eq!(abi.page_layout(page), expected.layout);
            assert_eq!(abi.target_buffer(page), expected.target_buffer);
            for (i, state) in expected.chunks.iter().enumerate() {
                assert_eq!(abi.chunk_state(page, i), *state, "page {page} chunk {i}");
            }
        }
    }
}

fn apply(abi: &SharedMemoryAbi, model: &mut Model, op: &Op) {
    match *op {
        Op::Partition {
            page,
            layout,
            target_buffer,
        } => {
            let page = page as usize % NUM_PAGES;
            let layout = PageLayout::PARTITIONED[layout as usize % PageLayout::PARTITIONED.len()];
            let ok = abi.try_partition_page(page, layout, target_buffer);
            assert_eq!(ok, model.pages[page].is_none());
            if ok {
                model.pages[page] = Some(PageModel {
                    layout,
                    target_buffer,
                    chunks: vec![ChunkState::Free; layout.num_chunks()],
                });
            }
        }
        Op::AcquireForWriting { page, chunk } => {
            let page = page as usize % NUM_PAGES;
            let idx = chunk as usize % 14;
            let expected = model.pages[page]
                .as_ref()
                .is_some_and(|p| p.chunks.get(idx) == Some(&ChunkState::Free));
            let got = abi.try_acquire_chunk_for_writing(page, idx, &header(model.next_chunk_id));
            assert_eq!(got.is_some(), expected);
            if let Some(chunk) = got {
                assert_eq!(chunk.identifier().chunk_id, model.next_chunk_id);
                assert_eq!(chunk.identifier().writer_id, 7);
                model.next_chunk_id += 1;
                if let Some(p) = model.pages[page].as_mut() {
                    p.chunks[idx] = ChunkState::BeingWritten;
                }
                model.writing.push(Held { chunk, page, idx });
            }
        }
        Op::ReleaseAsComplete { slot } => {
            if model.writing.is_empty() {
                return;
            }
            let Held { chunk, page, idx } =
                model.writing.swap_remove(slot as usize % model.writing.len());
            let result = abi.release_chunk_as_complete(chunk).unwrap();
            let Some(p) = model.pages[page].as_mut() else {
                panic!("held chunk on an unpartitioned page");
            };
            p.chunks[idx] = ChunkState::Complete;
            assert_eq!(result, p.all(ChunkState::Complete).then_some(page));
        }
        Op::AcquireForReading { page, chunk } => {
            let page = page as usize % NUM_PAGES;
            let idx = chunk as usize % 14;
            let expected = model.pages[page]
                .as_ref()
                .is_some_and(|p| p.chunks.get(idx) == Some(&ChunkState::Complete));
            let got = abi.try_acquire_chunk_for_reading(page, idx);
            assert_eq!(got.is_some(), expected);
            if let Some(chunk) = got {
                if let Some(p) = model.pages[page].as_mut() {
                    p.chunks[idx] = ChunkState::BeingRead;
                }
                model.reading.push(Held { chunk, page, idx });
            }
        }
        Op::ReleaseAsFree { slot } => {
            if model.reading.is_empty() {
                return;
            }
            let Held { chunk, page, idx } =
                model.reading.swap_remove(slot as usize % model.reading.len());
            let result = abi.release_chunk_as_free(chunk).unwrap();
            let Some(p) = model.pages[page].as_mut() else {
                panic!("held chunk on an unpartitioned page");
            };
            p.chunks[idx] = ChunkState::Free;
            let departitioned = p.all(ChunkState::Free);
            assert_eq!(result, departitioned.then_some(page));
            if departitioned {
                model.pages[page] = None;
            }
        }
        Op::AcquireAllForReading { page } => {
            let page = page as usize % NUM_PAGES;
            let expected = model.pages[page]
                .as_ref()
                .is_some_and(|p| !p.chunks.contains(&ChunkState::BeingWritten));
            assert_eq!(abi.try_acquire_all_chunks_for_reading(page), expected);
            if let (true, Some(p)) = (expected, model.pages[page].as_mut()) {
                for state in &mut p.chunks {
                    if *state == ChunkState::Complete {
                        *state = ChunkState::BeingRead;
                    }
                }
            }
        }
        Op::ReleaseAllAsFree { page } => {
            let page = page as usize % NUM_PAGES;
            // Bulk release would also free chunks read through individual tokens.
            if model.reading.iter().any(|held| held.page == page) {
                return;
            }
            let released = abi.release_all_chunks_as_free(page);
            let Some(p) = model.pages[page].as_mut() else {
                assert!(!released);
                assert!(abi.is_page_free(page));
                return;
            };
            for state in &mut p.chunks {
                if *state == ChunkState::BeingRead {
                    *state = ChunkState::Free;
                }
            }
            let departitioned = p.all(ChunkState::Free);
            assert_eq!(released, departitioned);
            if departitioned {
                model.pages[page] = None;
            }
        }
    }
}

#[test]
fn layout_words_follow_the_model() {
    bolero::check!().with_type::<Vec<Op>>().for_each(|ops| {
        let region = MappedRegion::anonymous(NUM_PAGES * PAGE_SIZE).unwrap();
        let abi = unsafe { SharedMemoryAbi::new(region.as_non_null(), PAGE_SIZE).unwrap() };
        let mut model = Model {
            pages: vec![None; NUM_PAGES],
            writing: Vec::new(),
            reading: Vec::new(),
            next_chunk_id: 0,
        };

        for op in ops {
            apply(&abi, &mut model, op);
            for page in 0..NUM_PAGES {
                check_page(&abi, &model, page);
            }
        }
    });
}
