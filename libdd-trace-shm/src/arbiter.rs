// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer-side owner of the shared region.
//!
//! One [`SharedMemoryArbiter`] per process hands chunks to writer threads,
//! owns the writer id bitmap and turns "this page is now fully complete"
//! events into batched `on_pages_complete` notifications.

use crate::abi::{AbiError, Chunk, ReleaseError, SharedMemoryAbi};
use crate::config::ArbiterConfig;
use crate::header::{ChunkHeader, WriterId, CHUNK_HEADER_SIZE, MAX_WRITER_ID};
use crate::layout::{ChunkState, PageLayout};
use crate::task_runner::TaskRunner;
use crate::writer_ids::WriterIdAllocator;
use crate::MutexExt;
use core::ptr::NonNull;
use serde::Serialize;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Receives the indices of pages whose chunks all became `Complete`.
pub type PagesCompleteCallback = Box<dyn Fn(&[u32]) + Send + Sync>;

#[derive(Debug, Error)]
pub enum ArbiterError {
    /// No page could provide a free chunk during a full scan. The writer
    /// decides whether to drop or retry.
    #[error("shared memory region exhausted, no free chunk available")]
    Exhausted,
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error("invalid arbiter configuration: {0}")]
    InvalidConfig(anyhow::Error),
}

/// Counters exposed by [`SharedMemoryArbiter::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArbiterStats {
    pub chunks_acquired: u64,
    pub chunks_returned: u64,
    pub exhausted: u64,
    pub notifications_posted: u64,
    /// Chunk releases that ran out of CAS attempts and had to be deferred.
    pub release_retries_exhausted: u64,
    /// Chunks currently waiting for a deferred release.
    pub deferred_releases: usize,
    pub writer_ids_in_use: usize,
}

#[derive(Default)]
struct ArbiterState {
    /// Page that last yielded a chunk. The next scan starts there.
    cursor: usize,
    writer_ids: WriterIdAllocator,
    pages_to_notify: Vec<u32>,
    deferred_releases: Vec<Chunk>,
    stats: ArbiterStats,
}

pub struct SharedMemoryArbiter {
    abi: SharedMemoryAbi,
    config: ArbiterConfig,
    on_pages_complete: PagesCompleteCallback,
    task_runner: Arc<dyn TaskRunner>,
    weak_self: Weak<SharedMemoryArbiter>,
    state: Mutex<ArbiterState>,
}

impl SharedMemoryArbiter {
    /// Creates the arbiter over a caller-owned region.
    ///
    /// # Safety
    /// Same contract as [`SharedMemoryAbi::new`]: `region` must stay mapped,
    /// readable and writable for as long as the arbiter and every chunk it
    /// hands out are alive.
    pub unsafe fn new(
        region: NonNull<[u8]>,
        page_size: usize,
        config: ArbiterConfig,
        on_pages_complete: PagesCompleteCallback,
        task_runner: Arc<dyn TaskRunner>,
    ) -> Result<Arc<Self>, ArbiterError> {
        let abi = SharedMemoryAbi::new(region, page_size)?;
        Self::with_abi(abi, config, on_pages_complete, task_runner)
    }

    pub fn with_abi(
        abi: SharedMemoryAbi,
        config: ArbiterConfig,
        on_pages_complete: PagesCompleteCallback,
        task_runner: Arc<dyn TaskRunner>,
    ) -> Result<Arc<Self>, ArbiterError> {
        config.validate().map_err(ArbiterError::InvalidConfig)?;
        debug!(
            num_pages = abi.num_pages(),
            page_size = abi.page_size(),
            "Creating shared memory arbiter"
        );
        Ok(Arc::new_cyclic(|weak_self| Self {
            abi,
            config,
            on_pages_complete,
            task_runner,
            weak_self: weak_self.clone(),
            state: Mutex::new(ArbiterState::default()),
        }))
    }

    pub fn abi(&self) -> &SharedMemoryAbi {
        &self.abi
    }

    pub fn config(&self) -> &ArbiterConfig {
        &self.config
    }

    pub fn stats(&self) -> ArbiterStats {
        let state = self.state.lock_or_panic();
        ArbiterStats {
            deferred_releases: state.deferred_releases.len(),
            writer_ids_in_use: state.writer_ids.in_use(),
            ..state.stats
        }
    }

    /// Layout a page should have to serve a chunk for `size_hint` payload bytes.
    ///
    /// 0 means "no preference" and picks the configured default. Otherwise the
    /// layout with the most chunks whose payload still fits the hint, or `Div1`.
    pub fn layout_for_size_hint(&self, size_hint: usize) -> PageLayout {
        if size_hint == 0 {
            return self.config.default_page_layout;
        }
        PageLayout::PARTITIONED
            .iter()
            .rev()
            .copied()
            .find(|layout| self.abi.chunk_size_for_layout(*layout) - CHUNK_HEADER_SIZE >= size_hint)
            .unwrap_or(PageLayout::Div1)
    }

    /// Finds a `Free` chunk on a page of `target_buffer`, partitioning a new
    /// page if needed, and moves it to `BeingWritten` with `header`.
    pub fn get_new_chunk(
        &self,
        header: &ChunkHeader,
        target_buffer: u16,
        size_hint: usize,
    ) -> Result<Chunk, ArbiterError> {
        let layout = self.layout_for_size_hint(size_hint);
        let num_pages = self.abi.num_pages();

        let mut state = self.state.lock_or_panic();
        let post = self.retry_deferred_releases(&mut state);

        let mut found = None;
        for i in 0..num_pages {
            let page_idx = (state.cursor + i) % num_pages;
            if let Some(chunk) = self.try_page(page_idx, layout, target_buffer, header) {
                found = Some((page_idx, chunk));
                break;
            }
        }

        let result = match found {
            Some((page_idx, chunk)) => {
                state.cursor = page_idx;
                state.stats.chunks_acquired += 1;
                Ok(chunk)
            }
            None => {
                state.stats.exhausted += 1;
                Err(ArbiterError::Exhausted)
            }
        };
        drop(state);

        if post {
            self.post_notification();
        }
        if result.is_err() {
            debug!(target_buffer, ?layout, "No free chunk in the shared memory region");
        }
        result
    }

    fn try_page(
        &self,
        page_idx: usize,
        layout: PageLayout,
        target_buffer: u16,
        header: &ChunkHeader,
    ) -> Option<Chunk> {
        // Losing the partition race is fine, whoever won may still be compatible.
        if self.abi.is_page_free(page_idx) {
            self.abi.try_partition_page(page_idx, layout, target_buffer);
        }

        let word = self.abi.layout_word(page_idx);
        if word.page_layout() != layout || self.abi.target_buffer(page_idx) != target_buffer {
            return None;
        }

        (0..word.num_chunks())
            .filter(|chunk_idx| self.abi.chunk_state(page_idx, *chunk_idx) == ChunkState::Free)
            .find_map(|chunk_idx| {
                self.abi
                    .try_acquire_chunk_for_writing(page_idx, chunk_idx, header)
            })
    }

    /// Marks a chunk obtained from [`get_new_chunk`](Self::get_new_chunk) as
    /// `Complete`.
    ///
    /// Never fails: a page that stays contended past the retry budget gets its
    /// release deferred and retried on later calls.
    pub fn return_completed_chunk(&self, chunk: Chunk) {
        let result = self.abi.release_chunk_bounded(
            chunk,
            ChunkState::Complete,
            self.config.release_attempts,
        );

        let post = {
            let mut state = self.state.lock_or_panic();
            state.stats.chunks_returned += 1;
            let post = self.on_chunk_released(&mut state, result);
            self.retry_deferred_releases(&mut state) || post
        };
        if post {
            self.post_notification();
        }
    }

    /// Returns true if a notification has to be posted once the lock is released.
    fn on_chunk_released(
        &self,
        state: &mut ArbiterState,
        result: Result<Option<usize>, ReleaseError>,
    ) -> bool {
        match result {
            Ok(Some(page_idx)) => Self::enqueue_completed_page(state, page_idx),
            Ok(None) => false,
            Err(ReleaseError::RetriesExhausted {
                chunk,
                page_idx,
                chunk_idx,
                attempts,
            }) => {
                warn!(
                    page_idx,
                    chunk_idx, attempts, "Page is stuck, deferring the release of a completed chunk"
                );
                state.stats.release_retries_exhausted += 1;
                state.deferred_releases.push(chunk);
                false
            }
        }
    }

    fn retry_deferred_releases(&self, state: &mut ArbiterState) -> bool {
        if state.deferred_releases.is_empty() {
            return false;
        }
        let mut post = false;
        for chunk in mem::take(&mut state.deferred_releases) {
            match self.abi.release_chunk_bounded(
                chunk,
                ChunkState::Complete,
                self.config.release_attempts,
            ) {
                Ok(Some(page_idx)) => post |= Self::enqueue_completed_page(state, page_idx),
                Ok(None) => {}
                Err(ReleaseError::RetriesExhausted { chunk, .. }) => {
                    state.deferred_releases.push(chunk)
                }
            }
        }
        if state.deferred_releases.is_empty() {
            debug!("Deferred chunk releases went through");
        }
        post
    }

    /// Returns true if this is the first page queued since the last drain.
    fn enqueue_completed_page(state: &mut ArbiterState, page_idx: usize) -> bool {
        let first = state.pages_to_notify.is_empty();
        // Page indices are below num_pages, which fits in u32 for any page size >= 4096.
        let page_idx = page_idx as u32;
        if !state.pages_to_notify.contains(&page_idx) {
            state.pages_to_notify.push(page_idx);
        }
        if first {
            state.stats.notifications_posted += 1;
        }
        first
    }

    fn post_notification(&self) {
        let weak_self = self.weak_self.clone();
        self.task_runner.post_task(Box::new(move || {
            if let Some(arbiter) = weak_self.upgrade() {
                arbiter.notify_pages_complete();
            }
        }));
    }

    fn notify_pages_complete(&self) {
        let pages = mem::take(&mut self.state.lock_or_panic().pages_to_notify);
        if pages.is_empty() {
            return;
        }
        debug!(num_pages = pages.len(), "Notifying completed pages");
        (self.on_pages_complete)(&pages);
    }

    /// Takes the lowest free writer id.
    ///
    /// Panics once all ids are held: there are only `MAX_WRITER_ID` of them
    /// and running out means writers are leaked.
    pub fn acquire_writer_id(&self) -> WriterId {
        let id = self.state.lock_or_panic().writer_ids.allocate();
        match id {
            Some(id) => id,
            None => {
                error!("All {MAX_WRITER_ID} writer ids are in use");
                panic!("writer id space exhausted ({MAX_WRITER_ID} ids in use)");
            }
        }
    }

    /// Gives back an id from [`acquire_writer_id`](Self::acquire_writer_id).
    /// The writer must not touch any chunk afterwards.
    pub fn release_writer_id(&self, id: WriterId) {
        let freed = self.state.lock_or_panic().writer_ids.free(id);
        assert!(freed, "writer id {} released but not held", id.get());
    }
}

impl Drop for SharedMemoryArbiter {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let mut still_stuck = 0;
        for chunk in mem::take(&mut state.deferred_releases) {
            match self.abi.release_chunk_bounded(
                chunk,
                ChunkState::Complete,
                self.config.release_attempts,
            ) {
                Ok(Some(page_idx)) => debug!(page_idx, "Page completed while dropping the arbiter"),
                Ok(None) => {}
                Err(ReleaseError::RetriesExhausted { .. }) => still_stuck += 1,
            }
        }
        if still_stuck > 0 {
            warn!(
                deferred_releases = still_stuck,
                "Dropping the arbiter with chunks that were never marked complete"
            );
        }
    }
}
