// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared memory transport for trace packets.
//!
//! A producer process and a reader process map the same region. The region is
//! split into pages, pages are lazily split into chunks, and chunks travel
//! through a four-state machine stored in a per-page atomic word:
//!
//! - [`SharedMemoryAbi`]: the bit-exact layout and the lock-free transitions. Safe to use from
//!   several processes at once.
//! - [`SharedMemoryArbiter`]: the producer-side coordinator handing chunks and writer ids to
//!   threads, and batching "page complete" notifications through a [`TaskRunner`].
//! - [`TraceWriter`]: frames packets into chunks, splitting them across chunk boundaries.
//! - [`reader`]: drains complete pages and reassembles packets.
//!
//! The crate never owns the mapping it works on, except for the
//! [`MappedRegion`] helper.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod abi;
mod arbiter;
mod config;
#[cfg(feature = "ffi")]
pub mod ffi;
mod header;
mod layout;
pub mod reader;
#[cfg(unix)]
mod region;
mod task_runner;
mod trace_writer;
mod writer_ids;

pub use abi::{
    AbiError, Chunk, ReleaseError, SharedMemoryAbi, MAX_PAGE_SIZE, MAX_RELEASE_ATTEMPTS,
    MIN_PAGE_SIZE,
};
pub use arbiter::{ArbiterError, ArbiterStats, PagesCompleteCallback, SharedMemoryArbiter};
pub use config::{ArbiterConfig, DD_TRACE_SHM_PAGE_LAYOUT, DD_TRACE_SHM_RELEASE_ATTEMPTS};
pub use header::{
    ChunkHeader, Identifier, Packets, WriterId, CHUNK_ALIGNMENT, CHUNK_HEADER_SIZE, MAX_CHUNK_ID,
    MAX_TRACE_BUFFERS, MAX_WRITER_ID, PAGE_HEADER_SIZE,
};
pub use layout::{ChunkState, LayoutWord, PageLayout, MAX_CHUNKS_PER_PAGE};
#[cfg(unix)]
pub use region::MappedRegion;
pub use task_runner::{QueuedTaskRunner, Task, TaskRunner, TokioTaskRunner};
pub use trace_writer::{BackpressurePolicy, TraceWriter, WriterError, FRAGMENT_HEADER_SIZE};

use std::sync::{Mutex, MutexGuard};

/// Locks a `Mutex`, panicking if it is poisoned.
///
/// A poisoned arbiter mutex means a writer thread panicked in the middle of a
/// state update; carrying on would hand out chunks from inconsistent state.
pub(crate) trait MutexExt<T> {
    fn lock_or_panic(&self) -> MutexGuard<'_, T>;
}

impl<T> MutexExt<T> for Mutex<T> {
    #[inline(always)]
    #[track_caller]
    fn lock_or_panic(&self) -> MutexGuard<'_, T> {
        #[allow(clippy::unwrap_used)]
        self.lock().unwrap()
    }
}
