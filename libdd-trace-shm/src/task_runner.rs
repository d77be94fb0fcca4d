// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Where the arbiter posts its page-completion notifications.
//!
//! The arbiter never invokes the completion callback on the thread that
//! returned the chunk. It hands a closure to a [`TaskRunner`] instead, so the
//! callback can call back into the arbiter without deadlocking.

use crate::MutexExt;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::runtime::Handle;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait TaskRunner: Send + Sync {
    /// Schedules `task` to run later, on some other stack frame.
    fn post_task(&self, task: Task);
}

/// Runs posted tasks on a tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioTaskRunner {
    handle: Handle,
}

impl TokioTaskRunner {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the calling context, if any.
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl TaskRunner for TokioTaskRunner {
    fn post_task(&self, task: Task) {
        self.handle.spawn(async move { task() });
    }
}

/// FIFO of tasks that only run when the owner calls [`run_pending`].
///
/// Meant for embedders that have their own event loop, and for tests that
/// need to decide exactly when notifications fire.
///
/// [`run_pending`]: QueuedTaskRunner::run_pending
#[derive(Default)]
pub struct QueuedTaskRunner {
    queue: Mutex<VecDeque<Task>>,
}

impl QueuedTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.lock_or_panic().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs queued tasks, including the ones they post, until the queue is
    /// empty. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let Some(task) = self.queue.lock_or_panic().pop_front() else {
                return ran;
            };
            task();
            ran += 1;
        }
    }
}

impl TaskRunner for QueuedTaskRunner {
    fn post_task(&self, task: Task) {
        self.queue.lock_or_panic().push_back(task);
    }
}

impl std::fmt::Debug for QueuedTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedTaskRunner")
            .field("pending", &self.len())
            .finish()
    }
}
