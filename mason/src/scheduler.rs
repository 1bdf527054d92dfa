// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The worker pool.
//!
//! A bounded rayon pool runs match and execute tasks. Joining is
//! cooperative: a thread blocked in [`WaitGuard::wait`] keeps pulling
//! queued work off the pool instead of going idle, and only parks once
//! the pool has nothing for it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::{ThreadPool, ThreadPoolBuilder, Yield};
use thiserror::Error;

use crate::phase::PhaseGuard;
use crate::sync::{self, Monitors};

/// The bounded worker pool
pub struct Scheduler {
    pool: ThreadPool,
    jobs: usize,
}

impl Scheduler {
    /// Build a pool with `jobs` workers; `0` sizes to the host
    pub fn new(jobs: usize) -> Result<Self, Error> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(jobs)
            .thread_name(|i| format!("mason-worker-{i}"))
            .build()?;
        let jobs = pool.current_num_threads();

        Ok(Self { pool, jobs })
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Enter the pool for the duration of `f`
    pub fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        self.pool.install(f)
    }

    /// Queue an asynchronous task
    pub fn spawn(&self, f: impl FnOnce() + Send + 'static) {
        self.pool.spawn(f);
    }

    /// Execute one queued task on the calling thread, if any.
    ///
    /// Returns false when the queue is empty or the caller is not a pool
    /// thread; the caller should park instead of spinning.
    pub fn help(&self) -> bool {
        matches!(rayon::yield_now(), Some(Yield::Executed))
    }
}

/// Cooperative join for a batch of async tasks.
///
/// Each task takes a [`CompletionToken`] before being spawned; the guard's
/// `wait` returns once every token has dropped.
pub struct WaitGuard {
    pending: Arc<AtomicUsize>,
    monitors: Arc<Monitors>,
}

impl WaitGuard {
    pub fn new(monitors: Arc<Monitors>) -> Self {
        Self {
            pending: Arc::new(AtomicUsize::new(0)),
            monitors,
        }
    }

    /// Register one pending task
    pub fn start(&self) -> CompletionToken {
        self.pending.fetch_add(1, Ordering::AcqRel);

        CompletionToken {
            pending: Arc::clone(&self.pending),
            monitors: Arc::clone(&self.monitors),
        }
    }

    /// Join all started tasks, stealing work while they run.
    pub fn wait(&self, scheduler: &Scheduler, phase: &PhaseGuard<'_>) {
        while self.pending.load(Ordering::Acquire) != 0 {
            if scheduler.help() {
                continue;
            }

            // Nothing to steal; park without pinning the phase
            phase.unlocked(|| {
                self.monitors.wait_until(sync::key_of(self.pending.as_ref()), || {
                    self.pending.load(Ordering::Acquire) == 0
                });
            });
        }
    }
}

/// Held by an async task for its lifetime
pub struct CompletionToken {
    pending: Arc<AtomicUsize>,
    monitors: Arc<Monitors>,
}

impl Drop for CompletionToken {
    fn drop(&mut self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.monitors.notify(sync::key_of(self.pending.as_ref()));
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}
