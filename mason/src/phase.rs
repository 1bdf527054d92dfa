// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Build phases.
//!
//! Exactly one of `load | match | execute` is active at a time. Any
//! number of threads may hold the active phase together, and one thread
//! may stack multiple holds (entry point plus helpers). Holds are
//! accounted per thread: parking and phase switching release the whole
//! per-thread stack so that a switch elsewhere can never deadlock against
//! a parked thread.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

/// Build phase identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Phase {
    Load,
    Match,
    Execute,
}

#[derive(Default)]
struct Inner {
    phase: Option<Phase>,
    total: usize,
    threads: HashMap<ThreadId, usize>,
}

/// The global phase lock
#[derive(Default)]
pub struct PhaseLock {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl PhaseLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a (shared) hold on `phase`, waiting out other phases.
    ///
    /// Nested holds by one thread stack; requesting a phase while already
    /// holding a different one is a programming error (use
    /// [`PhaseGuard::switch`]).
    pub fn lock(&self, phase: Phase) -> PhaseGuard<'_> {
        self.acquire(phase, 1);
        PhaseGuard { lock: self, phase }
    }

    /// The currently active phase, if any
    pub fn current(&self) -> Option<Phase> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).phase
    }

    fn acquire(&self, phase: Phase, holds: usize) {
        let tid = thread::current().id();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        while inner.phase.is_some_and(|current| current != phase) {
            debug_assert!(
                !inner.threads.contains_key(&tid),
                "cross-phase lock while holding {:?}",
                inner.phase
            );
            inner = self.cond.wait(inner).unwrap_or_else(|e| e.into_inner());
        }

        inner.phase = Some(phase);
        inner.total += holds;
        *inner.threads.entry(tid).or_default() += holds;
    }

    fn release(&self, phase: Phase, holds: usize) {
        let tid = thread::current().id();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        debug_assert_eq!(inner.phase, Some(phase));

        inner.total -= holds;
        if let Some(count) = inner.threads.get_mut(&tid) {
            *count -= holds;
            if *count == 0 {
                inner.threads.remove(&tid);
            }
        }

        if inner.total == 0 {
            inner.phase = None;
            self.cond.notify_all();
        }
    }

    /// Holds of the calling thread
    fn thread_holds(&self) -> usize {
        let tid = thread::current().id();
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .threads
            .get(&tid)
            .copied()
            .unwrap_or(0)
    }
}

/// A shared hold on a phase
pub struct PhaseGuard<'a> {
    lock: &'a PhaseLock,
    phase: Phase,
}

impl PhaseGuard<'_> {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run `f` with every hold of this thread released, reacquiring
    /// afterwards. Used around parking: a parked thread must not pin the
    /// phase.
    pub fn unlocked<R>(&self, f: impl FnOnce() -> R) -> R {
        let holds = self.lock.thread_holds();
        self.lock.release(self.phase, holds);

        let result = f();

        self.lock.acquire(self.phase, holds);
        result
    }

    /// Switch this thread to `phase` until the returned guard drops.
    ///
    /// The thread's entire hold stack is suspended for the duration and
    /// restored afterwards.
    pub fn switch(&self, phase: Phase) -> PhaseSwitch<'_> {
        let suspended = self.lock.thread_holds();
        self.lock.release(self.phase, suspended);
        self.lock.acquire(phase, 1);

        PhaseSwitch {
            lock: self.lock,
            previous: self.phase,
            active: phase,
            suspended,
        }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.phase, 1);
    }
}

/// RAII phase switch; restores the previous phase (and the suspended
/// hold stack) on drop
pub struct PhaseSwitch<'a> {
    lock: &'a PhaseLock,
    previous: Phase,
    active: Phase,
    suspended: usize,
}

impl PhaseSwitch<'_> {
    pub fn phase(&self) -> Phase {
        self.active
    }
}

impl Drop for PhaseSwitch<'_> {
    fn drop(&mut self) {
        self.lock.release(self.active, 1);
        self.lock.acquire(self.previous, self.suspended);
    }
}
