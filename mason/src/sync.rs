// SPDX-FileCopyrightText: Copyright © 2020-2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Low-level parking support.
//!
//! Per-target lifecycle words are bare atomics; threads that lose a
//! transition race park on a monitor picked from a fixed shard array by
//! the atomic's address. Wakeups are shard-wide, so waits re-check their
//! condition and also use a timeout to ride out shard collisions.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

const SHARD_COUNT: usize = 64;
const PARK_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Monitor {
    lock: Mutex<()>,
    cond: Condvar,
}

/// A shard of monitors keyed by address.
pub struct Monitors {
    shards: Vec<Monitor>,
}

impl Default for Monitors {
    fn default() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Monitor::default()).collect(),
        }
    }
}

impl Monitors {
    pub fn new() -> Self {
        Self::default()
    }

    fn monitor(&self, key: usize) -> &Monitor {
        // Drop the low bits; distinct atomics share alignment
        &self.shards[(key >> 4) % SHARD_COUNT]
    }

    /// Park until `done` returns true.
    ///
    /// The predicate is evaluated under the shard lock, closing the gap
    /// against a notify between check and wait.
    pub fn wait_until(&self, key: usize, mut done: impl FnMut() -> bool) {
        let monitor = self.monitor(key);

        let mut guard = monitor.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !done() {
            let (g, _) = monitor
                .cond
                .wait_timeout(guard, PARK_TIMEOUT)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }
    }

    /// Wake every thread parked on `key`'s shard
    pub fn notify(&self, key: usize) {
        let monitor = self.monitor(key);

        // Lock/unlock pairs with the predicate check in wait_until
        drop(monitor.lock.lock().unwrap_or_else(|e| e.into_inner()));
        monitor.cond.notify_all();
    }
}

/// Shard key for any referenced location
pub fn key_of<T>(r: &T) -> usize {
    std::ptr::from_ref(r) as usize
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn wait_observes_flag() {
        let monitors = Arc::new(Monitors::new());
        let flag = Arc::new(AtomicUsize::new(0));

        let handle = {
            let monitors = Arc::clone(&monitors);
            let flag = Arc::clone(&flag);
            std::thread::spawn(move || {
                monitors.wait_until(key_of(flag.as_ref()), || flag.load(Ordering::Acquire) == 1);
            })
        };

        flag.store(1, Ordering::Release);
        monitors.notify(key_of(flag.as_ref()));
        handle.join().expect("waiter thread");
    }
}
