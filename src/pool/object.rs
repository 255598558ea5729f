// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-type object pool with an explicit reset contract.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;

/// Capability a pooled type must provide. `reset_for_pool` restores the
/// instance to its post-`Default` state; calling it twice in a row is a
/// no-op by contract.
pub trait Poolable: Default + Send {
    fn reset_for_pool(&mut self);
}

/// Bounded lock-free pool of reusable instances.
#[derive(Debug)]
pub struct ObjectPool<T: Poolable> {
    queue: ArrayQueue<T>,
    misses: AtomicU64,
}

impl<T: Poolable> ObjectPool<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            misses: AtomicU64::new(0),
        }
    }

    /// Take a parked instance or build a fresh one (counted as a miss).
    pub fn take(&self) -> T {
        match self.queue.pop() {
            Some(obj) => obj,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                T::default()
            },
        }
    }

    /// Reset and park `obj`. A full pool drops it instead.
    pub fn put(&self, mut obj: T) {
        obj.reset_for_pool();
        let _ = self.queue.push(obj);
    }

    pub fn free_count(&self) -> usize {
        self.queue.len()
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
