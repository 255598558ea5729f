// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Size-classed buffer pool.
//!
//! `rent(len)` picks the smallest class whose buffers hold `len` bytes and
//! pops its freelist; an empty freelist allocates fresh (counted in
//! `misses`), and requests above the largest class allocate unpooled
//! (counted in `oversize`). The returned [`BufferLease`] views exactly
//! `len` bytes of the larger backing buffer and gives it back exactly
//! once, either through `release()` or on drop.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

/// Freelist configuration. `size_classes` must be sorted ascending and
/// deduplicated (config validation enforces this before construction).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub size_classes: Vec<usize>,
    pub initial_capacity_per_class: usize,
    pub max_capacity_per_class: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size_classes: vec![256, 1024, 4096, 16384, 65536],
            initial_capacity_per_class: 8,
            max_capacity_per_class: 1024,
        }
    }
}

#[derive(Debug)]
struct SizeClass {
    size: usize,
    freelist: ArrayQueue<BytesMut>,
}

#[derive(Debug, Default)]
pub struct PoolCounters {
    pub rented: u64,
    pub returned: u64,
    pub misses: u64,
    pub oversize: u64,
}

#[derive(Debug)]
pub struct BufferPool {
    classes: Vec<SizeClass>,
    rented: AtomicU64,
    returned: AtomicU64,
    misses: AtomicU64,
    oversize: AtomicU64,
}

impl BufferPool {
    pub fn new(cfg: &PoolConfig) -> Arc<Self> {
        let classes = cfg
            .size_classes
            .iter()
            .map(|&size| {
                let freelist = ArrayQueue::new(cfg.max_capacity_per_class.max(1));
                for _ in 0..cfg.initial_capacity_per_class.min(cfg.max_capacity_per_class)
                {
                    let _ = freelist.push(BytesMut::with_capacity(size));
                }
                SizeClass { size, freelist }
            })
            .collect();
        Arc::new(Self {
            classes,
            rented: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            oversize: AtomicU64::new(0),
        })
    }

    /// Rent a lease of exactly `len` readable/writable bytes, zero-filled.
    pub fn rent(self: &Arc<Self>, len: usize) -> BufferLease {
        self.rented.fetch_add(1, Ordering::Relaxed);

        let class = self.classes.iter().position(|c| c.size >= len);
        let mut buf = match class {
            Some(idx) => match self.classes[idx].freelist.pop() {
                Some(buf) => buf,
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    BytesMut::with_capacity(self.classes[idx].size)
                },
            },
            None => {
                self.oversize.fetch_add(1, Ordering::Relaxed);
                BytesMut::with_capacity(len)
            },
        };
        buf.clear();
        buf.resize(len, 0);

        BufferLease {
            pool: Arc::clone(self),
            class,
            buf: Some(buf),
        }
    }

    fn give_back(&self, class: Option<usize>, mut buf: BytesMut) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        if let Some(idx) = class {
            buf.clear();
            // A full freelist simply drops the buffer.
            let _ = self.classes[idx].freelist.push(buf);
        }
    }

    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            rented: self.rented.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
        }
    }

    /// Leases issued and not yet given back.
    pub fn outstanding(&self) -> u64 {
        let c = self.counters();
        c.rented - c.returned
    }

    /// Buffers currently parked across all freelists.
    pub fn free_count(&self) -> usize {
        self.classes.iter().map(|c| c.freelist.len()).sum()
    }
}

/// A scoped loan of a pooled buffer. The view spans exactly the rented
/// length; the backing buffer may be larger. Return happens exactly once:
/// explicitly via [`BufferLease::release`] or implicitly on drop.
#[derive(Debug)]
pub struct BufferLease {
    pool: Arc<BufferPool>,
    class: Option<usize>,
    buf: Option<BytesMut>,
}

impl BufferLease {
    #[inline]
    pub fn len(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Give the buffer back to its pool now.
    pub fn release(mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(self.class, buf);
        }
    }
}

impl AsRef<[u8]> for BufferLease {
    fn as_ref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl AsMut<[u8]> for BufferLease {
    fn as_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.give_back(self.class, buf);
        }
    }
}
