// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

/// Default custom epoch: 2020-01-01T00:00:00Z in Unix milliseconds.
pub const DEFAULT_EPOCH_UNIX_MS: u64 = 1_577_836_800_000;

/// Monotonic + wall clock with a configurable epoch.
///
/// Wall time is sampled once at construction and advanced from a monotonic
/// `Instant` anchor, so `unix_ms()` never goes backwards even when the
/// system clock is stepped. `coarse_ms` is a cheap shared stamp refreshed
/// by the task-manager tick for subsystems that expire records by time
/// rather than by event.
#[derive(Debug)]
pub struct Clock {
    epoch_unix_ms: u64,
    anchor: Instant,
    anchor_unix_ms: u64,
    coarse_ms: AtomicU64,
}

impl Clock {
    pub fn new(epoch_unix_ms: u64) -> Self {
        let anchor_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(epoch_unix_ms);
        Self {
            epoch_unix_ms,
            anchor: Instant::now(),
            anchor_unix_ms,
            coarse_ms: AtomicU64::new(anchor_unix_ms),
        }
    }

    /// Milliseconds since the Unix epoch, derived monotonically.
    #[inline]
    pub fn unix_ms(&self) -> u64 {
        self.anchor_unix_ms + self.anchor.elapsed().as_millis() as u64
    }

    /// Milliseconds since the configured custom epoch.
    #[inline]
    pub fn epoch_ms(&self) -> u64 {
        self.unix_ms().saturating_sub(self.epoch_unix_ms)
    }

    /// Monotonic ticks (microseconds since process anchor), for RTT probes.
    #[inline]
    pub fn mono_ticks(&self) -> u64 {
        self.anchor.elapsed().as_micros() as u64
    }

    /// Last stamp published by `refresh_coarse`.
    #[inline]
    pub fn coarse_ms(&self) -> u64 {
        self.coarse_ms.load(Ordering::Relaxed)
    }

    /// Publish the current wall time into the coarse stamp. Invoked by the
    /// task-manager tick, default 1 Hz.
    pub fn refresh_coarse(&self) {
        self.coarse_ms.store(self.unix_ms(), Ordering::Relaxed);
    }

    #[inline]
    pub fn epoch_unix_ms(&self) -> u64 {
        self.epoch_unix_ms
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(DEFAULT_EPOCH_UNIX_MS)
    }
}
