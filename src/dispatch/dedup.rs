// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Optional duplicate suppression by packet fingerprint.
//!
//! The fingerprint is `(magic, opcode, timestamp truncated to the
//! configured window)`; a second packet landing in the same bucket is
//! dropped before handler resolution. Disabled by default
//! (`dispatch.dedup_window = 0`); when enabled, a task-manager job evicts
//! buckets older than the previous window.

use std::time::Duration;

use dashmap::DashMap;

type Fingerprint = (u32, u16, u64);

#[derive(Debug)]
pub struct DedupCache {
    window_ms: u64,
    seen: DashMap<Fingerprint, u64>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: window.as_millis() as u64,
            seen: DashMap::new(),
        }
    }

    /// True when the fingerprint was not seen in this window. Packets
    /// without a timestamp are always admitted.
    pub fn admit(&self, magic: u32, opcode: u16, timestamp_ms: u64) -> bool {
        if self.window_ms == 0 || timestamp_ms == 0 {
            return true;
        }
        let bucket = timestamp_ms / self.window_ms;
        self.seen
            .insert((magic, opcode, bucket), timestamp_ms)
            .is_none()
    }

    /// Drop buckets older than the window before `now_ms`. Returns how
    /// many were evicted.
    pub fn evict(&self, now_ms: u64) -> usize {
        if self.window_ms == 0 {
            return 0;
        }
        let keep_from = (now_ms / self.window_ms).saturating_sub(1);
        let before = self.seen.len();
        self.seen.retain(|&(_, _, bucket), _| bucket >= keep_from);
        before - self.seen.len()
    }

    pub fn tracked(&self) -> usize {
        self.seen.len()
    }
}
