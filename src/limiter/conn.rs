// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-remote-address concurrent-connection cap.

use std::net::IpAddr;

use dashmap::DashMap;

#[derive(Debug)]
pub struct ConnectionLimiter {
    max_per_address: u32,
    counts: DashMap<IpAddr, u32>,
}

impl ConnectionLimiter {
    pub fn new(max_per_address: u32) -> Self {
        Self {
            max_per_address: max_per_address.max(1),
            counts: DashMap::new(),
        }
    }

    /// Claim a slot for `ip`. A rejected socket is closed before any bytes
    /// are written to it.
    pub fn try_acquire(&self, ip: IpAddr) -> bool {
        let mut entry = self.counts.entry(ip).or_insert(0);
        if *entry < self.max_per_address {
            *entry += 1;
            true
        } else {
            false
        }
    }

    /// Give the slot back on connection teardown.
    pub fn release(&self, ip: IpAddr) {
        let drained = if let Some(mut entry) = self.counts.get_mut(&ip) {
            *entry = entry.saturating_sub(1);
            *entry == 0
        } else {
            false
        };
        if drained {
            self.counts.remove_if(&ip, |_, count| *count == 0);
        }
    }

    pub fn active(&self, ip: IpAddr) -> u32 {
        self.counts.get(&ip).map_or(0, |entry| *entry)
    }
}
