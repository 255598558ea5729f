// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Registry of live connections.
//!
//! Entries are weak so the registry never keeps a dead connection alive;
//! lookups prune entries whose connection is gone. The task manager owns
//! two jobs built on top of this: the stale-connection sweep, which closes
//! connections whose activity stamp stopped moving, and the metrics
//! flush, which aggregates traffic counters.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use dashmap::DashMap;
use tracing::debug;

use crate::{
    error::CloseReason,
    server::connection::{Connection, TrafficStats},
    time::snowflake::SnowflakeId,
};

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<SnowflakeId, Weak<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, conn: &Arc<Connection>) {
        self.connections.insert(conn.id, Arc::downgrade(conn));
    }

    pub(crate) fn remove(&self, id: SnowflakeId) {
        self.connections.remove(&id);
    }

    /// Snapshot of the live connections, pruning dead entries on the way.
    pub fn active(&self) -> Vec<Arc<Connection>> {
        let mut alive = Vec::with_capacity(self.connections.len());
        self.connections.retain(|_, weak| match weak.upgrade() {
            Some(conn) => {
                alive.push(conn);
                true
            },
            None => false,
        });
        alive
    }

    pub fn count(&self) -> usize {
        self.active().len()
    }

    pub fn get(&self, id: SnowflakeId) -> Option<Arc<Connection>> {
        self.connections.get(&id).and_then(|weak| weak.upgrade())
    }

    /// Traffic totals across the live connections.
    pub fn aggregate_traffic(&self) -> TrafficStats {
        let mut total = TrafficStats::default();
        for conn in self.active() {
            let t = conn.traffic();
            total.bytes_in += t.bytes_in;
            total.bytes_out += t.bytes_out;
            total.packets_in += t.packets_in;
            total.packets_out += t.packets_out;
        }
        total
    }

    /// Close connections whose activity stamp is older than `max_idle`.
    /// The read loop's own idle timeout normally fires first; this sweep
    /// is the time-based backstop for connections wedged elsewhere.
    pub fn sweep_idle(&self, now_ms: u64, max_idle: Duration) -> usize {
        let cutoff = now_ms.saturating_sub(max_idle.as_millis() as u64);
        let mut closed = 0;
        for conn in self.active() {
            if conn.is_open() && conn.last_activity_ms() < cutoff {
                debug!(conn = %conn.id, "stale connection swept");
                conn.close(CloseReason::IdleTimeout);
                closed += 1;
            }
        }
        closed
    }
}
