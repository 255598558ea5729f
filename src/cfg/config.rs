// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

use crate::{
    codec::crypto::CipherAlgorithm,
    limiter::rate::RateLimitConfig,
    packet::header::{HEADER_LEN, MAX_FRAME_LEN},
    pool::buffer::PoolConfig,
    server::{
        channel::PushPolicy,
        connection::ConnectionConfig,
        listener::{ListenerConfig, SocketConfig},
    },
    tasks::manager::TaskDefaults,
};

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Socket-level options applied to the listener and every accepted
    /// stream.
    pub socket: SocketConfig,
    /// Accept-loop behavior (concurrent accepts, backoff, backlog).
    pub listener: ListenerConfig,
    /// Per-connection framing, queueing and timeout settings.
    pub connection: ConnectionConfig,
    /// Sliding-window request limits per remote endpoint.
    pub rate_limit: RateLimitConfig,
    /// Buffer-pool size classes and capacities.
    pub pools: PoolConfig,
    /// Task-manager defaults (retention, tick frequency, machine id).
    pub tasks: TaskDefaults,
    /// Dispatch-channel sizing and overflow policy.
    pub dispatch: DispatchConfig,
    /// Optional connection encryption applied by the unwrap/wrap stages.
    pub encryption: EncryptionConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct DispatchConfig {
    /// Capacity of the dispatch channel.
    pub queue_depth: usize,
    /// Number of dispatch workers pulling from the channel.
    pub workers: u32,
    /// What a full channel does to the pushing read loop.
    pub push_policy: PushPolicy,
    /// Fingerprint deduplication window. Zero disables the cache.
    #[serde(with = "serde_millis")]
    pub dedup_window: std::time::Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            workers: 4,
            push_policy: PushPolicy::default(),
            dedup_window: std::time::Duration::ZERO,
        }
    }
}

/// Server-side default cipher configuration. Connections start without a
/// suite; protocols install one (typically after a handshake) using these
/// settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct EncryptionConfig {
    pub algorithm: CipherAlgorithm,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            algorithm: CipherAlgorithm::Aes256Gcm,
        }
    }
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            self.connection.max_frame_len >= HEADER_LEN,
            "connection.max_frame_len must hold at least the fixed header"
        );
        if self.connection.max_frame_len > MAX_FRAME_LEN {
            self.connection.max_frame_len = MAX_FRAME_LEN;
        }
        ensure!(
            self.connection.send_queue_depth >= 1,
            "connection.send_queue_depth must be >= 1"
        );
        ensure!(
            self.connection.max_per_address >= 1,
            "connection.max_per_address must be >= 1"
        );

        ensure!(
            !self.rate_limit.window.is_zero(),
            "rate_limit.window must be positive"
        );
        ensure!(
            self.rate_limit.max_requests >= 1,
            "rate_limit.max_requests must be >= 1"
        );

        ensure!(
            !self.pools.size_classes.is_empty(),
            "pools.size_classes must not be empty"
        );
        self.pools.size_classes.sort_unstable();
        self.pools.size_classes.dedup();
        ensure!(
            self.pools.size_classes.iter().all(|&s| s >= HEADER_LEN),
            "pools.size_classes entries must hold at least a header"
        );

        ensure!(
            self.listener.max_simultaneous_accepts >= 1,
            "listener.max_simultaneous_accepts must be >= 1"
        );
        if self.listener.backlog < 100 {
            self.listener.backlog = 100;
        }
        ensure!(
            !self.listener.accept_backoff_initial.is_zero(),
            "listener.accept_backoff_initial must be positive"
        );

        ensure!(
            self.dispatch.queue_depth >= 1,
            "dispatch.queue_depth must be >= 1"
        );
        ensure!(self.dispatch.workers >= 1, "dispatch.workers must be >= 1");

        ensure!(
            self.tasks.tick_frequency_hz >= 1,
            "tasks.tick_frequency_hz must be >= 1"
        );
        ensure!(
            !self.tasks.metrics_interval.is_zero(),
            "tasks.metrics_interval must be positive"
        );

        ensure!(
            self.connection.max_fragments >= 1,
            "connection.max_fragments must be >= 1"
        );
        ensure!(
            !self.connection.sweep_interval.is_zero(),
            "connection.sweep_interval must be positive"
        );

        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
pub mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
