// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Per-endpoint sliding-window request limiter with lockout.
//!
//! `check` admits a request when fewer than `max_requests` were admitted
//! within the trailing `window`; one request over the line places the
//! endpoint in lockout until `now + lockout`. Requests during lockout are
//! rejected without extending it. Endpoints idle beyond a configurable age
//! are evicted by a periodic sweep owned by the task manager.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use dashmap::DashMap;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(with = "crate::cfg::config::serde_millis")]
    pub window: Duration,
    pub max_requests: u32,
    #[serde(with = "crate::cfg::config::serde_millis")]
    pub lockout: Duration,
    /// Cadence of the idle-endpoint sweep.
    #[serde(with = "crate::cfg::config::serde_millis")]
    pub sweep_interval: Duration,
    /// Idle age past which an endpoint is evicted by the sweep.
    #[serde(with = "crate::cfg::config::serde_millis")]
    pub idle_evict_age: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            max_requests: 32,
            lockout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
            idle_evict_age: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct EndpointState {
    hits: VecDeque<Instant>,
    locked_until: Option<Instant>,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    lockout: Duration,
    endpoints: DashMap<String, EndpointState>,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        Self {
            window: cfg.window,
            max_requests: cfg.max_requests.max(1),
            lockout: cfg.lockout,
            endpoints: DashMap::new(),
        }
    }

    /// Admit or reject one request from `endpoint` right now.
    pub fn check(&self, endpoint: &str) -> bool {
        let now = Instant::now();
        let mut state = self
            .endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointState {
                hits: VecDeque::with_capacity(self.max_requests as usize),
                locked_until: None,
                last_seen: now,
            });
        state.last_seen = now;

        if let Some(until) = state.locked_until {
            if now < until {
                return false;
            }
            state.locked_until = None;
            state.hits.clear();
        }

        while let Some(&front) = state.hits.front() {
            if now.duration_since(front) >= self.window {
                state.hits.pop_front();
            } else {
                break;
            }
        }

        if state.hits.len() >= self.max_requests as usize {
            state.locked_until = Some(now + self.lockout);
            return false;
        }

        state.hits.push_back(now);
        true
    }

    /// Drop endpoints whose last touch is older than `max_age` and that
    /// are not locked out. Invoked by the task-manager sweep.
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.endpoints.len();
        self.endpoints.retain(|_, state| {
            let locked = state.locked_until.is_some_and(|until| now < until);
            locked || now.duration_since(state.last_seen) < max_age
        });
        before - self.endpoints.len()
    }

    /// Endpoints currently tracked.
    pub fn tracked(&self) -> usize {
        self.endpoints.len()
    }
}
