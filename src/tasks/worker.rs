// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Tracked long-running workers.
//!
//! Workers belong to a group whose concurrency is enforced by a counting
//! semaphore acquired before any work (and before any I/O the work might
//! do). A worker reports liveness through `beat()` and progress through
//! `advance(delta, note)`. After completion the handle stays queryable for
//! the retention window, then disappears from the registry.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio_util::sync::CancellationToken;

use crate::{
    tasks::TaskFuture,
    tasks::recurring::{CompletedHook, FailedHook},
    time::{clock::Clock, snowflake::IdKind, snowflake::SnowflakeId},
};

/// The worker body. Consumed once.
pub type WorkerWork =
    Box<dyn FnOnce(WorkerContext) -> TaskFuture<anyhow::Result<()>> + Send>;

#[derive(Clone, Default)]
pub struct WorkerOptions {
    /// Free-form label surfaced by the query API.
    pub tag: Option<String>,
    /// Domain nibble for the generated id.
    pub id_kind: Option<IdKind>,
    pub on_completed: Option<CompletedHook>,
    pub on_failed: Option<FailedHook>,
    /// Hard wall-clock limit on the work itself.
    pub execution_timeout: Option<Duration>,
    /// How long the finished handle stays queryable. `None` uses the
    /// manager default.
    pub retain_for: Option<Duration>,
    /// Fixes the group's semaphore size the first time the group is seen.
    pub group_concurrency_limit: Option<u32>,
    /// Cancel instead of queueing when no group slot is free.
    pub try_acquire_slot_immediately: bool,
    /// External token linked into the worker's own token tree.
    pub cancellation_token: Option<CancellationToken>,
}

/// Terminal state of a finished worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Pending,
    Completed,
    Failed,
    Cancelled,
}

/// Queryable state of one scheduled worker.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: SnowflakeId,
    pub name: String,
    pub group: String,
    pub tag: Option<String>,
    started_unix_ms: u64,
    total_runs: AtomicU64,
    progress: AtomicU64,
    last_note: Mutex<Option<String>>,
    last_heartbeat_unix_ms: AtomicU64,
    is_running: AtomicBool,
    outcome: Mutex<WorkerOutcome>,
    cancel: CancellationToken,
    clock: Arc<Clock>,
}

impl WorkerHandle {
    pub(crate) fn new(
        id: SnowflakeId,
        name: String,
        group: String,
        tag: Option<String>,
        cancel: CancellationToken,
        clock: Arc<Clock>,
    ) -> Self {
        let now = clock.unix_ms();
        Self {
            id,
            name,
            group,
            tag,
            started_unix_ms: now,
            total_runs: AtomicU64::new(0),
            progress: AtomicU64::new(0),
            last_note: Mutex::new(None),
            last_heartbeat_unix_ms: AtomicU64::new(now),
            is_running: AtomicBool::new(false),
            outcome: Mutex::new(WorkerOutcome::Pending),
            cancel,
            clock,
        }
    }

    pub fn started_unix_ms(&self) -> u64 {
        self.started_unix_ms
    }

    pub fn started_utc(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.started_unix_ms as i64)
            .unwrap_or_default()
    }

    pub fn last_heartbeat_utc(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(
            self.last_heartbeat_unix_ms.load(Ordering::Relaxed) as i64,
        )
        .unwrap_or_default()
    }

    pub fn total_runs(&self) -> u64 {
        self.total_runs.load(Ordering::Relaxed)
    }

    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Relaxed)
    }

    pub fn last_note(&self) -> Option<String> {
        match self.last_note.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn last_heartbeat_unix_ms(&self) -> u64 {
        self.last_heartbeat_unix_ms.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    pub fn outcome(&self) -> WorkerOutcome {
        match self.outcome.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Request cancellation. Idempotent; cancels only this worker.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn mark_running(&self) {
        self.is_running.store(true, Ordering::Relaxed);
        self.total_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_finished(&self, outcome: WorkerOutcome) {
        self.is_running.store(false, Ordering::Relaxed);
        match self.outcome.lock() {
            Ok(mut guard) => *guard = outcome,
            Err(poisoned) => *poisoned.into_inner() = outcome,
        }
    }
}

/// Handed to the worker body: heartbeat, progress and the cancellation
/// token the body is expected to observe at its own suspension points.
#[derive(Clone)]
pub struct WorkerContext {
    handle: Arc<WorkerHandle>,
}

impl WorkerContext {
    pub(crate) fn new(handle: Arc<WorkerHandle>) -> Self {
        Self { handle }
    }

    /// Liveness heartbeat.
    pub fn beat(&self) {
        self.handle
            .last_heartbeat_unix_ms
            .store(self.handle.clock.unix_ms(), Ordering::Relaxed);
    }

    /// Bump progress by `delta`, optionally replacing the note. Also
    /// counts as a heartbeat.
    pub fn advance(&self, delta: u64, note: Option<&str>) {
        self.handle.progress.fetch_add(delta, Ordering::Relaxed);
        if let Some(note) = note {
            match self.handle.last_note.lock() {
                Ok(mut guard) => *guard = Some(note.to_string()),
                Err(poisoned) => *poisoned.into_inner() = Some(note.to_string()),
            }
        }
        self.beat();
    }

    pub fn cancelled(&self) -> CancellationToken {
        self.handle.cancel.clone()
    }

    pub fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }
}
