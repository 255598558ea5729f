// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Recurring jobs with deadline-based ticks.
//!
//! The next deadline is `last_deadline + interval`, never `now + interval`,
//! so steady-state ticks do not drift. Non-reentrant jobs (the default)
//! run their work inline in the scheduler task; a tick whose deadline
//! passed while the previous run was still executing is skipped outright.
//! Failures push the next deadline out by `interval * 2^failures`, capped
//! at `max_backoff` and reset on the first success.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::time::{Instant, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{tasks::TaskFuture, time::clock::Clock};

/// The job body. Receives a child token that is cancelled when the job or
/// the whole manager shuts down.
pub type RecurringWork =
    Arc<dyn Fn(CancellationToken) -> TaskFuture<anyhow::Result<()>> + Send + Sync>;

pub type CompletedHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type FailedHook = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RecurringOptions {
    /// Uniform random delay in `[0, jitter]` added to every deadline.
    pub jitter: Duration,
    /// Per-tick execution timeout; expiry counts as a failure.
    pub timeout: Option<Duration>,
    /// Cap for the exponential failure backoff. Zero means "no backoff".
    pub max_backoff: Duration,
    /// Allow ticks to overlap. Overlapping ticks are spawned instead of
    /// awaited and never skip.
    pub reentrant: bool,
    pub on_completed: Option<CompletedHook>,
    pub on_failed: Option<FailedHook>,
}

/// Queryable state of one scheduled job.
#[derive(Debug)]
pub struct RecurringHandle {
    pub name: String,
    pub interval: Duration,
    total_runs: AtomicU64,
    consecutive_failures: AtomicU32,
    last_run_unix_ms: AtomicU64,
    next_run_unix_ms: AtomicU64,
    is_running: AtomicBool,
    cancel: CancellationToken,
}

impl RecurringHandle {
    pub(crate) fn new(name: String, interval: Duration, cancel: CancellationToken) -> Self {
        Self {
            name,
            interval,
            total_runs: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            last_run_unix_ms: AtomicU64::new(0),
            next_run_unix_ms: AtomicU64::new(0),
            is_running: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn total_runs(&self) -> u64 {
        self.total_runs.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_run_unix_ms(&self) -> u64 {
        self.last_run_unix_ms.load(Ordering::Relaxed)
    }

    pub fn last_run_utc(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.last_run_unix_ms() as i64)
            .unwrap_or_default()
    }

    pub fn next_run_unix_ms(&self) -> u64 {
        self.next_run_unix_ms.load(Ordering::Relaxed)
    }

    pub fn next_run_utc(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.next_run_unix_ms() as i64)
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    /// Stop the job. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

fn jitter_sample(jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return Duration::ZERO;
    }
    use rand::RngExt;
    Duration::from_millis(rand::rng().random_range(0..=jitter.as_millis() as u64))
}

/// Drive one scheduled job until its token fires. Runs inside a spawned
/// task owned by the manager.
pub(crate) async fn run_schedule(
    handle: Arc<RecurringHandle>,
    clock: Arc<Clock>,
    work: RecurringWork,
    options: RecurringOptions,
) {
    let interval = handle.interval;
    let mut deadline = Instant::now() + interval + jitter_sample(options.jitter);
    publish_next(&handle, &clock, deadline);

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            _ = sleep_until(deadline) => {},
        }

        if options.reentrant {
            spawn_reentrant_tick(&handle, &clock, &work, &options);
            deadline += interval + jitter_sample(options.jitter);
            publish_next(&handle, &clock, deadline);
            continue;
        }

        let outcome = run_tick(&handle, &clock, &work, &options).await;

        let step = match outcome {
            Ok(()) => {
                handle.consecutive_failures.store(0, Ordering::Relaxed);
                if let Some(hook) = &options.on_completed {
                    hook(&handle.name);
                }
                interval
            },
            Err(err) => {
                let failures =
                    handle.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(job = %handle.name, failures, "recurring tick failed: {err:#}");
                if let Some(hook) = &options.on_failed {
                    hook(&handle.name, &err);
                }
                backoff_delay(interval, failures, options.max_backoff)
            },
        };

        deadline += step + jitter_sample(options.jitter);
        // A run that overshot its next deadline skips the missed ticks.
        let now = Instant::now();
        while deadline <= now {
            debug!(job = %handle.name, "skipping missed tick");
            deadline += interval;
        }
        publish_next(&handle, &clock, deadline);
    }

    handle.is_running.store(false, Ordering::Relaxed);
    debug!(job = %handle.name, "recurring job stopped");
}

async fn run_tick(
    handle: &Arc<RecurringHandle>,
    clock: &Arc<Clock>,
    work: &RecurringWork,
    options: &RecurringOptions,
) -> anyhow::Result<()> {
    handle.is_running.store(true, Ordering::Relaxed);
    handle.total_runs.fetch_add(1, Ordering::Relaxed);
    handle
        .last_run_unix_ms
        .store(clock.unix_ms(), Ordering::Relaxed);

    let fut = work(handle.cancel.child_token());
    let result = match options.timeout {
        Some(limit) => match timeout(limit, fut).await {
            Ok(inner) => inner,
            Err(_) => Err(anyhow::anyhow!("tick exceeded {limit:?}")),
        },
        None => fut.await,
    };

    handle.is_running.store(false, Ordering::Relaxed);
    result
}

fn spawn_reentrant_tick(
    handle: &Arc<RecurringHandle>,
    clock: &Arc<Clock>,
    work: &RecurringWork,
    options: &RecurringOptions,
) {
    let handle = Arc::clone(handle);
    let clock = Arc::clone(clock);
    let work = Arc::clone(work);
    let options = options.clone();
    tokio::spawn(async move {
        if let Err(err) = run_tick(&handle, &clock, &work, &options).await {
            let failures =
                handle.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(job = %handle.name, failures, "recurring tick failed: {err:#}");
            if let Some(hook) = &options.on_failed {
                hook(&handle.name, &err);
            }
        } else {
            handle.consecutive_failures.store(0, Ordering::Relaxed);
            if let Some(hook) = &options.on_completed {
                hook(&handle.name);
            }
        }
    });
}

fn backoff_delay(interval: Duration, failures: u32, max_backoff: Duration) -> Duration {
    let factor = 1u32 << failures.min(16);
    let delayed = interval.saturating_mul(factor);
    if max_backoff.is_zero() {
        interval
    } else {
        delayed.min(max_backoff)
    }
}

fn publish_next(handle: &RecurringHandle, clock: &Clock, deadline: Instant) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    handle
        .next_run_unix_ms
        .store(clock.unix_ms() + remaining.as_millis() as u64, Ordering::Relaxed);
}
