// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The task manager: recurring jobs and tracked workers behind one
//! registry, with hierarchical cancellation.
//!
//! Unhandled errors inside a tick or a worker reach the `on_failed` hook
//! and the log; they never tear the manager down. `shutdown()` cancels the
//! root token, which fans out to every job and worker.

use std::{sync::Arc, time::Duration};

use anyhow::{Result, bail};
use dashmap::DashMap;
use tokio::{sync::Semaphore, time::sleep, time::timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    tasks::{
        recurring::{RecurringHandle, RecurringOptions, RecurringWork, run_schedule},
        worker::{WorkerContext, WorkerHandle, WorkerOptions, WorkerOutcome, WorkerWork},
    },
    time::{
        clock::Clock,
        snowflake::{IdKind, SnowflakeGenerator, SnowflakeId},
    },
};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TaskDefaults {
    /// Retention window for finished handles.
    #[serde(with = "crate::cfg::config::serde_millis")]
    pub retain_for: Duration,
    /// Frequency of the built-in coarse-clock tick.
    pub tick_frequency_hz: u32,
    /// Machine field of generated snowflake ids.
    pub machine_id: u16,
    /// Cadence of the runtime metrics flush.
    #[serde(with = "crate::cfg::config::serde_millis")]
    pub metrics_interval: Duration,
}

impl Default for TaskDefaults {
    fn default() -> Self {
        Self {
            retain_for: Duration::from_secs(30),
            tick_frequency_hz: 1,
            machine_id: 1,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

pub struct TaskManager {
    clock: Arc<Clock>,
    ids: SnowflakeGenerator,
    machine_id: u16,
    defaults: TaskDefaults,
    recurring: DashMap<String, Arc<RecurringHandle>>,
    workers: DashMap<SnowflakeId, Arc<WorkerHandle>>,
    groups: DashMap<String, Arc<Semaphore>>,
    root: CancellationToken,
}

impl TaskManager {
    pub fn new(clock: Arc<Clock>, machine_id: u16, defaults: TaskDefaults) -> Arc<Self> {
        Arc::new(Self {
            ids: SnowflakeGenerator::new(Arc::clone(&clock), IdKind::Worker, machine_id),
            clock,
            machine_id,
            defaults,
            recurring: DashMap::new(),
            workers: DashMap::new(),
            groups: DashMap::new(),
            root: CancellationToken::new(),
        })
    }

    #[inline]
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    #[inline]
    pub fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    /// The built-in tick that refreshes `Clock::coarse_ms` for the
    /// time-expiry subsystems. Listener activation calls this once.
    pub fn start_clock_tick(self: &Arc<Self>) {
        let hz = self.defaults.tick_frequency_hz.max(1);
        let interval = Duration::from_millis(1000 / hz as u64);
        let clock = Arc::clone(&self.clock);
        let result = self.schedule(
            "clock-tick",
            interval,
            Arc::new(move |_cancel| {
                let clock = Arc::clone(&clock);
                Box::pin(async move {
                    clock.refresh_coarse();
                    Ok(())
                })
            }),
            RecurringOptions::default(),
        );
        if let Err(err) = result {
            debug!("clock tick already scheduled: {err:#}");
        }
    }

    // ── Recurring ────────────────────────────────────────────────────────

    /// Register and start a recurring job. Names are unique.
    pub fn schedule(
        self: &Arc<Self>,
        name: &str,
        interval: Duration,
        work: RecurringWork,
        options: RecurringOptions,
    ) -> Result<Arc<RecurringHandle>> {
        if interval.is_zero() {
            bail!("recurring interval must be positive");
        }
        let handle = Arc::new(RecurringHandle::new(
            name.to_string(),
            interval,
            self.root.child_token(),
        ));
        match self.recurring.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                handle.cancel();
                bail!("recurring job {name:?} is already scheduled");
            },
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
            },
        }

        tokio::spawn(run_schedule(
            Arc::clone(&handle),
            Arc::clone(&self.clock),
            work,
            options,
        ));
        Ok(handle)
    }

    pub fn recurring(&self) -> Vec<Arc<RecurringHandle>> {
        self.recurring.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn recurring_by_name(&self, name: &str) -> Option<Arc<RecurringHandle>> {
        self.recurring.get(name).map(|e| Arc::clone(e.value()))
    }

    /// Cancel a job and retain its handle for the default window.
    pub fn cancel_recurring(self: &Arc<Self>, name: &str) -> bool {
        let Some(handle) = self.recurring_by_name(name) else {
            return false;
        };
        handle.cancel();
        let manager = Arc::clone(self);
        let name = name.to_string();
        let retain = self.defaults.retain_for;
        tokio::spawn(async move {
            sleep(retain).await;
            manager.recurring.remove(&name);
        });
        true
    }

    // ── Workers ──────────────────────────────────────────────────────────

    /// Register and start a tracked worker in `group`.
    pub fn schedule_worker(
        self: &Arc<Self>,
        name: &str,
        group: &str,
        work: WorkerWork,
        options: WorkerOptions,
    ) -> Result<Arc<WorkerHandle>> {
        let id = match options.id_kind {
            Some(kind) => {
                SnowflakeGenerator::new(Arc::clone(&self.clock), kind, self.machine_id)
                    .next_id()?
            },
            None => self.ids.next_id()?,
        };

        let cancel = self.root.child_token();
        if let Some(external) = &options.cancellation_token {
            let external = external.clone();
            let linked = cancel.clone();
            tokio::spawn(async move {
                external.cancelled().await;
                linked.cancel();
            });
        }

        let handle = Arc::new(WorkerHandle::new(
            id,
            name.to_string(),
            group.to_string(),
            options.tag.clone(),
            cancel,
            Arc::clone(&self.clock),
        ));
        self.workers.insert(id, Arc::clone(&handle));

        // First scheduling of a group fixes its concurrency limit.
        let semaphore = self
            .groups
            .entry(group.to_string())
            .or_insert_with(|| {
                let permits = options
                    .group_concurrency_limit
                    .map_or(Semaphore::MAX_PERMITS, |n| n.max(1) as usize);
                Arc::new(Semaphore::new(permits))
            })
            .clone();

        let manager = Arc::clone(self);
        let run_options = options.clone();
        let driven = Arc::clone(&handle);
        tokio::spawn(async move {
            manager.drive_worker(driven, semaphore, work, run_options).await;
        });

        Ok(handle)
    }

    async fn drive_worker(
        self: Arc<Self>,
        handle: Arc<WorkerHandle>,
        semaphore: Arc<Semaphore>,
        work: WorkerWork,
        options: WorkerOptions,
    ) {
        let cancel = handle.token().clone();

        // The group slot is claimed before any I/O the work might do.
        let permit = if options.try_acquire_slot_immediately {
            match Arc::clone(&semaphore).try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!(worker = %handle.name, group = %handle.group,
                        "no free slot, cancelling");
                    handle.cancel();
                    handle.mark_finished(WorkerOutcome::Cancelled);
                    self.retire_worker(handle, options.retain_for);
                    return;
                },
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            }
        };
        let Some(_permit) = permit else {
            handle.mark_finished(WorkerOutcome::Cancelled);
            self.retire_worker(handle, options.retain_for);
            return;
        };

        handle.mark_running();
        let fut = work(WorkerContext::new(Arc::clone(&handle)));

        let result = {
            let run = async {
                match options.execution_timeout {
                    Some(limit) => match timeout(limit, fut).await {
                        Ok(inner) => inner,
                        Err(_) => Err(anyhow::anyhow!("worker exceeded {limit:?}")),
                    },
                    None => fut.await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => None,
                result = run => Some(result),
            }
        };

        match result {
            None => {
                handle.mark_finished(WorkerOutcome::Cancelled);
                debug!(worker = %handle.name, "worker cancelled");
            },
            Some(Ok(())) => {
                handle.mark_finished(WorkerOutcome::Completed);
                if let Some(hook) = &options.on_completed {
                    hook(&handle.name);
                }
            },
            Some(Err(err)) => {
                handle.mark_finished(WorkerOutcome::Failed);
                warn!(worker = %handle.name, "worker failed: {err:#}");
                if let Some(hook) = &options.on_failed {
                    hook(&handle.name, &err);
                }
            },
        }

        self.retire_worker(handle, options.retain_for);
    }

    fn retire_worker(self: &Arc<Self>, handle: Arc<WorkerHandle>, retain: Option<Duration>) {
        let manager = Arc::clone(self);
        let retain = retain.unwrap_or(manager.defaults.retain_for);
        tokio::spawn(async move {
            sleep(retain).await;
            manager.workers.remove(&handle.id);
        });
    }

    pub fn workers(
        &self,
        running_only: bool,
        group: Option<&str>,
    ) -> Vec<Arc<WorkerHandle>> {
        self.workers
            .iter()
            .filter(|e| !running_only || e.value().is_running())
            .filter(|e| group.is_none_or(|g| e.value().group == g))
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    pub fn worker(&self, id: SnowflakeId) -> Option<Arc<WorkerHandle>> {
        self.workers.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn cancel_worker(&self, id: SnowflakeId) -> bool {
        match self.worker(id) {
            Some(handle) => {
                handle.cancel();
                true
            },
            None => false,
        }
    }

    pub fn cancel_group(&self, group: &str) -> usize {
        let handles = self.workers(false, Some(group));
        for handle in &handles {
            handle.cancel();
        }
        handles.len()
    }

    pub fn cancel_all_workers(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.workers.iter() {
            entry.value().cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Cancel everything the manager owns.
    pub fn shutdown(&self) {
        self.root.cancel();
    }
}
