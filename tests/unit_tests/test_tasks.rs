// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::bail;
use packet_server_rs::{
    tasks::{
        manager::{TaskDefaults, TaskManager},
        recurring::RecurringOptions,
        worker::{WorkerOptions, WorkerOutcome},
    },
    time::clock::Clock,
};
use tokio::time::{Instant, sleep, timeout};

fn manager() -> Arc<TaskManager> {
    TaskManager::new(Arc::new(Clock::default()), 1, TaskDefaults {
        retain_for: Duration::from_millis(200),
        ..TaskDefaults::default()
    })
}

async fn wait_for(mut probe: impl FnMut() -> bool) {
    timeout(Duration::from_secs(30), async {
        while !probe() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn non_reentrant_ticks_never_overlap_and_skip_missed_deadlines() {
    let manager = manager();
    let in_flight = Arc::new(AtomicU32::new(0));
    let overlaps = Arc::new(AtomicU32::new(0));

    let (flight, seen) = (Arc::clone(&in_flight), Arc::clone(&overlaps));
    let handle = manager
        .schedule(
            "slow-job",
            Duration::from_millis(100),
            Arc::new(move |_cancel| {
                let flight = Arc::clone(&flight);
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    if flight.fetch_add(1, Ordering::SeqCst) > 0 {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                    sleep(Duration::from_millis(250)).await;
                    flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
            RecurringOptions::default(),
        )
        .expect("schedule");

    sleep(Duration::from_millis(1500)).await;
    handle.cancel();

    assert_eq!(overlaps.load(Ordering::SeqCst), 0, "non-reentrant by default");
    // 100 ms cadence with 250 ms work: overruns skip missed deadlines.
    let runs = handle.total_runs();
    assert!(runs >= 3, "ran at least a few times, got {runs}");
    assert!(runs <= 6, "missed ticks are skipped, got {runs}");
}

#[tokio::test(start_paused = true)]
async fn failure_backs_off_then_resets_on_success() {
    let manager = manager();
    let times: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));

    let recorded = Arc::clone(&times);
    let handle = manager
        .schedule(
            "flaky-job",
            Duration::from_millis(100),
            Arc::new(move |_cancel| {
                let recorded = Arc::clone(&recorded);
                Box::pin(async move {
                    let run = {
                        let mut guard = recorded.lock().expect("lock");
                        guard.push(Instant::now());
                        guard.len()
                    };
                    if run == 3 {
                        bail!("simulated failure on run 3");
                    }
                    Ok(())
                })
            }),
            RecurringOptions {
                max_backoff: Duration::from_secs(5),
                ..RecurringOptions::default()
            },
        )
        .expect("schedule");

    // Right after the failing run the failure counter reads 1.
    wait_for(|| handle.consecutive_failures() == 1).await;

    wait_for(|| times.lock().expect("lock").len() >= 6).await;
    handle.cancel();

    let times = times.lock().expect("lock");
    let gap_3_4 = times[3] - times[2];
    let gap_4_5 = times[4] - times[3];
    assert!(
        gap_3_4 >= Duration::from_millis(195),
        "failure doubles the delay, got {gap_3_4:?}"
    );
    assert!(
        gap_4_5 < Duration::from_millis(150),
        "success resets to the base interval, got {gap_4_5:?}"
    );
    assert_eq!(handle.consecutive_failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn group_concurrency_stays_under_the_cap() {
    let manager = manager();
    let current = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for index in 0..6 {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        let handle = manager
            .schedule_worker(
                &format!("crunch-{index}"),
                "crunchers",
                Box::new(move |_ctx| {
                    Box::pin(async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                }),
                WorkerOptions {
                    group_concurrency_limit: Some(2),
                    ..WorkerOptions::default()
                },
            )
            .expect("schedule worker");
        handles.push(handle);
    }

    wait_for(|| {
        handles
            .iter()
            .all(|h| h.outcome() == WorkerOutcome::Completed)
    })
    .await;
    assert!(peak.load(Ordering::SeqCst) <= 2, "cap of 2 held");
}

#[tokio::test(start_paused = true)]
async fn immediate_slot_acquisition_cancels_instead_of_queueing() {
    let manager = manager();

    let blocker = manager
        .schedule_worker(
            "blocker",
            "exclusive",
            Box::new(|_ctx| {
                Box::pin(async move {
                    sleep(Duration::from_millis(500)).await;
                    Ok(())
                })
            }),
            WorkerOptions {
                group_concurrency_limit: Some(1),
                ..WorkerOptions::default()
            },
        )
        .expect("schedule blocker");
    wait_for(|| blocker.is_running()).await;

    let impatient = manager
        .schedule_worker(
            "impatient",
            "exclusive",
            Box::new(|_ctx| Box::pin(async move { Ok(()) })),
            WorkerOptions {
                try_acquire_slot_immediately: true,
                ..WorkerOptions::default()
            },
        )
        .expect("schedule impatient");

    wait_for(|| impatient.outcome() == WorkerOutcome::Cancelled).await;
    assert_eq!(blocker.outcome(), WorkerOutcome::Pending, "blocker unaffected");
}

#[tokio::test(start_paused = true)]
async fn finished_workers_stay_queryable_for_the_retention_window() {
    let manager = manager();
    let handle = manager
        .schedule_worker(
            "short-lived",
            "misc",
            Box::new(|ctx| {
                Box::pin(async move {
                    ctx.advance(5, Some("halfway"));
                    ctx.beat();
                    Ok(())
                })
            }),
            WorkerOptions::default(),
        )
        .expect("schedule");

    wait_for(|| handle.outcome() == WorkerOutcome::Completed).await;
    let queried = manager.worker(handle.id).expect("retained after completion");
    assert_eq!(queried.progress(), 5);
    assert_eq!(queried.last_note().as_deref(), Some("halfway"));
    assert!(!queried.is_running());

    // Past the retention window the handle disappears.
    wait_for(|| manager.worker(handle.id).is_none()).await;
}

#[tokio::test(start_paused = true)]
async fn cancel_group_cancels_only_that_group() {
    let manager = manager();
    let spin = |_ctx: packet_server_rs::tasks::worker::WorkerContext| {
        Box::pin(async move {
            sleep(Duration::from_secs(60)).await;
            Ok(())
        }) as packet_server_rs::tasks::TaskFuture<anyhow::Result<()>>
    };

    let doomed = manager
        .schedule_worker("doomed", "alpha", Box::new(spin), WorkerOptions::default())
        .expect("schedule");
    let survivor = manager
        .schedule_worker("survivor", "beta", Box::new(spin), WorkerOptions::default())
        .expect("schedule");
    wait_for(|| doomed.is_running() && survivor.is_running()).await;

    assert_eq!(manager.cancel_group("alpha"), 1);
    wait_for(|| doomed.outcome() == WorkerOutcome::Cancelled).await;
    assert!(survivor.is_running(), "other groups keep running");

    assert_eq!(manager.cancel_all_workers(), 2);
    wait_for(|| survivor.outcome() == WorkerOutcome::Cancelled).await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_recurring_jobs() {
    let manager = manager();
    let runs = Arc::new(AtomicU32::new(0));
    let counted = Arc::clone(&runs);
    manager
        .schedule(
            "counting",
            Duration::from_millis(50),
            Arc::new(move |_cancel| {
                let counted = Arc::clone(&counted);
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
            RecurringOptions::default(),
        )
        .expect("schedule");

    wait_for(|| runs.load(Ordering::SeqCst) >= 2).await;
    manager.shutdown();
    sleep(Duration::from_millis(50)).await;
    let snapshot = runs.load(Ordering::SeqCst);
    sleep(Duration::from_millis(500)).await;
    assert_eq!(runs.load(Ordering::SeqCst), snapshot, "no ticks after shutdown");
}
