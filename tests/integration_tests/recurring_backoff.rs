// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Result, bail};
use packet_server_rs::{
    tasks::{
        manager::{TaskDefaults, TaskManager},
        recurring::RecurringOptions,
    },
    time::clock::Clock,
};
use serial_test::serial;
use tokio::time::{Instant, sleep, timeout};

/// Real-time rendition of the jitter/backoff schedule: interval 100 ms,
/// jitter up to 20 ms, one forced failure on run 3. The failure doubles
/// the next delay; the first success afterwards returns to the base
/// interval.
#[tokio::test]
#[serial]
async fn recurring_job_with_jitter_and_backoff() -> Result<()> {
    let manager = TaskManager::new(
        Arc::new(Clock::default()),
        1,
        TaskDefaults::default(),
    );

    let times: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&times);
    let handle = manager.schedule(
        "flaky",
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
                    bail!("forced failure");
                }
                Ok(())
            })
        }),
        RecurringOptions {
            jitter: Duration::from_millis(20),
            max_backoff: Duration::from_secs(2),
            ..RecurringOptions::default()
        },
    )?;

    // consecutive_failures reads 1 right after the failing run.
    timeout(Duration::from_secs(2), async {
        while handle.consecutive_failures() != 1 {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("failure recorded after run 3");

    timeout(Duration::from_secs(3), async {
        while times.lock().expect("lock").len() < 6 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("six runs");
    handle.cancel();

    let times = times.lock().expect("lock");
    let gap_after_failure = times[3] - times[2];
    let gap_after_success = times[4] - times[3];
    assert!(
        gap_after_failure >= Duration::from_millis(190),
        "backoff doubles the interval, got {gap_after_failure:?}"
    );
    assert!(
        gap_after_success <= Duration::from_millis(190),
        "success resets to the base interval, got {gap_after_success:?}"
    );
    assert_eq!(handle.consecutive_failures(), 0, "reset after success");

    manager.shutdown();
    Ok(())
}
