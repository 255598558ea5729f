// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use tokio::{net::TcpStream, time::sleep, time::timeout};

use crate::integration_tests::common::{
    OPCODE_ECHO, binary_frame, read_frame, start_echo_server, write_frame,
};

/// With `max_per_address = 2`, the third connection from the same address
/// is closed right after accept without receiving a single byte, and
/// closing one of the first two frees the slot again.
#[tokio::test]
async fn third_connection_from_one_address_is_rejected() -> Result<()> {
    let harness = start_echo_server(|cfg| {
        cfg.connection.max_per_address = 2;
    })
    .await?;

    let first = TcpStream::connect(harness.addr).await?;
    let second = TcpStream::connect(harness.addr).await?;
    sleep(Duration::from_millis(50)).await;

    let mut third = TcpStream::connect(harness.addr).await?;
    let outcome = timeout(Duration::from_secs(1), read_frame(&mut third)).await;
    match outcome {
        Ok(Err(_)) => {}, // EOF or reset, nothing was sent first
        Ok(Ok(frame)) => panic!("rejected socket received bytes: {frame:?}"),
        Err(_) => panic!("rejected socket was not closed promptly"),
    }

    // Releasing a slot readmits the address.
    drop(first);
    sleep(Duration::from_millis(100)).await;
    let mut fourth = TcpStream::connect(harness.addr).await?;
    write_frame(&mut fourth, &binary_frame(OPCODE_ECHO, b"back")?).await?;
    let raw = timeout(Duration::from_secs(1), read_frame(&mut fourth))
        .await
        .expect("slot was released")?;
    assert!(harness.catalog.decode(&raw).is_ok());

    drop(second);
    harness.server.shutdown().await;
    Ok(())
}
