// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use packet_server_rs::server::listener::ListenerState;
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    time::{sleep, timeout},
};

use crate::integration_tests::common::{
    OPCODE_ECHO, binary_frame, read_frame, start_echo_server, write_frame,
};

/// Shutdown with open connections and queued frames: the listener reports
/// `Stopped`, every buffer lease finds its way back to the pool, and the
/// clients observe their sockets closing.
#[tokio::test]
async fn shutdown_drains_connections_and_leases() -> Result<()> {
    let harness = start_echo_server(|cfg| {
        cfg.connection.max_per_address = 64;
        cfg.connection.drain_grace = Duration::from_millis(500);
    })
    .await?;

    // A bed of connections that completed at least one exchange.
    let mut streams = Vec::new();
    for i in 0..10u32 {
        let mut stream = TcpStream::connect(harness.addr).await?;
        let payload = format!("warmup-{i}");
        write_frame(&mut stream, &binary_frame(OPCODE_ECHO, payload.as_bytes())?)
            .await?;
        let _ = read_frame(&mut stream).await?;
        streams.push(stream);
    }

    // Leave some unread traffic in flight at shutdown time.
    for stream in streams.iter_mut().take(5) {
        write_frame(stream, &binary_frame(OPCODE_ECHO, b"in-flight")?).await?;
    }

    harness.server.shutdown().await;

    let mut state = harness
        .server
        .listener_state()
        .expect("listener was activated");
    assert_eq!(*state.borrow_and_update(), ListenerState::Stopped);

    // All leases returned: nothing outstanding once the runtime stopped.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.server.buffer_pool().outstanding(), 0);
    assert_eq!(
        harness.server.connections().count(),
        0,
        "registry drained on disconnect"
    );

    // Clients see their sockets close.
    for mut stream in streams {
        let eof = timeout(Duration::from_secs(2), async {
            let mut sink = [0u8; 256];
            loop {
                match stream.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {},
                }
            }
        })
        .await;
        assert!(eof.is_ok(), "socket did not close");
    }

    // New connections are refused once stopped.
    let refused = TcpStream::connect(harness.addr).await;
    if let Ok(mut stream) = refused {
        let eof = timeout(Duration::from_secs(1), read_frame(&mut stream)).await;
        assert!(
            !matches!(eof, Ok(Ok(_))),
            "stopped listener must not serve frames"
        );
    }

    Ok(())
}
