// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use packet_server_rs::{
    dispatch::{
        handler::{BusyPolicy, HandlerOptions},
        reply::Reply,
    },
    packet::{
        binary::{BinaryPacket, MAGIC_BINARY},
        catalog::{AnyPacket, PacketBody},
    },
};
use tokio::{net::TcpStream, time::sleep};

use crate::integration_tests::common::{
    binary_frame, read_frame, start_server_with, write_frame,
};

const OPCODE_PRIVILEGED: u16 = 20;
const OPCODE_PARALLEL: u16 = 21;

/// A handler registered with a minimum level above the connection's
/// default of zero short-circuits at the permission stage.
#[tokio::test]
async fn privileged_opcode_is_denied_at_level_zero() -> Result<()> {
    let harness = start_server_with(
        |_| {},
        None,
        |builder| {
            builder.register(
                MAGIC_BINARY,
                OPCODE_PRIVILEGED,
                HandlerOptions {
                    min_level: 1,
                    ..HandlerOptions::default()
                },
                |_packet, _conn, _cancel| Box::pin(async { Ok(Reply::Text("granted".into())) }),
            )?;
            Ok(())
        },
    )
    .await?;

    let mut stream = TcpStream::connect(harness.addr).await?;
    write_frame(&mut stream, &binary_frame(OPCODE_PRIVILEGED, b"sudo")?).await?;

    let raw = read_frame(&mut stream).await?;
    let AnyPacket::Text(notice) = harness.catalog.decode(&raw).expect("decode")
    else {
        panic!("expected a permission notice");
    };
    assert_eq!(notice.text().expect("utf8"), "Permission denied.");

    harness.server.shutdown().await;
    Ok(())
}

/// A parallel handler with the reject policy: the second submission of
/// the same opcode while the first is still running gets a busy notice,
/// and the first still completes.
#[tokio::test]
async fn reject_policy_answers_busy_while_running() -> Result<()> {
    let harness = start_server_with(
        |_| {},
        None,
        |builder| {
            builder.register(
                MAGIC_BINARY,
                OPCODE_PARALLEL,
                HandlerOptions {
                    parallel_per_connection: true,
                    busy: BusyPolicy::Reject,
                    ..HandlerOptions::default()
                },
                |packet, _conn, _cancel| {
                    Box::pin(async move {
                        sleep(Duration::from_millis(300)).await;
                        let payload = Bytes::copy_from_slice(packet.payload());
                        Ok(Reply::Packet(AnyPacket::Binary(BinaryPacket::new(
                            OPCODE_PARALLEL,
                            payload,
                        ))))
                    })
                },
            )?;
            Ok(())
        },
    )
    .await?;

    let mut stream = TcpStream::connect(harness.addr).await?;
    write_frame(&mut stream, &binary_frame(OPCODE_PARALLEL, b"first")?).await?;
    write_frame(&mut stream, &binary_frame(OPCODE_PARALLEL, b"second")?).await?;

    let mut busy_notices = 0;
    let mut echoes = 0;
    for _ in 0..2 {
        let raw = read_frame(&mut stream).await?;
        match harness.catalog.decode(&raw).expect("decode") {
            AnyPacket::Text(notice) => {
                assert_eq!(notice.text().expect("utf8"), "Busy.");
                busy_notices += 1;
            },
            AnyPacket::Binary(reply) => {
                // Which of the two wins the guard is a race; exactly one
                // must complete.
                assert!(matches!(
                    reply.payload_bytes().as_ref(),
                    b"first" | b"second"
                ));
                echoes += 1;
            },
        }
    }
    assert_eq!(busy_notices, 1, "second submission rejected");
    assert_eq!(echoes, 1, "first submission completed");

    harness.server.shutdown().await;
    Ok(())
}
