// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use packet_server_rs::{
    client::PacketClient,
    codec::crypto::CipherAlgorithm,
    dispatch::{key_exchange::register_key_exchange, ping},
    packet::{
        binary::BinaryPacket,
        catalog::{AnyPacket, PacketBody},
    },
    time::clock::Clock,
};

use crate::integration_tests::common::start_server_with;

const OPCODE_PING: u16 = 30;
const OPCODE_KEYS: u16 = 31;

/// The pong copies the request's stamps back unchanged, so the client
/// measures RTT against its own monotonic clock.
#[tokio::test]
async fn ping_carries_the_stamps_back() -> Result<()> {
    let harness = start_server_with(
        |_| {},
        None,
        |builder| {
            ping::register_ping(builder, OPCODE_PING)?;
            Ok(())
        },
    )
    .await?;

    let clock = Clock::default();
    let mut client = PacketClient::connect(harness.addr).await?;

    let request = BinaryPacket::new(OPCODE_PING, Bytes::from_static(b"probe"))
        .stamped(&clock);
    let sent_ticks = request.mono_ticks;
    client.send(AnyPacket::Binary(request)).await?;

    let AnyPacket::Binary(pong) = client.recv().await? else {
        panic!("expected a pong");
    };
    assert_eq!(pong.payload_bytes().as_ref(), b"probe");
    assert_eq!(pong.mono_ticks, sent_ticks, "stamps echoed untouched");

    let rtt = ping::round_trip_micros(&clock, &pong).expect("same clock");
    assert!(rtt < 5_000_000, "loopback rtt sane, got {rtt}us");

    harness.server.shutdown().await;
    Ok(())
}

/// The client-side handshake convenience negotiates a suite end to end:
/// key exchange, then an encrypted echo decrypted by `recv_plain`.
#[tokio::test]
async fn client_handshake_then_wrapped_echo() -> Result<()> {
    let harness = start_server_with(
        |_| {},
        None,
        |builder| {
            register_key_exchange(builder, OPCODE_KEYS, CipherAlgorithm::Aes256Gcm)?;
            Ok(())
        },
    )
    .await?;

    let mut client = PacketClient::connect(harness.addr).await?;
    client
        .handshake(OPCODE_KEYS, CipherAlgorithm::Aes256Gcm)
        .await?;
    assert!(client.cipher().is_some());

    client
        .send_wrapped(
            AnyPacket::Binary(BinaryPacket::new(
                crate::integration_tests::common::OPCODE_ECHO,
                Bytes::from_static(b"sealed echo"),
            )),
            true,
        )
        .await?;

    let reply = client.recv_plain().await?;
    assert_eq!(reply.payload(), b"sealed echo");
    assert!(reply.flags().is_empty(), "transforms peeled off");

    harness.server.shutdown().await;
    Ok(())
}
