// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use packet_server_rs::{
    client::PacketClient,
    packet::{binary::BinaryPacket, catalog::AnyPacket, flags::PacketFlags},
};

use crate::integration_tests::common::{OPCODE_ECHO, start_echo_server};

/// A payload several times the frame ceiling goes out as a fragment run,
/// reaches the handler as one message, and the echo comes back as a run
/// the client reassembles.
#[tokio::test]
async fn large_message_round_trips_as_fragments() -> Result<()> {
    let harness = start_echo_server(|_| {}).await?;
    let mut client = PacketClient::connect(harness.addr).await?;

    let payload: Vec<u8> = (0..200_000usize).map(|i| (i % 251) as u8).collect();
    client
        .send(AnyPacket::Binary(BinaryPacket::new(
            OPCODE_ECHO,
            Bytes::from(payload.clone()),
        )))
        .await?;

    let AnyPacket::Binary(reply) = client.recv().await? else {
        panic!("expected a binary echo");
    };
    assert!(!reply.flags.contains(PacketFlags::FRAGMENTED));
    assert_eq!(reply.payload_bytes().len(), payload.len());
    assert_eq!(reply.payload_bytes().as_ref(), &payload[..]);

    harness.server.shutdown().await;
    Ok(())
}

/// Fragment runs interleaved with a frame of a different opcode are a
/// protocol violation; the server closes the connection.
#[tokio::test]
async fn interleaved_fragment_run_closes_the_connection() -> Result<()> {
    let harness = start_echo_server(|_| {}).await?;
    let mut client = PacketClient::connect(harness.addr).await?;

    let mut opener = BinaryPacket::new(OPCODE_ECHO, Bytes::from_static(b"part one"));
    opener.flags = PacketFlags::FRAGMENTED;
    client.send(AnyPacket::Binary(opener)).await?;

    // Different opcode mid-run.
    client
        .send(AnyPacket::Binary(BinaryPacket::new(
            99,
            Bytes::from_static(b"stray"),
        )))
        .await?;

    let closed = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        client.recv(),
    )
    .await
    .expect("connection should close promptly");
    assert!(closed.is_err(), "no reply after a broken run");

    harness.server.shutdown().await;
    Ok(())
}
