// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use packet_server_rs::{
    codec::crypto::{CipherAlgorithm, CipherSuite},
    packet::{binary::BinaryPacket, catalog::AnyPacket, flags::PacketFlags},
};
use tokio::net::TcpStream;

use crate::integration_tests::common::{
    CipherOnAccept, OPCODE_ECHO, TEST_KEY, read_frame, start_server_with,
    write_frame,
};

/// AES-GCM round trip through the unwrap/wrap stages: the wire carries
/// `nonce(12) | ciphertext | tag(16)`, the handler observes "ping", and
/// the reply comes back encrypted because the request was.
#[tokio::test]
async fn aes_gcm_payload_reaches_the_handler_in_plaintext() -> Result<()> {
    let harness =
        start_server_with(|_| {}, Some(Arc::new(CipherOnAccept)), |_| Ok(()))
            .await?;
    let suite = CipherSuite::new(CipherAlgorithm::Aes256Gcm, TEST_KEY);

    let mut stream = TcpStream::connect(harness.addr).await?;

    let wire_payload = suite.encrypt(b"ping").expect("encrypt");
    assert_eq!(wire_payload.len(), 12 + 4 + 16, "nonce | ct | tag");

    let mut packet = BinaryPacket::new(OPCODE_ECHO, Bytes::from(wire_payload));
    packet.flags = PacketFlags::ENCRYPTED;
    write_frame(&mut stream, &packet.serialize().expect("serialize")).await?;

    let raw = read_frame(&mut stream).await?;
    let AnyPacket::Binary(reply) = harness.catalog.decode(&raw).expect("decode")
    else {
        panic!("expected a binary echo");
    };
    assert!(
        reply.flags.contains(PacketFlags::ENCRYPTED),
        "reply mirrors the request's encryption"
    );
    let plain = suite.decrypt(reply.payload_bytes()).expect("decrypt reply");
    assert_eq!(plain, b"ping", "handler echoed the plaintext");

    harness.server.shutdown().await;
    Ok(())
}

/// A tampered tag never reaches the handler; the connection is closed
/// with no notice leaking whether key or tag was wrong.
#[tokio::test]
async fn tampered_ciphertext_closes_the_connection() -> Result<()> {
    let harness =
        start_server_with(|_| {}, Some(Arc::new(CipherOnAccept)), |_| Ok(()))
            .await?;
    let suite = CipherSuite::new(CipherAlgorithm::Aes256Gcm, TEST_KEY);

    let mut stream = TcpStream::connect(harness.addr).await?;

    let mut wire_payload = suite.encrypt(b"ping").expect("encrypt");
    let last = wire_payload.len() - 1;
    wire_payload[last] ^= 0x01;

    let mut packet = BinaryPacket::new(OPCODE_ECHO, Bytes::from(wire_payload));
    packet.flags = PacketFlags::ENCRYPTED;
    write_frame(&mut stream, &packet.serialize().expect("serialize")).await?;

    // The server tears the connection down instead of replying.
    let eof = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        read_frame(&mut stream),
    )
    .await
    .expect("connection should close promptly");
    assert!(eof.is_err(), "no bytes after an authentication failure");

    harness.server.shutdown().await;
    Ok(())
}
