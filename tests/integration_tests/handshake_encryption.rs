// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use bytes::Bytes;
use packet_server_rs::{
    codec::{
        crypto::CipherAlgorithm,
        handshake,
        lz4,
    },
    dispatch::key_exchange::register_key_exchange,
    packet::{binary::BinaryPacket, catalog::AnyPacket, flags::PacketFlags},
};
use tokio::net::TcpStream;

use crate::integration_tests::common::{
    OPCODE_ECHO, read_frame, start_server_with, write_frame,
};

const OPCODE_KEY_EXCHANGE: u16 = 10;

/// Full client flow: X25519 key exchange over a binary packet, then an
/// encrypted echo with the derived suite.
#[tokio::test]
async fn key_exchange_then_encrypted_echo() -> Result<()> {
    let harness = start_server_with(
        |_| {},
        None,
        |builder| {
            register_key_exchange(
                builder,
                OPCODE_KEY_EXCHANGE,
                CipherAlgorithm::ChaCha20Poly1305,
            )?;
            Ok(())
        },
    )
    .await?;

    let mut stream = TcpStream::connect(harness.addr).await?;

    // Exchange public keys in the clear.
    let (client_public, initiation) = handshake::initiate();
    let hello = BinaryPacket::new(
        OPCODE_KEY_EXCHANGE,
        Bytes::copy_from_slice(&client_public),
    );
    write_frame(&mut stream, &hello.serialize().expect("serialize")).await?;

    let raw = read_frame(&mut stream).await?;
    let AnyPacket::Binary(reply) = harness.catalog.decode(&raw).expect("decode")
    else {
        panic!("expected the server public key");
    };
    assert!(!reply.flags.contains(PacketFlags::ENCRYPTED), "keys are plain");
    let suite = initiation
        .finish(reply.payload_bytes(), CipherAlgorithm::ChaCha20Poly1305)
        .expect("finish handshake");

    // Encrypted echo with the derived key.
    let mut packet = BinaryPacket::new(
        OPCODE_ECHO,
        Bytes::from(suite.encrypt(b"sealed").expect("encrypt")),
    );
    packet.flags = PacketFlags::ENCRYPTED;
    write_frame(&mut stream, &packet.serialize().expect("serialize")).await?;

    let raw = read_frame(&mut stream).await?;
    let AnyPacket::Binary(echo) = harness.catalog.decode(&raw).expect("decode")
    else {
        panic!("expected a binary echo");
    };
    assert!(echo.flags.contains(PacketFlags::ENCRYPTED));
    assert_eq!(
        suite.decrypt(echo.payload_bytes()).expect("decrypt"),
        b"sealed"
    );

    harness.server.shutdown().await;
    Ok(())
}

/// LZ4 round trip through the unwrap/wrap stages: the client sends a
/// compressed payload, the handler sees the plaintext, and the reply
/// comes back compressed.
#[tokio::test]
async fn compressed_payload_round_trips() -> Result<()> {
    let harness = start_server_with(|_| {}, None, |_| Ok(())).await?;
    let mut stream = TcpStream::connect(harness.addr).await?;

    let plain = b"repetitive payload payload payload payload payload".repeat(8);
    let packed = lz4::compress(&plain).expect("compress");
    assert!(packed.len() < plain.len());

    let mut packet = BinaryPacket::new(OPCODE_ECHO, Bytes::from(packed));
    packet.flags = PacketFlags::COMPRESSED;
    write_frame(&mut stream, &packet.serialize().expect("serialize")).await?;

    let raw = read_frame(&mut stream).await?;
    let AnyPacket::Binary(reply) = harness.catalog.decode(&raw).expect("decode")
    else {
        panic!("expected a binary echo");
    };
    assert!(reply.flags.contains(PacketFlags::COMPRESSED), "reply mirrors");
    assert_eq!(
        lz4::decompress(reply.payload_bytes()).expect("decompress"),
        plain
    );

    harness.server.shutdown().await;
    Ok(())
}
