// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ready-made key-exchange handler.
//!
//! Hosts that want per-connection encryption register this on an opcode
//! of their choice: the client sends its X25519 public key as a binary
//! packet payload, the handler derives the connection suite, installs it
//! on the connection and replies with the server's public key, in the
//! clear. Every later packet may then carry the `ENCRYPTED` flag.

use bytes::Bytes;

use crate::{
    codec::{crypto::CipherAlgorithm, handshake},
    dispatch::{
        handler::{HandlerOptions, HandlerRegistryBuilder, RegistryError},
        reply::Reply,
    },
    packet::{
        binary::{BinaryPacket, MAGIC_BINARY},
        catalog::{AnyPacket, PacketBody},
    },
};

pub fn register_key_exchange(
    builder: &mut HandlerRegistryBuilder,
    opcode: u16,
    algorithm: CipherAlgorithm,
) -> Result<(), RegistryError> {
    builder.register(
        MAGIC_BINARY,
        opcode,
        HandlerOptions::default(),
        move |packet, conn, _cancel| {
            Box::pin(async move {
                let (server_public, suite) =
                    handshake::respond(packet.payload(), algorithm)?;
                conn.set_cipher(Some(suite));
                Ok(Reply::Packet(AnyPacket::Binary(BinaryPacket::new(
                    opcode,
                    Bytes::copy_from_slice(&server_public),
                ))))
            })
        },
    )?;
    Ok(())
}
