// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Reply shapes and their senders.
//!
//! A handler returns one of a closed set of shapes; the pipeline inspects
//! the tag and invokes the matching sender. Strings pick the smallest
//! registered text class that holds their UTF-8 encoding and split on
//! character boundaries when even the largest class cannot.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::{
    codec::crypto::CipherSuite,
    error::ServerError,
    packet::{
        catalog::{AnyPacket, PacketBody},
        fragment,
        header::MAX_FRAME_LEN,
        text::{TextClass, TextPacket},
    },
    server::connection::Connection,
};

/// The closed set of handler return shapes.
#[derive(Debug, Default)]
pub enum Reply {
    /// Nothing goes back to the client.
    #[default]
    None,
    /// A packet, serialized and sent.
    Packet(AnyPacket),
    /// Raw bytes, sent as-is with no framing added.
    Bytes(Bytes),
    /// Text, wrapped into text packets.
    Text(String),
}

/// How a reply is wrapped before send: mirror of what the request
/// carried, plus the frame ceiling that decides when the wrapped packet
/// splits into a fragment run.
#[derive(Debug, Clone)]
pub(crate) struct WrapSpec {
    pub compress: bool,
    pub suite: Option<CipherSuite>,
    pub max_frame_len: usize,
}

impl Default for WrapSpec {
    fn default() -> Self {
        Self {
            compress: false,
            suite: None,
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

impl WrapSpec {
    fn is_plain(&self) -> bool {
        !self.compress && self.suite.is_none()
    }
}

/// Send `reply` on `conn`. `opcode` labels text replies so the client can
/// correlate them with the request.
pub(crate) async fn send_reply(
    conn: &Arc<Connection>,
    reply: Reply,
    opcode: u16,
    wrap: &WrapSpec,
) -> Result<(), ServerError> {
    match reply {
        Reply::None => Ok(()),
        Reply::Packet(packet) => send_packet(conn, packet, wrap).await,
        Reply::Bytes(raw) => conn.send(raw).await,
        Reply::Text(text) => {
            for chunk in split_text(&text) {
                let class = TextClass::fitting(chunk.len())
                    .unwrap_or(TextClass::Large);
                let packet = TextPacket::new(class, opcode, chunk)
                    .map_err(|e| ServerError::TransformFailed(e.to_string()))?;
                send_packet(conn, AnyPacket::Text(packet), wrap).await?;
            }
            Ok(())
        },
    }
}

async fn send_packet(
    conn: &Arc<Connection>,
    mut packet: AnyPacket,
    wrap: &WrapSpec,
) -> Result<(), ServerError> {
    if !wrap.is_plain() {
        packet
            .wrap_transforms(wrap.compress, wrap.suite.as_ref())
            .map_err(|e| ServerError::TransformFailed(e.to_string()))?;
    }
    // Transforms wrap the whole message; payloads past the frame ceiling
    // then leave as a fragment run.
    let pieces = fragment::split(packet, wrap.max_frame_len)
        .map_err(|e| ServerError::TransformFailed(e.to_string()))?;
    for piece in pieces {
        let frame = piece
            .serialize()
            .map_err(|e| ServerError::TransformFailed(e.to_string()))?;
        conn.send(frame).await?;
    }
    Ok(())
}

/// Control notices bypass wrapping: the client must be able to read them
/// even when its transform state is out of sync.
pub(crate) async fn send_notice(conn: &Arc<Connection>, text: &str) {
    let result = match TextPacket::notice(text) {
        Ok(packet) => match packet.serialize() {
            Ok(frame) => conn.send(frame).await,
            Err(err) => {
                debug!(conn = %conn.id, "notice serialization failed: {err}");
                return;
            },
        },
        Err(err) => {
            debug!(conn = %conn.id, "notice construction failed: {err}");
            return;
        },
    };
    if let Err(err) = result {
        debug!(conn = %conn.id, "notice send failed: {err}");
    }
}

/// Split on character boundaries into chunks the largest class holds.
fn split_text(text: &str) -> Vec<&str> {
    let cap = TextClass::Large.max_payload();
    let mut chunks = Vec::with_capacity(text.len() / cap + 1);
    let mut rest = text;
    while rest.len() > cap {
        let mut cut = cap;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        chunks.push(&rest[..cut]);
        rest = &rest[cut..];
    }
    chunks.push(rest);
    chunks
}
