// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Ready-made ping handler for liveness and RTT probes.
//!
//! The reply echoes the payload and copies the request's wall and
//! monotonic stamps back unchanged, so the initiator measures round-trip
//! time against its own clock without the two clocks ever needing to
//! agree.

use bytes::Bytes;

use crate::{
    dispatch::{
        handler::{HandlerOptions, HandlerRegistryBuilder, RegistryError},
        reply::Reply,
    },
    packet::{
        binary::{BinaryPacket, MAGIC_BINARY},
        catalog::{AnyPacket, PacketBody},
    },
    time::clock::Clock,
};

pub fn register_ping(
    builder: &mut HandlerRegistryBuilder,
    opcode: u16,
) -> Result<(), RegistryError> {
    builder.register(
        MAGIC_BINARY,
        opcode,
        HandlerOptions::default(),
        move |packet, _conn, _cancel| {
            Box::pin(async move {
                let AnyPacket::Binary(request) = &packet else {
                    return Ok(Reply::None);
                };
                let mut pong = BinaryPacket::new(
                    opcode,
                    Bytes::copy_from_slice(packet.payload()),
                );
                pong.timestamp_ms = request.timestamp_ms;
                pong.mono_ticks = request.mono_ticks;
                Ok(Reply::Packet(AnyPacket::Binary(pong)))
            })
        },
    )?;
    Ok(())
}

/// Round-trip time in microseconds for a pong carrying the stamps the
/// initiator put on the ping. `None` when the reply's stamp is from a
/// different clock epoch than ours.
pub fn round_trip_micros(clock: &Clock, pong: &BinaryPacket) -> Option<u64> {
    clock.mono_ticks().checked_sub(pong.mono_ticks)
}
