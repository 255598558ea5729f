// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Binary packet family.
//!
//! The type-specific header carries a wall timestamp (Unix milliseconds)
//! and a monotonic tick stamp for RTT probes:
//!
//! ```text
//! | fixed header (11) | timestamp_ms:u64-LE | mono_ticks:u64-LE | payload |
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U64,
};

use crate::{
    packet::{
        catalog::CodecError,
        flags::PacketFlags,
        header::{HEADER_LEN, MAX_FRAME_LEN, Priority, Transport, WireHeader},
    },
    time::clock::Clock,
};

pub const MAGIC_BINARY: u32 = 0x4249_4E31;

/// Full header size of a binary frame: fixed part plus the two stamps.
pub const BINARY_HEADER_LEN: usize = HEADER_LEN + size_of::<BinaryExtra>();

/// Type-specific header fields, zero-copy view.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct BinaryExtra {
    pub timestamp_ms: U64<LittleEndian>,
    pub mono_ticks: U64<LittleEndian>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryPacket {
    pub opcode: u16,
    pub flags: PacketFlags,
    pub priority: Priority,
    pub transport: Transport,
    pub timestamp_ms: u64,
    pub mono_ticks: u64,
    payload: Bytes,
}

impl BinaryPacket {
    pub fn new(opcode: u16, payload: Bytes) -> Self {
        Self {
            opcode,
            flags: PacketFlags::empty(),
            priority: Priority::None,
            transport: Transport::Tcp,
            timestamp_ms: 0,
            mono_ticks: 0,
            payload,
        }
    }

    /// Stamp wall and monotonic time from `clock` before sending.
    pub fn stamped(mut self, clock: &Clock) -> Self {
        self.timestamp_ms = clock.unix_ms();
        self.mono_ticks = clock.mono_ticks();
        self
    }

    pub(crate) fn decode(header: &WireHeader, body: &[u8]) -> Result<Self, CodecError> {
        let (extra, payload) =
            BinaryExtra::ref_from_prefix(body).map_err(|_| CodecError::Truncated)?;
        Ok(Self {
            opcode: header.opcode.get(),
            flags: header.packet_flags()?,
            priority: header.priority_value()?,
            transport: header.transport_value()?,
            timestamp_ms: extra.timestamp_ms.get(),
            mono_ticks: extra.mono_ticks.get(),
            payload: Bytes::copy_from_slice(payload),
        })
    }

    #[inline]
    pub fn payload_bytes(&self) -> &Bytes {
        &self.payload
    }

    pub(crate) fn swap_payload(&mut self, payload: Bytes) {
        self.payload = payload;
    }

    pub fn serialize(&self) -> Result<Bytes, CodecError> {
        let total = BINARY_HEADER_LEN + self.payload.len();
        if total > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(total));
        }
        let header = WireHeader::new(
            total as u16,
            MAGIC_BINARY,
            self.opcode,
            self.flags,
            self.priority,
            self.transport,
        );
        let extra = BinaryExtra {
            timestamp_ms: U64::new(self.timestamp_ms),
            mono_ticks: U64::new(self.mono_ticks),
        };
        let mut out = BytesMut::with_capacity(total);
        out.put_slice(header.as_bytes());
        out.put_slice(extra.as_bytes());
        out.put_slice(&self.payload);
        Ok(out.freeze())
    }
}
