// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Text packet family.
//!
//! Three size classes are registered, one magic per class; control notices
//! and string replies pick the smallest class whose payload cap holds the
//! UTF-8 encoding. Caps apply to the plaintext: a frame still carrying the
//! `ENCRYPTED` or `COMPRESSED` flag is only length-checked against the
//! frame ceiling until the unwrap stage restores the plaintext.

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::IntoBytes;

use crate::packet::{
    catalog::CodecError,
    flags::PacketFlags,
    header::{HEADER_LEN, MAX_FRAME_LEN, Priority, Transport, WireHeader},
};

pub const MAGIC_TEXT_256: u32 = 0x5458_5431;
pub const MAGIC_TEXT_512: u32 = 0x5458_5432;
pub const MAGIC_TEXT_1024: u32 = 0x5458_5433;

/// Registered text size classes, smallest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextClass {
    Small,
    Medium,
    Large,
}

impl TextClass {
    pub const ALL: [TextClass; 3] = [Self::Small, Self::Medium, Self::Large];

    #[inline]
    pub const fn magic(self) -> u32 {
        match self {
            Self::Small => MAGIC_TEXT_256,
            Self::Medium => MAGIC_TEXT_512,
            Self::Large => MAGIC_TEXT_1024,
        }
    }

    #[inline]
    pub const fn max_payload(self) -> usize {
        match self {
            Self::Small => 256,
            Self::Medium => 512,
            Self::Large => 1024,
        }
    }

    pub fn from_magic(magic: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.magic() == magic)
    }

    /// Smallest class whose cap holds `len` UTF-8 bytes.
    pub fn fitting(len: usize) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.max_payload() >= len)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextPacket {
    pub class: TextClass,
    pub opcode: u16,
    pub flags: PacketFlags,
    pub priority: Priority,
    pub transport: Transport,
    payload: Bytes,
}

impl TextPacket {
    pub fn new(class: TextClass, opcode: u16, text: &str) -> Result<Self, CodecError> {
        if text.len() > class.max_payload() {
            return Err(CodecError::PayloadTooLarge {
                len: text.len(),
                cap: class.max_payload(),
            });
        }
        Ok(Self {
            class,
            opcode,
            flags: PacketFlags::empty(),
            priority: Priority::None,
            transport: Transport::Tcp,
            payload: Bytes::copy_from_slice(text.as_bytes()),
        })
    }

    /// A control notice: opcode 0, smallest fitting class.
    pub fn notice(text: &str) -> Result<Self, CodecError> {
        let class =
            TextClass::fitting(text.len()).ok_or(CodecError::PayloadTooLarge {
                len: text.len(),
                cap: TextClass::Large.max_payload(),
            })?;
        Self::new(class, 0, text)
    }

    pub(crate) fn decode(
        class: TextClass,
        header: &WireHeader,
        body: &[u8],
    ) -> Result<Self, CodecError> {
        let flags = header.packet_flags()?;
        // Wrapped payloads are validated after the unwrap stage; fragment
        // bodies only once the run is reassembled.
        let wrapped = flags.intersects(
            PacketFlags::ENCRYPTED | PacketFlags::COMPRESSED | PacketFlags::FRAGMENTED,
        );
        if !wrapped {
            if body.len() > class.max_payload() {
                return Err(CodecError::PayloadTooLarge {
                    len: body.len(),
                    cap: class.max_payload(),
                });
            }
            std::str::from_utf8(body).map_err(|_| CodecError::BadUtf8)?;
        }
        Ok(Self {
            class,
            opcode: header.opcode.get(),
            flags,
            priority: header.priority_value()?,
            transport: header.transport_value()?,
            payload: Bytes::copy_from_slice(body),
        })
    }

    /// The UTF-8 content. Fails while the payload is still wrapped.
    pub fn text(&self) -> Result<&str, CodecError> {
        if self
            .flags
            .intersects(PacketFlags::ENCRYPTED | PacketFlags::COMPRESSED)
        {
            return Err(CodecError::StillWrapped);
        }
        std::str::from_utf8(&self.payload).map_err(|_| CodecError::BadUtf8)
    }

    #[inline]
    pub fn payload_bytes(&self) -> &Bytes {
        &self.payload
    }

    pub(crate) fn swap_payload(&mut self, payload: Bytes) {
        self.payload = payload;
    }

    pub fn serialize(&self) -> Result<Bytes, CodecError> {
        let total = HEADER_LEN + self.payload.len();
        if total > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(total));
        }
        let header = WireHeader::new(
            total as u16,
            self.class.magic(),
            self.opcode,
            self.flags,
            self.priority,
            self.transport,
        );
        let mut out = BytesMut::with_capacity(total);
        out.put_slice(header.as_bytes());
        out.put_slice(&self.payload);
        Ok(out.freeze())
    }
}
