// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The wire flag byte.
//!
//! ```text
//!  7   6   5   4   3   2   1   0
//! +---+---+---+---+---+---+---+---+
//! | . | . | U | R | F | E | C | . |
//! +---+---+---+---+---+---+---+---+
//! ```
//!
//! * **C** – payload is LZ4-compressed.
//! * **E** – payload is encrypted with the connection suite.
//! * **F** – frame is a fragment of a larger message.
//! * **R** / **U** – delivery class; setting both is a protocol violation.

use bitflags::bitflags;
use thiserror::Error;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PacketFlags: u8 {
        const COMPRESSED = 0x02;
        const ENCRYPTED = 0x04;
        const FRAGMENTED = 0x08;
        const RELIABLE = 0x10;
        const UNRELIABLE = 0x20;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlagError {
    #[error("unknown flag bits: 0x{0:02x}")]
    UnknownBits(u8),
    #[error("reliable and unreliable are mutually exclusive")]
    DeliveryConflict,
}

impl PacketFlags {
    /// Parse the wire byte, rejecting unknown bits and the
    /// `RELIABLE|UNRELIABLE` conflict.
    pub fn from_wire(byte: u8) -> Result<Self, FlagError> {
        let flags = Self::from_bits(byte).ok_or(FlagError::UnknownBits(byte))?;
        if flags.contains(Self::RELIABLE | Self::UNRELIABLE) {
            return Err(FlagError::DeliveryConflict);
        }
        Ok(flags)
    }
}
