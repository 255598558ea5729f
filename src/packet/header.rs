// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Fixed wire header shared by every packet family.
//!
//! ```text
//! | length:u16 | magic:u32 | opcode:u16 | flags:u8 | priority:u8 | transport:u8 |
//! ```
//!
//! All integers are little-endian. `length` counts the whole frame
//! including its own two bytes; type-specific fields and the payload
//! follow the fixed header.

use thiserror::Error;
use zerocopy::{
    FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, LittleEndian, U16, U32,
};

use crate::packet::flags::{FlagError, PacketFlags};

/// Size of the fixed header in bytes.
pub const HEADER_LEN: usize = 11;

/// Hard ceiling on a frame: the length prefix is a u16.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("frame too short for the fixed header")]
    Truncated,
    #[error("declared length {declared} does not match frame size {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("declared length {0} is below the header size")]
    LengthTooSmall(usize),
    #[error(transparent)]
    Flags(#[from] FlagError),
    #[error("priority out of range: {0}")]
    BadPriority(u8),
    #[error("transport out of range: {0}")]
    BadTransport(u8),
}

/// Dispatch priority carried in the header. Values above `Urgent` are a
/// protocol violation.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    #[default]
    None = 0,
    Low = 1,
    Medium = 2,
    High = 3,
    Urgent = 4,
}

impl TryFrom<u8> for Priority {
    type Error = HeaderError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::None,
            1 => Self::Low,
            2 => Self::Medium,
            3 => Self::High,
            4 => Self::Urgent,
            other => return Err(HeaderError::BadPriority(other)),
        })
    }
}

/// Transport tag carried in the header.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    #[default]
    Null = 0,
    Tcp = 1,
    Udp = 2,
}

impl TryFrom<u8> for Transport {
    type Error = HeaderError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => Self::Null,
            1 => Self::Tcp,
            2 => Self::Udp,
            other => return Err(HeaderError::BadTransport(other)),
        })
    }
}

/// Zero-copy view of the fixed header.
#[repr(C)]
#[derive(Debug, Default, Clone, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct WireHeader {
    pub length: U16<LittleEndian>,
    pub magic: U32<LittleEndian>,
    pub opcode: U16<LittleEndian>,
    pub flags: u8,
    pub priority: u8,
    pub transport: u8,
}

impl WireHeader {
    pub fn new(
        length: u16,
        magic: u32,
        opcode: u16,
        flags: PacketFlags,
        priority: Priority,
        transport: Transport,
    ) -> Self {
        Self {
            length: U16::new(length),
            magic: U32::new(magic),
            opcode: U16::new(opcode),
            flags: flags.bits(),
            priority: priority as u8,
            transport: transport as u8,
        }
    }

    /// Validate a full frame and return its header view. Checks the
    /// declared length against the actual frame size, the header floor,
    /// the flag byte and the enum ranges.
    pub fn parse_frame(raw: &[u8]) -> Result<&Self, HeaderError> {
        let (header, _) =
            Self::ref_from_prefix(raw).map_err(|_| HeaderError::Truncated)?;

        let declared = header.length.get() as usize;
        if declared < HEADER_LEN {
            return Err(HeaderError::LengthTooSmall(declared));
        }
        if declared != raw.len() {
            return Err(HeaderError::LengthMismatch {
                declared,
                actual: raw.len(),
            });
        }

        let _ = PacketFlags::from_wire(header.flags)?;
        let _ = Priority::try_from(header.priority)?;
        let _ = Transport::try_from(header.transport)?;
        Ok(header)
    }

    #[inline]
    pub fn packet_flags(&self) -> Result<PacketFlags, HeaderError> {
        Ok(PacketFlags::from_wire(self.flags)?)
    }

    #[inline]
    pub fn priority_value(&self) -> Result<Priority, HeaderError> {
        Priority::try_from(self.priority)
    }

    #[inline]
    pub fn transport_value(&self) -> Result<Transport, HeaderError> {
        Transport::try_from(self.transport)
    }
}
