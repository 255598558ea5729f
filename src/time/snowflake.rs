// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! 64-bit snowflake identifiers.
//!
//! Layout, most significant bits first:
//!
//! ```text
//! | type:4 | machine:12 | timestamp:32 | sequence:16 |
//! ```
//!
//! The timestamp field counts milliseconds since the clock's custom epoch;
//! exhausting the 32-bit field is a fatal error, not a wrap. Generation is
//! non-reentrant per instance: the internal `(last_ts, seq)` pair lives
//! behind a mutex and sequence rollover spins into the next millisecond.

use std::{fmt, sync::Arc, sync::Mutex};

use thiserror::Error;

use crate::time::clock::Clock;

const MACHINE_BITS: u32 = 12;
const TIMESTAMP_BITS: u32 = 32;
const SEQUENCE_BITS: u32 = 16;

const MACHINE_MASK: u64 = (1 << MACHINE_BITS) - 1;
const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// 4-bit id domain tag occupying the top nibble.
#[repr(u8)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    #[default]
    Generic = 0x0,
    Connection = 0x1,
    Packet = 0x2,
    Worker = 0x3,
    Session = 0x4,
}

impl IdKind {
    #[inline]
    pub fn from_u4(v: u8) -> Option<Self> {
        Some(match v {
            0x0 => Self::Generic,
            0x1 => Self::Connection,
            0x2 => Self::Packet,
            0x3 => Self::Worker,
            0x4 => Self::Session,
            _ => return None,
        })
    }
}

#[derive(Debug, Error)]
pub enum SnowflakeError {
    /// More than 2^32 ms elapsed since the configured epoch. Fatal to the
    /// host; there is no wrap-around.
    #[error("snowflake timestamp overflow: {0} ms since epoch")]
    TimestampOverflow(u64),
}

/// Decomposed view of an id, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdParts {
    pub kind: u8,
    pub machine: u16,
    pub timestamp_ms: u32,
    pub sequence: u16,
}

/// A single generated identifier. Hex-prints big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnowflakeId(pub u64);

impl SnowflakeId {
    pub fn decompose(self) -> IdParts {
        IdParts {
            kind: (self.0 >> (MACHINE_BITS + TIMESTAMP_BITS + SEQUENCE_BITS)) as u8,
            machine: ((self.0 >> (TIMESTAMP_BITS + SEQUENCE_BITS)) & MACHINE_MASK)
                as u16,
            timestamp_ms: ((self.0 >> SEQUENCE_BITS) & TIMESTAMP_MASK) as u32,
            sequence: (self.0 & SEQUENCE_MASK) as u16,
        }
    }
}

impl fmt::Display for SnowflakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

#[derive(Debug, Default)]
struct GenState {
    last_ts: u64,
    sequence: u64,
}

/// Per-instance id generator bound to one `Clock` and one machine id.
#[derive(Debug)]
pub struct SnowflakeGenerator {
    clock: Arc<Clock>,
    kind: IdKind,
    machine: u16,
    state: Mutex<GenState>,
}

impl SnowflakeGenerator {
    pub fn new(clock: Arc<Clock>, kind: IdKind, machine: u16) -> Self {
        Self {
            clock,
            kind,
            machine: machine & MACHINE_MASK as u16,
            state: Mutex::new(GenState::default()),
        }
    }

    /// Produce the next id. Spins into the following millisecond when the
    /// 16-bit sequence is exhausted within one ms.
    pub fn next_id(&self) -> Result<SnowflakeId, SnowflakeError> {
        let mut state = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut ts = self.clock.epoch_ms().max(state.last_ts);
        if ts == state.last_ts {
            state.sequence += 1;
            if state.sequence > SEQUENCE_MASK {
                while self.clock.epoch_ms() <= state.last_ts {
                    std::hint::spin_loop();
                }
                ts = self.clock.epoch_ms();
                state.sequence = 0;
            }
        } else {
            state.sequence = 0;
        }

        if ts > TIMESTAMP_MASK {
            return Err(SnowflakeError::TimestampOverflow(ts));
        }

        state.last_ts = ts;
        let id = ((self.kind as u64) << (MACHINE_BITS + TIMESTAMP_BITS + SEQUENCE_BITS))
            | ((self.machine as u64) << (TIMESTAMP_BITS + SEQUENCE_BITS))
            | (ts << SEQUENCE_BITS)
            | state.sequence;
        Ok(SnowflakeId(id))
    }
}
