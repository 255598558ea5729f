// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Message fragmentation over the `FRAGMENTED` flag.
//!
//! A payload too large for one frame is split into a run of frames that
//! all carry the sender's flags; every frame but the last additionally
//! carries `FRAGMENTED`. The receiver accumulates the run per connection
//! and releases one merged packet when the unflagged final frame lands.
//! Transforms wrap the whole message before splitting, so reassembly
//! happens before the unwrap stage and restores the original wrapped
//! payload byte for byte.
//!
//! A frame that does not continue the pending run (different magic or
//! opcode) and a run past the fragment cap are protocol violations.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::packet::{
    binary::BINARY_HEADER_LEN,
    catalog::{AnyPacket, CodecError, PacketBody},
    flags::PacketFlags,
    header::HEADER_LEN,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("fragment does not continue the pending message")]
    Mismatch,
    #[error("message exceeds the fragment cap of {0}")]
    TooManyFragments(u32),
}

#[derive(Debug)]
struct Partial {
    magic: u32,
    opcode: u16,
    payload: BytesMut,
    fragments: u32,
}

/// Per-connection reassembly state. Dropped with the connection, which
/// discards any half-received run.
#[derive(Debug, Default)]
pub struct ReassemblyState {
    partial: Option<Partial>,
}

impl ReassemblyState {
    pub fn pending_fragments(&self) -> u32 {
        self.partial.as_ref().map_or(0, |p| p.fragments)
    }
}

fn family_header_len(packet: &AnyPacket) -> usize {
    match packet {
        AnyPacket::Text(_) => HEADER_LEN,
        AnyPacket::Binary(_) => BINARY_HEADER_LEN,
    }
}

/// Split `packet` into frames that each fit `max_frame_len`. A payload
/// that already fits comes back as a single unflagged frame.
pub fn split(packet: AnyPacket, max_frame_len: usize) -> Result<Vec<AnyPacket>, CodecError> {
    let header = family_header_len(&packet);
    let Some(cap) = max_frame_len.checked_sub(header).filter(|cap| *cap > 0) else {
        return Err(CodecError::FrameTooLarge(header));
    };
    if packet.payload().len() <= cap {
        return Ok(vec![packet]);
    }

    let payload = Bytes::copy_from_slice(packet.payload());
    let mut out = Vec::with_capacity(payload.len() / cap + 1);
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + cap).min(payload.len());
        let mut piece = packet.clone();
        piece.replace_payload(payload.slice(offset..end));
        let mut flags = piece.flags();
        if end < payload.len() {
            flags.insert(PacketFlags::FRAGMENTED);
        } else {
            flags.remove(PacketFlags::FRAGMENTED);
        }
        piece.set_flags(flags);
        out.push(piece);
        offset = end;
    }
    Ok(out)
}

/// Feed one inbound frame through the reassembler. Returns the complete
/// message once the final frame of a run (or a standalone frame) lands,
/// `None` while a run is still accumulating.
pub fn absorb(
    state: &mut ReassemblyState,
    mut packet: AnyPacket,
    max_fragments: u32,
) -> Result<Option<AnyPacket>, FragmentError> {
    let fragmented = packet.flags().contains(PacketFlags::FRAGMENTED);

    let Some(partial) = state.partial.as_mut() else {
        if !fragmented {
            return Ok(Some(packet));
        }
        let mut payload = BytesMut::with_capacity(packet.payload().len() * 2);
        payload.extend_from_slice(packet.payload());
        state.partial = Some(Partial {
            magic: packet.magic(),
            opcode: packet.opcode(),
            payload,
            fragments: 1,
        });
        return Ok(None);
    };

    if partial.magic != packet.magic() || partial.opcode != packet.opcode() {
        state.partial = None;
        return Err(FragmentError::Mismatch);
    }
    if partial.fragments >= max_fragments {
        state.partial = None;
        return Err(FragmentError::TooManyFragments(max_fragments));
    }
    partial.fragments += 1;
    partial.payload.extend_from_slice(packet.payload());
    if fragmented {
        return Ok(None);
    }

    let Some(done) = state.partial.take() else {
        return Err(FragmentError::Mismatch);
    };
    packet.replace_payload(done.payload.freeze());
    Ok(Some(packet))
}
