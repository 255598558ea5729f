// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! LZ4 block codec with a fixed leading header.
//!
//! Layout on the wire:
//!
//! ```text
//! | original_len:i32-LE | compressed_len:i32-LE | block bytes ... |
//! ```
//!
//! `compressed_len` counts only the block bytes; an empty input produces
//! just the 8-byte header. The block itself is the token format: the high
//! token nibble is the literal length, the low nibble the match length
//! minus 4, each extended by 0xFF runs (see [`crate::codec::varint`]);
//! literals, then a 2-byte little-endian match offset into the already
//! decoded output. Matches are found through a 64 Ki-entry hash table over
//! a multiplicative hash of the next four bytes, within a 64 KiB window.
//!
//! The decoder validates both declared lengths against actual consumption
//! and production; any mismatch is an error and the message is dropped
//! upstream.

use thiserror::Error;

use crate::codec::varint::{self, VarIntError};

pub const HEADER_LEN: usize = 8;

const MIN_MATCH: usize = 4;
/// No match may begin within the final 12 bytes of the input.
const MFLIMIT: usize = 12;
/// The final bytes of every block are always literals.
const LAST_LITERALS: usize = 5;
const MAX_DISTANCE: usize = 65_535;
const HASH_LOG: u32 = 16;
const HASH_SIZE: usize = 1 << HASH_LOG;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Lz4Error {
    #[error("lz4: input larger than i32::MAX")]
    InputTooLarge,
    #[error("lz4: truncated block")]
    Truncated,
    #[error("lz4: negative length in header")]
    BadHeader,
    #[error("lz4: declared compressed length does not match block size")]
    CompressedLengthMismatch,
    #[error("lz4: declared original length does not match decoded size")]
    OriginalLengthMismatch,
    #[error("lz4: match offset out of range")]
    BadOffset,
    #[error(transparent)]
    Length(#[from] VarIntError),
}

#[inline]
fn hash(seq: u32) -> usize {
    (seq.wrapping_mul(2_654_435_761) >> (32 - HASH_LOG)) as usize
}

#[inline]
fn read_u32(src: &[u8], pos: usize) -> u32 {
    u32::from_le_bytes([src[pos], src[pos + 1], src[pos + 2], src[pos + 3]])
}

/// Compress `input` into a fresh header-prefixed buffer.
pub fn compress(input: &[u8]) -> Result<Vec<u8>, Lz4Error> {
    if input.len() > i32::MAX as usize {
        return Err(Lz4Error::InputTooLarge);
    }

    let mut out = Vec::with_capacity(HEADER_LEN + input.len() + input.len() / 255 + 16);
    out.extend_from_slice(&(input.len() as i32).to_le_bytes());
    out.extend_from_slice(&0_i32.to_le_bytes());

    if !input.is_empty() {
        compress_block(input, &mut out);
        let block_len = (out.len() - HEADER_LEN) as i32;
        out[4..8].copy_from_slice(&block_len.to_le_bytes());
    }
    Ok(out)
}

fn compress_block(src: &[u8], out: &mut Vec<u8>) {
    let len = src.len();
    if len < MFLIMIT {
        emit_sequence(out, src, None);
        return;
    }

    // Entries store position + 1 so that zero means "empty".
    let mut table = vec![0u32; HASH_SIZE];
    let match_limit = len - LAST_LITERALS;
    let scan_limit = len - MFLIMIT;

    let mut anchor = 0usize;
    let mut ip = 0usize;
    while ip <= scan_limit {
        let seq = read_u32(src, ip);
        let slot = hash(seq);
        let candidate = table[slot] as usize;
        table[slot] = (ip + 1) as u32;

        if candidate > 0 {
            let cpos = candidate - 1;
            if ip - cpos <= MAX_DISTANCE && read_u32(src, cpos) == seq {
                let mut mlen = MIN_MATCH;
                while ip + mlen < match_limit && src[cpos + mlen] == src[ip + mlen] {
                    mlen += 1;
                }
                emit_sequence(
                    out,
                    &src[anchor..ip],
                    Some(((ip - cpos) as u16, mlen)),
                );
                ip += mlen;
                anchor = ip;
                continue;
            }
        }
        ip += 1;
    }

    emit_sequence(out, &src[anchor..], None);
}

fn emit_sequence(out: &mut Vec<u8>, literals: &[u8], m: Option<(u16, usize)>) {
    let lit_len = literals.len();
    let lit_nibble = lit_len.min(15) as u8;
    let match_nibble = m.map_or(0, |(_, mlen)| (mlen - MIN_MATCH).min(15) as u8);

    out.push((lit_nibble << 4) | match_nibble);
    if lit_len >= 15 {
        varint::encode((lit_len - 15) as u32, out);
    }
    out.extend_from_slice(literals);

    if let Some((offset, mlen)) = m {
        out.extend_from_slice(&offset.to_le_bytes());
        if mlen - MIN_MATCH >= 15 {
            varint::encode((mlen - MIN_MATCH - 15) as u32, out);
        }
    }
}

/// Decompress a header-prefixed buffer produced by [`compress`].
pub fn decompress(input: &[u8]) -> Result<Vec<u8>, Lz4Error> {
    if input.len() < HEADER_LEN {
        return Err(Lz4Error::Truncated);
    }
    let original = i32::from_le_bytes([input[0], input[1], input[2], input[3]]);
    let compressed = i32::from_le_bytes([input[4], input[5], input[6], input[7]]);
    if original < 0 || compressed < 0 {
        return Err(Lz4Error::BadHeader);
    }

    let block = &input[HEADER_LEN..];
    if block.len() != compressed as usize {
        return Err(Lz4Error::CompressedLengthMismatch);
    }

    let original = original as usize;
    if original == 0 {
        return if block.is_empty() {
            Ok(Vec::new())
        } else {
            Err(Lz4Error::OriginalLengthMismatch)
        };
    }

    let mut out = Vec::with_capacity(original);
    let mut ip = 0usize;
    loop {
        let Some(&token) = block.get(ip) else {
            return Err(Lz4Error::Truncated);
        };
        ip += 1;

        let mut lit_len = (token >> 4) as usize;
        if lit_len == 15 {
            let (extra, used) = varint::decode(&block[ip..])?;
            lit_len += extra as usize;
            ip += used;
        }
        let lit_end = ip.checked_add(lit_len).ok_or(Lz4Error::Truncated)?;
        if lit_end > block.len() {
            return Err(Lz4Error::Truncated);
        }
        if out.len() + lit_len > original {
            return Err(Lz4Error::OriginalLengthMismatch);
        }
        out.extend_from_slice(&block[ip..lit_end]);
        ip = lit_end;

        // The final sequence of a block carries literals only.
        if ip == block.len() {
            break;
        }

        if ip + 2 > block.len() {
            return Err(Lz4Error::Truncated);
        }
        let offset = u16::from_le_bytes([block[ip], block[ip + 1]]) as usize;
        ip += 2;
        if offset == 0 || offset > out.len() {
            return Err(Lz4Error::BadOffset);
        }

        let mut mlen = (token & 0x0F) as usize + MIN_MATCH;
        if token & 0x0F == 0x0F {
            let (extra, used) = varint::decode(&block[ip..])?;
            mlen += extra as usize;
            ip += used;
        }
        if out.len() + mlen > original {
            return Err(Lz4Error::OriginalLengthMismatch);
        }

        // Byte-wise copy: offsets smaller than the match length overlap the
        // bytes being produced.
        let start = out.len() - offset;
        for i in 0..mlen {
            let b = out[start + i];
            out.push(b);
        }
    }

    if out.len() != original {
        return Err(Lz4Error::OriginalLengthMismatch);
    }
    Ok(out)
}
