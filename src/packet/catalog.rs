// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Packet catalog: magic number → deserializer, plus the per-type
//! operation surface.
//!
//! Packet families register once at startup through [`CatalogBuilder`];
//! after `freeze()` the catalog is read-only and safe for any number of
//! concurrent readers. Per-type operations (serialize and the transform
//! hooks) live on the packet types themselves and are reached through
//! [`PacketBody`] on [`AnyPacket`], so dispatch never needs a second
//! lookup once the deserializer has run.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use enum_dispatch::enum_dispatch;
use thiserror::Error;

use crate::{
    codec::{
        crypto::{CipherSuite, CryptoError},
        lz4::{self, Lz4Error},
    },
    packet::{
        binary::{BinaryPacket, MAGIC_BINARY},
        flags::PacketFlags,
        header::{HEADER_LEN, HeaderError, Priority, WireHeader},
        text::{TextClass, TextPacket},
    },
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame is truncated")]
    Truncated,
    #[error(transparent)]
    Header(#[from] HeaderError),
    #[error("unknown magic: 0x{0:08x}")]
    UnknownMagic(u32),
    #[error("payload of {len} bytes exceeds the class cap of {cap}")]
    PayloadTooLarge { len: usize, cap: usize },
    #[error("text payload is not valid UTF-8")]
    BadUtf8,
    #[error("payload is still encrypted or compressed")]
    StillWrapped,
    #[error("frame of {0} bytes exceeds the u16 length prefix")]
    FrameTooLarge(usize),
    #[error("magic 0x{0:08x} is already registered")]
    DuplicateMagic(u32),
}

/// Errors from the unwrap/wrap transform stage.
#[derive(Debug, Error)]
pub enum TransformError {
    /// Decryption failed. [`CryptoError::AuthenticationFailed`] closes the
    /// connection; the rest surface as transform notices.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Compression(#[from] Lz4Error),
    #[error("packet is encrypted but the connection has no cipher suite")]
    MissingCipher,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl TransformError {
    /// True when the failure must tear the connection down instead of
    /// producing a notice.
    pub fn is_authentication_failure(&self) -> bool {
        matches!(
            self,
            TransformError::Crypto(CryptoError::AuthenticationFailed)
        )
    }
}

/// Operation surface shared by every registered packet family.
#[enum_dispatch]
pub trait PacketBody {
    fn magic(&self) -> u32;
    fn opcode(&self) -> u16;
    fn flags(&self) -> PacketFlags;
    fn set_flags(&mut self, flags: PacketFlags);
    fn priority(&self) -> Priority;
    fn payload(&self) -> &[u8];
    fn replace_payload(&mut self, payload: Bytes);
    fn serialize(&self) -> Result<Bytes, CodecError>;
}

impl PacketBody for TextPacket {
    fn magic(&self) -> u32 {
        self.class.magic()
    }

    fn opcode(&self) -> u16 {
        self.opcode
    }

    fn flags(&self) -> PacketFlags {
        self.flags
    }

    fn set_flags(&mut self, flags: PacketFlags) {
        self.flags = flags;
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn payload(&self) -> &[u8] {
        self.payload_bytes()
    }

    fn replace_payload(&mut self, payload: Bytes) {
        self.swap_payload(payload);
    }

    fn serialize(&self) -> Result<Bytes, CodecError> {
        TextPacket::serialize(self)
    }
}

impl PacketBody for BinaryPacket {
    fn magic(&self) -> u32 {
        MAGIC_BINARY
    }

    fn opcode(&self) -> u16 {
        self.opcode
    }

    fn flags(&self) -> PacketFlags {
        self.flags
    }

    fn set_flags(&mut self, flags: PacketFlags) {
        self.flags = flags;
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn payload(&self) -> &[u8] {
        self.payload_bytes()
    }

    fn replace_payload(&mut self, payload: Bytes) {
        self.swap_payload(payload);
    }

    fn serialize(&self) -> Result<Bytes, CodecError> {
        BinaryPacket::serialize(self)
    }
}

/// Every packet family known to the runtime.
#[enum_dispatch(PacketBody)]
#[derive(Debug, Clone, PartialEq)]
pub enum AnyPacket {
    Text(TextPacket),
    Binary(BinaryPacket),
}

impl AnyPacket {
    /// Undo the wire transforms in order: decrypt, then decompress. Flags
    /// are cleared as each layer peels off, and text payloads re-validate
    /// their class cap and UTF-8 once plain.
    pub fn unwrap_transforms(
        &mut self,
        suite: Option<&CipherSuite>,
    ) -> Result<(), TransformError> {
        let mut flags = self.flags();

        if flags.contains(PacketFlags::ENCRYPTED) {
            let suite = suite.ok_or(TransformError::MissingCipher)?;
            let plain = suite.decrypt(self.payload())?;
            self.replace_payload(Bytes::from(plain));
            flags.remove(PacketFlags::ENCRYPTED);
            self.set_flags(flags);
        }

        if flags.contains(PacketFlags::COMPRESSED) {
            let plain = lz4::decompress(self.payload())?;
            self.replace_payload(Bytes::from(plain));
            flags.remove(PacketFlags::COMPRESSED);
            self.set_flags(flags);
        }

        if let AnyPacket::Text(text) = self {
            if text.payload_bytes().len() > text.class.max_payload() {
                return Err(CodecError::PayloadTooLarge {
                    len: text.payload_bytes().len(),
                    cap: text.class.max_payload(),
                }
                .into());
            }
            text.text().map_err(TransformError::Codec)?;
        }
        Ok(())
    }

    /// Apply the wire transforms in inverse order: compress, then encrypt.
    pub fn wrap_transforms(
        &mut self,
        compress: bool,
        suite: Option<&CipherSuite>,
    ) -> Result<(), TransformError> {
        let mut flags = self.flags();

        if compress {
            let packed = lz4::compress(self.payload())?;
            self.replace_payload(Bytes::from(packed));
            flags.insert(PacketFlags::COMPRESSED);
            self.set_flags(flags);
        }

        if let Some(suite) = suite {
            let wire = suite.encrypt(self.payload())?;
            self.replace_payload(Bytes::from(wire));
            flags.insert(PacketFlags::ENCRYPTED);
            self.set_flags(flags);
        }
        Ok(())
    }
}

/// Deserializer registered per magic number.
pub trait PacketDecoder: Send + Sync {
    fn magic(&self) -> u32;
    fn decode(&self, header: &WireHeader, body: &[u8]) -> Result<AnyPacket, CodecError>;
}

struct TextDecoder(TextClass);

impl PacketDecoder for TextDecoder {
    fn magic(&self) -> u32 {
        self.0.magic()
    }

    fn decode(&self, header: &WireHeader, body: &[u8]) -> Result<AnyPacket, CodecError> {
        Ok(AnyPacket::Text(TextPacket::decode(self.0, header, body)?))
    }
}

struct BinaryDecoder;

impl PacketDecoder for BinaryDecoder {
    fn magic(&self) -> u32 {
        MAGIC_BINARY
    }

    fn decode(&self, header: &WireHeader, body: &[u8]) -> Result<AnyPacket, CodecError> {
        Ok(AnyPacket::Binary(BinaryPacket::decode(header, body)?))
    }
}

/// Startup-time registration surface. `freeze()` hands out the read-only
/// catalog used by dispatch workers.
#[derive(Default)]
pub struct CatalogBuilder {
    decoders: HashMap<u32, Arc<dyn PacketDecoder>>,
}

impl CatalogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        decoder: Arc<dyn PacketDecoder>,
    ) -> Result<&mut Self, CodecError> {
        let magic = decoder.magic();
        if self.decoders.contains_key(&magic) {
            return Err(CodecError::DuplicateMagic(magic));
        }
        self.decoders.insert(magic, decoder);
        Ok(self)
    }

    pub fn freeze(self) -> Arc<PacketCatalog> {
        Arc::new(PacketCatalog {
            decoders: self.decoders,
        })
    }
}

/// Read-only magic → deserializer map. Only registered combinations exist
/// at runtime.
pub struct PacketCatalog {
    decoders: HashMap<u32, Arc<dyn PacketDecoder>>,
}

impl PacketCatalog {
    /// The stock catalog: three text classes plus the binary family.
    pub fn with_defaults() -> Arc<Self> {
        let mut builder = CatalogBuilder::new();
        for class in TextClass::ALL {
            builder
                .register(Arc::new(TextDecoder(class)))
                .expect("stock magics are distinct");
        }
        builder
            .register(Arc::new(BinaryDecoder))
            .expect("stock magics are distinct");
        builder.freeze()
    }

    #[inline]
    pub fn contains(&self, magic: u32) -> bool {
        self.decoders.contains_key(&magic)
    }

    /// Decode a full frame: validate the fixed header, then hand the body
    /// to the deserializer selected by the magic number.
    pub fn decode(&self, raw: &[u8]) -> Result<AnyPacket, CodecError> {
        let header = WireHeader::parse_frame(raw)?;
        let magic = header.magic.get();
        let decoder = self
            .decoders
            .get(&magic)
            .ok_or(CodecError::UnknownMagic(magic))?;
        decoder.decode(header, &raw[HEADER_LEN..])
    }
}
