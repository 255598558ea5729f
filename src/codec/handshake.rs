// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Key agreement for per-connection encryption.
//!
//! X25519 ephemeral Diffie-Hellman followed by HKDF-SHA256 with a fixed
//! info tag derives the 32-byte connection key both sides feed into their
//! [`CipherSuite`]. Each side sends its 32-byte public key once; neither
//! the shared secret nor the derived key ever crosses the wire.

use hkdf::Hkdf;
use rand_core::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::codec::crypto::{CipherAlgorithm, CipherSuite, KEY_LEN};

pub const PUBLIC_KEY_LEN: usize = 32;
const KEY_INFO: &[u8] = b"packet-server-conn-key-v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("peer public key must be {PUBLIC_KEY_LEN} bytes")]
    BadPublicKey,
    #[error("key derivation failed")]
    Derivation,
}

fn derive_key(shared: &[u8; 32]) -> Result<[u8; KEY_LEN], HandshakeError> {
    let mut key = [0u8; KEY_LEN];
    Hkdf::<Sha256>::new(None, shared)
        .expand(KEY_INFO, &mut key)
        .map_err(|_| HandshakeError::Derivation)?;
    Ok(key)
}

fn public_from_bytes(raw: &[u8]) -> Result<PublicKey, HandshakeError> {
    let bytes: [u8; PUBLIC_KEY_LEN] =
        raw.try_into().map_err(|_| HandshakeError::BadPublicKey)?;
    Ok(PublicKey::from(bytes))
}

/// Responder side (the server): consume the initiator's public key, hand
/// back our public key plus the ready suite.
pub fn respond(
    peer_public: &[u8],
    algorithm: CipherAlgorithm,
) -> Result<([u8; PUBLIC_KEY_LEN], CipherSuite), HandshakeError> {
    let peer = public_from_bytes(peer_public)?;
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&peer);
    let key = derive_key(shared.as_bytes())?;
    Ok((*public.as_bytes(), CipherSuite::new(algorithm, key)))
}

/// Initiator half-state: created with [`initiate`], finished once the
/// responder's public key arrives.
pub struct Initiation {
    secret: EphemeralSecret,
}

impl Initiation {
    pub fn finish(
        self,
        peer_public: &[u8],
        algorithm: CipherAlgorithm,
    ) -> Result<CipherSuite, HandshakeError> {
        let peer = public_from_bytes(peer_public)?;
        let shared = self.secret.diffie_hellman(&peer);
        let key = derive_key(shared.as_bytes())?;
        Ok(CipherSuite::new(algorithm, key))
    }
}

/// Initiator side (a client): produce the public key to send and the
/// half-state that finishes the agreement.
pub fn initiate() -> ([u8; PUBLIC_KEY_LEN], Initiation) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (*public.as_bytes(), Initiation { secret })
}
