// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Symmetric cipher suite composed from external primitives.
//!
//! The suite is selected by an algorithm tag and operates on whole packet
//! payloads. Wire layouts:
//!
//! ```text
//! AES-256-GCM        | nonce(12) | ciphertext | tag(16) |
//! ChaCha20-Poly1305  | nonce(12) | ciphertext | tag(16) |
//! AES-256-CTR        | iv(16)    | ciphertext |
//! AES-256-CBC        | iv(16)    | ciphertext |           (PKCS#7)
//! XTEA               | ciphertext |                       (PKCS#7, no tag)
//! ```
//!
//! AEAD tag verification is constant-time inside the AEAD crates. A MAC
//! failure is reported as [`CryptoError::AuthenticationFailed`] without
//! revealing whether the key or the tag was wrong.

use aes::cipher::{
    BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher, block_padding::Pkcs7,
};
use aes_gcm::{
    Aes256Gcm,
    aead::{Aead, KeyInit},
};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::xtea::Xtea;

pub const KEY_LEN: usize = 32;
const AEAD_NONCE_LEN: usize = 12;
const AEAD_TAG_LEN: usize = 16;
const IV_LEN: usize = 16;

type Aes256CtrBE = ctr::Ctr128BE<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Tag mismatch, bad padding or wrong key. Deliberately indistinct.
    #[error("authentication failed")]
    AuthenticationFailed,
    /// Ciphertext too short to carry the declared framing.
    #[error("ciphertext framing is malformed")]
    Malformed,
    /// Key/IV wiring error inside a primitive. Should not happen with the
    /// fixed sizes used here.
    #[error("cipher initialization failed")]
    Init,
}

/// Algorithm tag carried in configuration and (implicitly) per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CipherAlgorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
    Xtea,
    Aes256Ctr,
    Aes256Cbc,
}

/// A ready-to-use symmetric suite: one algorithm, one 32-byte key.
#[derive(Debug, Clone)]
pub struct CipherSuite {
    algorithm: CipherAlgorithm,
    key: [u8; KEY_LEN],
}

impl CipherSuite {
    pub fn new(algorithm: CipherAlgorithm, key: [u8; KEY_LEN]) -> Self {
        Self { algorithm, key }
    }

    #[inline]
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    /// XTEA takes a 128-bit key: the first half of the connection key.
    fn xtea(&self) -> Xtea {
        let mut short = [0u8; 16];
        short.copy_from_slice(&self.key[..16]);
        Xtea::new(short)
    }

    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.algorithm {
            CipherAlgorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(
                    &self.key,
                ));
                let nonce = random_bytes::<AEAD_NONCE_LEN>();
                let ct = cipher
                    .encrypt(aes_gcm::Nonce::from_slice(&nonce), plain)
                    .map_err(|_| CryptoError::Init)?;
                Ok(prepend(&nonce, ct))
            },
            CipherAlgorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(
                    chacha20poly1305::Key::from_slice(&self.key),
                );
                let nonce = random_bytes::<AEAD_NONCE_LEN>();
                let ct = cipher
                    .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plain)
                    .map_err(|_| CryptoError::Init)?;
                Ok(prepend(&nonce, ct))
            },
            CipherAlgorithm::Xtea => Ok(self.xtea().encrypt_padded(plain)),
            CipherAlgorithm::Aes256Ctr => {
                let iv = random_bytes::<IV_LEN>();
                let mut cipher = Aes256CtrBE::new_from_slices(&self.key, &iv)
                    .map_err(|_| CryptoError::Init)?;
                let mut buf = plain.to_vec();
                cipher.apply_keystream(&mut buf);
                Ok(prepend(&iv, buf))
            },
            CipherAlgorithm::Aes256Cbc => {
                let iv = random_bytes::<IV_LEN>();
                let ct = Aes256CbcEnc::new_from_slices(&self.key, &iv)
                    .map_err(|_| CryptoError::Init)?
                    .encrypt_padded_vec_mut::<Pkcs7>(plain);
                Ok(prepend(&iv, ct))
            },
        }
    }

    pub fn decrypt(&self, wire: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.algorithm {
            CipherAlgorithm::Aes256Gcm => {
                let (nonce, ct) = split_aead(wire)?;
                let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(
                    &self.key,
                ));
                cipher
                    .decrypt(aes_gcm::Nonce::from_slice(nonce), ct)
                    .map_err(|_| CryptoError::AuthenticationFailed)
            },
            CipherAlgorithm::ChaCha20Poly1305 => {
                let (nonce, ct) = split_aead(wire)?;
                let cipher = ChaCha20Poly1305::new(
                    chacha20poly1305::Key::from_slice(&self.key),
                );
                cipher
                    .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ct)
                    .map_err(|_| CryptoError::AuthenticationFailed)
            },
            CipherAlgorithm::Xtea => self
                .xtea()
                .decrypt_padded(wire)
                .map_err(|_| CryptoError::AuthenticationFailed),
            CipherAlgorithm::Aes256Ctr => {
                if wire.len() < IV_LEN {
                    return Err(CryptoError::Malformed);
                }
                let (iv, ct) = wire.split_at(IV_LEN);
                let mut cipher = Aes256CtrBE::new_from_slices(&self.key, iv)
                    .map_err(|_| CryptoError::Init)?;
                let mut buf = ct.to_vec();
                cipher.apply_keystream(&mut buf);
                Ok(buf)
            },
            CipherAlgorithm::Aes256Cbc => {
                if wire.len() < IV_LEN {
                    return Err(CryptoError::Malformed);
                }
                let (iv, ct) = wire.split_at(IV_LEN);
                Aes256CbcDec::new_from_slices(&self.key, iv)
                    .map_err(|_| CryptoError::Init)?
                    .decrypt_padded_vec_mut::<Pkcs7>(ct)
                    .map_err(|_| CryptoError::AuthenticationFailed)
            },
        }
    }
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    rand::rng().fill(&mut out[..]);
    out
}

fn prepend(head: &[u8], tail: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(head.len() + tail.len());
    out.extend_from_slice(head);
    out.extend_from_slice(&tail);
    out
}

fn split_aead(wire: &[u8]) -> Result<(&[u8], &[u8]), CryptoError> {
    if wire.len() < AEAD_NONCE_LEN + AEAD_TAG_LEN {
        return Err(CryptoError::Malformed);
    }
    Ok(wire.split_at(AEAD_NONCE_LEN))
}
