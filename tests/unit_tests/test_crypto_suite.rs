// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use packet_server_rs::codec::crypto::{CipherAlgorithm, CipherSuite, CryptoError, KEY_LEN};

fn key(seed: u8) -> [u8; KEY_LEN] {
    let mut k = [0u8; KEY_LEN];
    for (i, b) in k.iter_mut().enumerate() {
        *b = seed.wrapping_add(i as u8);
    }
    k
}

#[test]
fn decrypt_encrypt_is_identity_for_every_registered_cipher() {
    let plains: Vec<Vec<u8>> = vec![
        Vec::new(),
        b"ping".to_vec(),
        vec![0u8; 8],
        vec![0xA5u8; 4096],
        (0..=255u8).collect(),
    ];
    for algorithm in [
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::ChaCha20Poly1305,
        CipherAlgorithm::Xtea,
        CipherAlgorithm::Aes256Ctr,
        CipherAlgorithm::Aes256Cbc,
    ] {
        let suite = CipherSuite::new(algorithm, key(3));
        for plain in &plains {
            let wire = suite.encrypt(plain).expect("encrypt");
            assert_eq!(
                suite.decrypt(&wire).expect("decrypt"),
                *plain,
                "{algorithm:?} len {}",
                plain.len()
            );
        }
    }
}

#[test]
fn nonces_differ_between_encryptions() {
    let suite = CipherSuite::new(CipherAlgorithm::Aes256Gcm, key(9));
    let a = suite.encrypt(b"same input").expect("encrypt");
    let b = suite.encrypt(b"same input").expect("encrypt");
    assert_ne!(a, b, "fresh nonce per message");
}

#[test]
fn aead_wire_overhead_is_nonce_plus_tag() {
    for algorithm in [CipherAlgorithm::Aes256Gcm, CipherAlgorithm::ChaCha20Poly1305] {
        let suite = CipherSuite::new(algorithm, key(1));
        let wire = suite.encrypt(b"12345").expect("encrypt");
        assert_eq!(wire.len(), 12 + 5 + 16, "{algorithm:?}");
    }
}

#[test]
fn ctr_and_cbc_carry_a_leading_iv() {
    let ctr = CipherSuite::new(CipherAlgorithm::Aes256Ctr, key(2));
    assert_eq!(ctr.encrypt(b"abcd").expect("encrypt").len(), 16 + 4);

    let cbc = CipherSuite::new(CipherAlgorithm::Aes256Cbc, key(2));
    // PKCS#7 pads 4 bytes up to one block.
    assert_eq!(cbc.encrypt(b"abcd").expect("encrypt").len(), 16 + 16);
}

#[test]
fn flipping_any_aead_byte_fails_authentication() {
    let suite = CipherSuite::new(CipherAlgorithm::ChaCha20Poly1305, key(7));
    let wire = suite.encrypt(b"integrity matters").expect("encrypt");
    for index in [0, 12, wire.len() - 1] {
        let mut tampered = wire.clone();
        tampered[index] ^= 0x80;
        assert!(
            matches!(
                suite.decrypt(&tampered),
                Err(CryptoError::AuthenticationFailed)
            ),
            "byte {index}"
        );
    }
}

#[test]
fn garbage_ciphertext_never_panics() {
    for algorithm in [
        CipherAlgorithm::Aes256Gcm,
        CipherAlgorithm::ChaCha20Poly1305,
        CipherAlgorithm::Xtea,
        CipherAlgorithm::Aes256Cbc,
    ] {
        let suite = CipherSuite::new(algorithm, key(5));
        for len in [0usize, 1, 7, 12, 27, 33] {
            let garbage = vec![0x5Au8; len];
            assert!(suite.decrypt(&garbage).is_err(), "{algorithm:?} len {len}");
        }
    }
}
