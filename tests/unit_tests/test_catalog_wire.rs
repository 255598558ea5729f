// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::Bytes;
use hex::FromHex;
use hex_literal::hex;
use packet_server_rs::packet::{
    binary::{BinaryPacket, MAGIC_BINARY},
    catalog::{AnyPacket, CodecError, PacketBody, PacketCatalog},
    flags::PacketFlags,
    header::{HEADER_LEN, HeaderError, Priority, Transport},
    text::{TextClass, TextPacket},
};

/// 11-byte header + "hi" as a small text frame, little-endian throughout:
/// length=13, magic=0x54585431, opcode=1, flags=0, priority=0, transport=1.
const TEXT_HI: [u8; 13] = hex!("0d00 31545854 0100 00 00 01 6869");

// Binary frame fixture: length=29, magic=0x42494E31, opcode=4, reliable,
// priority=urgent, tcp, timestamp=0x0000018F00000000, ticks=0x2A, "ok".
const BINARY_OK: &str = "1d00 314e4942 0400 10 04 01 00000000 8f010000 2a000000 00000000 6f6b";

fn fixture(hex_str: &str) -> Vec<u8> {
    let cleaned: String = hex_str.chars().filter(|c| !c.is_whitespace()).collect();
    Vec::from_hex(&cleaned).expect("valid hex fixture")
}

#[test]
fn fixed_binary_frame_decodes() {
    let raw = fixture(BINARY_OK);
    assert_eq!(raw.len(), 29);
    let catalog = PacketCatalog::with_defaults();
    let AnyPacket::Binary(packet) = catalog.decode(&raw).expect("decode") else {
        panic!("expected a binary packet");
    };
    assert_eq!(packet.opcode, 4);
    assert_eq!(packet.flags, PacketFlags::RELIABLE);
    assert_eq!(packet.priority, Priority::Urgent);
    assert_eq!(packet.timestamp_ms, 0x0000_018F_0000_0000);
    assert_eq!(packet.mono_ticks, 0x2A);
    assert_eq!(packet.payload_bytes().as_ref(), b"ok");
}

#[test]
fn fixed_text_frame_decodes() {
    let catalog = PacketCatalog::with_defaults();
    let packet = catalog.decode(&TEXT_HI).expect("decode");
    let AnyPacket::Text(text) = &packet else {
        panic!("expected a text packet");
    };
    assert_eq!(text.class, TextClass::Small);
    assert_eq!(text.opcode, 1);
    assert_eq!(text.transport, Transport::Tcp);
    assert_eq!(text.text().expect("utf8"), "hi");

    // Bit-exact inverse.
    let encoded = packet.serialize().expect("serialize");
    assert_eq!(&encoded[..], &TEXT_HI[..]);
}

#[test]
fn every_registered_type_round_trips() {
    let catalog = PacketCatalog::with_defaults();

    let mut samples: Vec<AnyPacket> = vec![AnyPacket::Binary({
        let mut p = BinaryPacket::new(42, Bytes::from_static(b"\x00\x01\x02payload"));
        p.priority = Priority::Urgent;
        p.flags = PacketFlags::RELIABLE;
        p.timestamp_ms = 1_722_470_400_000;
        p.mono_ticks = 987_654_321;
        p
    })];
    for class in TextClass::ALL {
        let text = "x".repeat(class.max_payload());
        samples.push(AnyPacket::Text(
            TextPacket::new(class, 9, &text).expect("packet"),
        ));
    }

    for sample in samples {
        let raw = sample.serialize().expect("serialize");
        let decoded = catalog.decode(&raw).expect("decode");
        assert_eq!(decoded, sample);
        assert_eq!(decoded.serialize().expect("serialize"), raw);
    }
}

#[test]
fn unknown_magic_is_rejected() {
    let catalog = PacketCatalog::with_defaults();
    let mut raw = TEXT_HI.to_vec();
    raw[2..6].copy_from_slice(&0x0BAD_F00Du32.to_le_bytes());
    assert_eq!(
        catalog.decode(&raw),
        Err(CodecError::UnknownMagic(0x0BAD_F00D))
    );
}

#[test]
fn length_mismatch_is_rejected() {
    let catalog = PacketCatalog::with_defaults();
    let mut raw = TEXT_HI.to_vec();
    raw.push(0x00);
    assert!(matches!(
        catalog.decode(&raw),
        Err(CodecError::Header(HeaderError::LengthMismatch { .. }))
    ));
}

#[test]
fn conflicting_delivery_flags_are_rejected() {
    let catalog = PacketCatalog::with_defaults();
    let mut raw = TEXT_HI.to_vec();
    raw[8] = 0x30; // RELIABLE | UNRELIABLE
    assert!(matches!(
        catalog.decode(&raw),
        Err(CodecError::Header(HeaderError::Flags(_)))
    ));
}

#[test]
fn out_of_range_priority_and_transport_are_rejected() {
    let catalog = PacketCatalog::with_defaults();

    let mut raw = TEXT_HI.to_vec();
    raw[9] = 9;
    assert!(matches!(
        catalog.decode(&raw),
        Err(CodecError::Header(HeaderError::BadPriority(9)))
    ));

    let mut raw = TEXT_HI.to_vec();
    raw[10] = 7;
    assert!(matches!(
        catalog.decode(&raw),
        Err(CodecError::Header(HeaderError::BadTransport(7)))
    ));
}

#[test]
fn header_only_frame_has_empty_payload() {
    let catalog = PacketCatalog::with_defaults();
    let raw = TextPacket::new(TextClass::Small, 0, "")
        .expect("packet")
        .serialize()
        .expect("serialize");
    assert_eq!(raw.len(), HEADER_LEN);
    let decoded = catalog.decode(&raw).expect("decode");
    assert!(decoded.payload().is_empty());
}

#[test]
fn text_class_cap_is_enforced_on_decode() {
    let catalog = PacketCatalog::with_defaults();
    // A medium-class payload carried under the small-class magic.
    let oversized = TextPacket::new(TextClass::Medium, 0, &"y".repeat(300))
        .expect("packet")
        .serialize()
        .expect("serialize");
    let mut raw = oversized.to_vec();
    raw[2..6].copy_from_slice(&TextClass::Small.magic().to_le_bytes());
    assert!(matches!(
        catalog.decode(&raw),
        Err(CodecError::PayloadTooLarge { .. })
    ));
}

#[test]
fn non_utf8_text_payload_is_rejected() {
    let catalog = PacketCatalog::with_defaults();
    let mut raw = TEXT_HI.to_vec();
    raw[11] = 0xFF;
    raw[12] = 0xFE;
    assert_eq!(catalog.decode(&raw), Err(CodecError::BadUtf8));
}
