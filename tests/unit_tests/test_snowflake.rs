// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashSet, sync::Arc};

use packet_server_rs::time::{
    clock::Clock,
    snowflake::{IdKind, SnowflakeGenerator},
};

#[test]
fn concurrent_generation_yields_unique_ids() {
    let generator = Arc::new(SnowflakeGenerator::new(
        Arc::new(Clock::default()),
        IdKind::Packet,
        42,
    ));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let generator = Arc::clone(&generator);
        handles.push(std::thread::spawn(move || {
            (0..20_000)
                .map(|_| generator.next_id().expect("id").0)
                .collect::<Vec<u64>>()
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().expect("thread") {
            assert!(seen.insert(id), "duplicate id {id:#018x}");
        }
    }
    assert_eq!(seen.len(), 80_000);
}

#[test]
fn kind_and_machine_survive_in_every_id() {
    let generator = SnowflakeGenerator::new(
        Arc::new(Clock::default()),
        IdKind::Session,
        0x123,
    );
    for _ in 0..1000 {
        let parts = generator.next_id().expect("id").decompose();
        assert_eq!(parts.kind, IdKind::Session as u8);
        assert_eq!(parts.machine, 0x123);
    }
}
