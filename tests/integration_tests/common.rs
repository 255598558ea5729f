// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bytes::Bytes;
use packet_server_rs::{
    cfg::config::Config,
    codec::crypto::{CipherAlgorithm, CipherSuite},
    dispatch::{
        handler::{HandlerOptions, HandlerRegistryBuilder},
        reply::Reply,
    },
    packet::{
        binary::{BinaryPacket, MAGIC_BINARY},
        catalog::{AnyPacket, PacketBody, PacketCatalog},
        text::MAGIC_TEXT_256,
    },
    server::{
        connection::Connection,
        protocol::{Protocol, Server},
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::sleep,
};

pub const OPCODE_ECHO: u16 = 1;
pub const OPCODE_SLEEPY: u16 = 2;

pub const TEST_KEY: [u8; 32] = [7u8; 32];

pub struct TestHarness {
    pub server: Arc<Server>,
    pub addr: SocketAddr,
    pub catalog: Arc<PacketCatalog>,
}

/// Base config: loopback, ephemeral port, short timeouts, generous rate
/// limit so individual tests only tighten what they exercise.
pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.socket.host = "127.0.0.1".parse().expect("loopback");
    cfg.socket.port = 0;
    cfg.rate_limit.max_requests = 10_000;
    cfg.connection.idle_timeout = Duration::from_secs(10);
    cfg.tasks.retain_for = Duration::from_millis(500);
    cfg
}

fn echo_handlers(builder: &mut HandlerRegistryBuilder) -> Result<()> {
    builder
        .register(
            MAGIC_BINARY,
            OPCODE_ECHO,
            HandlerOptions::default(),
            |packet, _conn, _cancel| {
                Box::pin(async move {
                    let payload = Bytes::copy_from_slice(packet.payload());
                    Ok(Reply::Packet(AnyPacket::Binary(BinaryPacket::new(
                        OPCODE_ECHO,
                        payload,
                    ))))
                })
            },
        )
        .context("binary echo")?;
    builder
        .register(
            MAGIC_BINARY,
            OPCODE_SLEEPY,
            HandlerOptions {
                timeout: Some(Duration::from_millis(50)),
                ..HandlerOptions::default()
            },
            |packet, _conn, _cancel| {
                Box::pin(async move {
                    sleep(Duration::from_millis(200)).await;
                    let payload = Bytes::copy_from_slice(packet.payload());
                    Ok(Reply::Packet(AnyPacket::Binary(BinaryPacket::new(
                        OPCODE_SLEEPY,
                        payload,
                    ))))
                })
            },
        )
        .context("sleepy handler")?;
    builder
        .register(
            MAGIC_TEXT_256,
            OPCODE_ECHO,
            HandlerOptions::default(),
            |packet, _conn, _cancel| {
                Box::pin(async move {
                    Ok(Reply::Text(
                        String::from_utf8_lossy(packet.payload()).into_owned(),
                    ))
                })
            },
        )
        .context("text echo")?;
    Ok(())
}

pub async fn start_server_with(
    tweak: impl FnOnce(&mut Config),
    protocol: Option<Arc<dyn Protocol>>,
    extra: impl FnOnce(&mut HandlerRegistryBuilder) -> Result<()>,
) -> Result<TestHarness> {
    let mut cfg = test_config();
    tweak(&mut cfg);

    let mut handlers = HandlerRegistryBuilder::new();
    echo_handlers(&mut handlers)?;
    extra(&mut handlers)?;

    let mut builder = Server::builder(cfg).handlers(handlers.freeze());
    if let Some(protocol) = protocol {
        builder = builder.protocol(protocol);
    }
    let server = builder.build()?;
    let addr = server.activate().await?;
    Ok(TestHarness {
        server,
        addr,
        catalog: PacketCatalog::with_defaults(),
    })
}

pub async fn start_echo_server(
    tweak: impl FnOnce(&mut Config),
) -> Result<TestHarness> {
    start_server_with(tweak, None, |_| Ok(())).await
}

/// Protocol that installs the shared test cipher on every connection.
pub struct CipherOnAccept;

#[async_trait::async_trait]
impl Protocol for CipherOnAccept {
    async fn on_accepted(&self, conn: &Arc<Connection>) -> Result<()> {
        conn.set_cipher(Some(CipherSuite::new(
            CipherAlgorithm::Aes256Gcm,
            TEST_KEY,
        )));
        Ok(())
    }
}

pub async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> Result<()> {
    stream.write_all(frame).await.context("write frame")?;
    stream.flush().await.context("flush")?;
    Ok(())
}

pub async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .context("read length")?;
    let total = u16::from_le_bytes(len_buf) as usize;
    let mut frame = vec![0u8; total];
    frame[..2].copy_from_slice(&len_buf);
    stream
        .read_exact(&mut frame[2..])
        .await
        .context("read body")?;
    Ok(frame)
}

pub fn binary_frame(opcode: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let packet = BinaryPacket::new(opcode, Bytes::copy_from_slice(payload));
    Ok(packet.serialize().context("serialize")?.to_vec())
}
