// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result};
use bytes::Bytes;
use packet_server_rs::{
    cfg::{cli::resolve_config_path, config::Config, logger::init_logger},
    dispatch::{
        handler::{HandlerOptions, HandlerRegistryBuilder},
        reply::Reply,
    },
    packet::{
        binary::{BinaryPacket, MAGIC_BINARY},
        catalog::{AnyPacket, PacketBody},
        text::MAGIC_TEXT_256,
    },
    server::protocol::Server,
};
use tracing::{info, warn};

const OPCODE_ECHO: u16 = 1;

#[tokio::main]
async fn main() -> Result<()> {
    let _logger_guard = init_logger("config/logger.yaml")?;

    // Missing server config falls back to defaults (ephemeral port).
    let cfg = match resolve_config_path("config/server.yaml")
        .and_then(Config::load_from_file)
    {
        Ok(cfg) => cfg,
        Err(err) => {
            warn!("using default config: {err:#}");
            Config::default()
        },
    };

    let mut handlers = HandlerRegistryBuilder::new();
    handlers
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
        .context("echo handler registration failed")?;
    handlers
        .register(
            MAGIC_TEXT_256,
            OPCODE_ECHO,
            HandlerOptions::default(),
            |packet, _conn, _cancel| {
                Box::pin(async move {
                    let text = String::from_utf8_lossy(packet.payload()).into_owned();
                    Ok(Reply::Text(text))
                })
            },
        )
        .context("text echo handler registration failed")?;

    let server = Server::builder(cfg).handlers(handlers.freeze()).build()?;
    let addr = server.activate().await.context("activation failed")?;
    info!(%addr, "echo server listening");

    tokio::signal::ctrl_c()
        .await
        .context("ctrl-c handler failed")?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
