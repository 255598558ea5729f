// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Framed client for the wire protocol.
//!
//! Covers the full client side of a session: length-prefixed framing,
//! catalog decoding, fragment reassembly, the key exchange against a
//! server-side [`register_key_exchange`] handler, and transform wrapping
//! with the negotiated suite. The integration suite drives servers
//! through it; embedders get a ready-made initiator.
//!
//! [`register_key_exchange`]: crate::dispatch::key_exchange::register_key_exchange

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tracing::debug;

use crate::{
    codec::{
        crypto::{CipherAlgorithm, CipherSuite},
        handshake,
    },
    packet::{
        binary::BinaryPacket,
        catalog::{AnyPacket, PacketBody, PacketCatalog},
        fragment::{self, ReassemblyState},
        header::{HEADER_LEN, MAX_FRAME_LEN},
    },
};

pub struct PacketClient {
    stream: TcpStream,
    catalog: Arc<PacketCatalog>,
    suite: Option<CipherSuite>,
    reassembly: ReassemblyState,
    max_frame_len: usize,
    max_fragments: u32,
}

impl PacketClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect {addr} failed"))?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            catalog: PacketCatalog::with_defaults(),
            suite: None,
            reassembly: ReassemblyState::default(),
            max_frame_len: MAX_FRAME_LEN,
            max_fragments: 64,
        })
    }

    /// Use a custom catalog instead of the stock families.
    pub fn with_catalog(mut self, catalog: Arc<PacketCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Match the server's frame ceiling and fragment cap when they differ
    /// from the defaults.
    pub fn with_frame_limits(mut self, max_frame_len: usize, max_fragments: u32) -> Self {
        self.max_frame_len = max_frame_len.clamp(HEADER_LEN + 1, MAX_FRAME_LEN);
        self.max_fragments = max_fragments.max(1);
        self
    }

    pub fn set_cipher(&mut self, suite: Option<CipherSuite>) {
        self.suite = suite;
    }

    pub fn cipher(&self) -> Option<&CipherSuite> {
        self.suite.as_ref()
    }

    /// Send one packet as-is, splitting payloads past the frame ceiling
    /// into a fragment run.
    pub async fn send(&mut self, packet: AnyPacket) -> Result<()> {
        for piece in fragment::split(packet, self.max_frame_len)? {
            let frame = piece.serialize()?;
            self.stream.write_all(&frame).await.context("write frame")?;
        }
        self.stream.flush().await.context("flush")?;
        Ok(())
    }

    /// Wrap with the negotiated suite (and optionally compress) before
    /// sending. Fails when no handshake has run.
    pub async fn send_wrapped(
        &mut self,
        mut packet: AnyPacket,
        compress: bool,
    ) -> Result<()> {
        if self.suite.is_none() {
            bail!("no cipher negotiated; run the handshake first");
        }
        packet.wrap_transforms(compress, self.suite.as_ref())?;
        self.send(packet).await
    }

    /// Next complete message, fragment runs reassembled, transforms left
    /// in place.
    pub async fn recv(&mut self) -> Result<AnyPacket> {
        loop {
            let frame = self.read_frame().await?;
            let packet = self.catalog.decode(&frame)?;
            if let Some(done) =
                fragment::absorb(&mut self.reassembly, packet, self.max_fragments)?
            {
                return Ok(done);
            }
            debug!("fragment absorbed, awaiting the rest of the run");
        }
    }

    /// Next complete message with encryption and compression peeled off.
    pub async fn recv_plain(&mut self) -> Result<AnyPacket> {
        let mut packet = self.recv().await?;
        packet.unwrap_transforms(self.suite.as_ref())?;
        Ok(packet)
    }

    /// Run the key exchange against the server handler registered on
    /// `opcode` and install the derived suite.
    pub async fn handshake(
        &mut self,
        opcode: u16,
        algorithm: CipherAlgorithm,
    ) -> Result<()> {
        let (public, initiation) = handshake::initiate();
        self.send(AnyPacket::Binary(BinaryPacket::new(
            opcode,
            Bytes::copy_from_slice(&public),
        )))
        .await?;

        let AnyPacket::Binary(reply) = self.recv().await? else {
            bail!("handshake reply is not a binary packet");
        };
        if reply.opcode != opcode {
            bail!("handshake reply opcode mismatch: {}", reply.opcode);
        }
        let suite = initiation.finish(reply.payload_bytes(), algorithm)?;
        self.suite = Some(suite);
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut len_buf = [0u8; 2];
        self.stream
            .read_exact(&mut len_buf)
            .await
            .context("read length")?;
        let total = u16::from_le_bytes(len_buf) as usize;
        if total < HEADER_LEN {
            bail!("frame length {total} below the header size");
        }
        let mut frame = vec![0u8; total];
        frame[..2].copy_from_slice(&len_buf);
        self.stream
            .read_exact(&mut frame[2..])
            .await
            .context("read body")?;
        Ok(frame)
    }

    /// Half-close the write side. The server observes a remote close.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await.context("shutdown")?;
        Ok(())
    }
}
