// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Handler registry: `(magic, opcode) → thunk`, declared explicitly at
//! startup and frozen before activation.
//!
//! A thunk receives the unwrapped packet, the connection and a
//! cancellation token scoped to this invocation, and returns a
//! [`Reply`](crate::dispatch::reply::Reply). Options declare the
//! middleware attributes (minimum level, timeout) and the per-connection
//! execution discipline.

use std::{collections::HashMap, pin::Pin, sync::Arc, time::Duration};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    dispatch::reply::Reply, packet::catalog::AnyPacket, server::connection::Connection,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler for magic 0x{magic:08x} opcode {opcode} is already registered")]
    Duplicate { magic: u32, opcode: u16 },
}

/// What happens when the same `(connection, opcode)` pair is submitted
/// again while the previous invocation is still running. Only consulted
/// for handlers that declare `parallel_per_connection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyPolicy {
    /// Queue behind the running invocation.
    #[default]
    Queue,
    /// Reject with a busy notice.
    Reject,
}

#[derive(Debug, Clone, Default)]
pub struct HandlerOptions {
    /// Minimum connection authorization level.
    pub min_level: u8,
    /// Pipeline deadline for this opcode. `None` disables the timeout
    /// stage.
    pub timeout: Option<Duration>,
    /// Allow this connection to run other opcodes while this handler is
    /// in flight. The default keeps one packet in the pipeline per
    /// connection.
    pub parallel_per_connection: bool,
    /// Reentrancy discipline for `parallel_per_connection` handlers.
    pub busy: BusyPolicy,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Reply>> + Send>>;

pub type HandlerFn = Arc<
    dyn Fn(AnyPacket, Arc<Connection>, CancellationToken) -> HandlerFuture
        + Send
        + Sync,
>;

pub struct HandlerEntry {
    pub options: HandlerOptions,
    pub(crate) func: HandlerFn,
}

/// Startup-time registration surface.
#[derive(Default)]
pub struct HandlerRegistryBuilder {
    map: HashMap<(u32, u16), Arc<HandlerEntry>>,
}

impl HandlerRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(
        &mut self,
        magic: u32,
        opcode: u16,
        options: HandlerOptions,
        handler: F,
    ) -> Result<&mut Self, RegistryError>
    where
        F: Fn(AnyPacket, Arc<Connection>, CancellationToken) -> HandlerFuture
            + Send
            + Sync
            + 'static,
    {
        if self.map.contains_key(&(magic, opcode)) {
            return Err(RegistryError::Duplicate { magic, opcode });
        }
        self.map.insert(
            (magic, opcode),
            Arc::new(HandlerEntry {
                options,
                func: Arc::new(handler),
            }),
        );
        Ok(self)
    }

    pub fn freeze(self) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry { map: self.map })
    }
}

/// Immutable post-activation lookup table; reads are lock-free.
pub struct HandlerRegistry {
    map: HashMap<(u32, u16), Arc<HandlerEntry>>,
}

impl HandlerRegistry {
    pub fn resolve(&self, magic: u32, opcode: u16) -> Option<Arc<HandlerEntry>> {
        self.map.get(&(magic, opcode)).map(Arc::clone)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
