// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    packet::catalog::AnyPacket, pool::object::Poolable, server::connection::Connection,
};

/// Pooled backing store for [`PacketContext::properties`]. One bag is
/// taken from the context pool per dispatched packet and returned once
/// the verdict is handled, so the map allocation is recycled across
/// packets instead of rebuilt each time.
#[derive(Debug, Default)]
pub struct PropertyBag {
    pub(crate) map: HashMap<String, String>,
}

impl Poolable for PropertyBag {
    fn reset_for_pool(&mut self) {
        self.map.clear();
    }
}

/// Attributes the middleware chain consults, resolved from the handler's
/// registration and the packet itself before the chain runs.
#[derive(Debug, Clone, Default)]
pub struct DispatchAttributes {
    /// Deadline for the rest of the pipeline including the handler.
    pub timeout: Option<Duration>,
    /// Minimum connection authorization level.
    pub min_level: u8,
    /// The request arrived encrypted; the reply is wrapped to match.
    pub request_encrypted: bool,
    /// The request arrived compressed; the reply is wrapped to match.
    pub request_compressed: bool,
}

/// Everything one packet carries through the pipeline.
pub struct PacketContext {
    pub packet: AnyPacket,
    pub connection: Arc<Connection>,
    pub attributes: DispatchAttributes,
    /// Free-form per-packet scratch space for middleware and handlers.
    pub properties: HashMap<String, String>,
}

impl PacketContext {
    pub fn new(
        packet: AnyPacket,
        connection: Arc<Connection>,
        attributes: DispatchAttributes,
    ) -> Self {
        Self {
            packet,
            connection,
            attributes,
            properties: HashMap::new(),
        }
    }
}
