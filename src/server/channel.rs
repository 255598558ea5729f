// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The dispatch channel: connections push `(connection, lease)` pairs,
//! dispatch workers pull them.
//!
//! Pushes come from many read loops; pulls go through one receiver shared
//! by the workers behind an async mutex (the pull-lock). Global FIFO
//! follows from the underlying mpsc queue. The push policy decides what a
//! full queue means: `DropNotify` drops the frame and reports `QueueFull`
//! on the connection, `Backpressure` parks the pushing read loop until a
//! slot frees up.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    error::ServerError, pool::buffer::BufferLease, server::connection::Connection,
};

/// One inbound frame awaiting dispatch. The lease holds the raw frame
/// bytes (length prefix included) until a worker decodes and releases it.
/// `seq` is the connection's turnstile ticket, issued in pull order under
/// the pull-lock so workers replay each connection's frames in arrival
/// order.
pub struct Envelope {
    pub connection: Arc<Connection>,
    pub lease: BufferLease,
    pub(crate) seq: u64,
}

/// What `push` does when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PushPolicy {
    /// Drop the frame, report `QueueFull` on the connection, keep reading.
    DropNotify,
    /// Await capacity; the connection's read loop pauses meanwhile.
    #[default]
    Backpressure,
}

pub struct DispatchChannel {
    tx: mpsc::Sender<Envelope>,
    rx: Mutex<mpsc::Receiver<Envelope>>,
    policy: PushPolicy,
}

impl DispatchChannel {
    pub fn new(capacity: usize, policy: PushPolicy) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            policy,
        })
    }

    /// Enqueue a frame. On `DropNotify` a full queue releases the lease
    /// and returns [`ServerError::QueueFull`]; a closed channel (shutdown)
    /// is `Fatal` either way so the read loop stops.
    pub async fn push(&self, envelope: Envelope) -> Result<(), ServerError> {
        match self.policy {
            PushPolicy::Backpressure => self
                .tx
                .send(envelope)
                .await
                .map_err(|mpsc::error::SendError(dropped)| {
                    dropped.lease.release();
                    ServerError::Fatal("dispatch channel closed".to_string())
                }),
            PushPolicy::DropNotify => {
                self.tx.try_send(envelope).map_err(|err| match err {
                    mpsc::error::TrySendError::Full(env) => {
                        env.lease.release();
                        ServerError::QueueFull
                    },
                    mpsc::error::TrySendError::Closed(env) => {
                        env.lease.release();
                        ServerError::Fatal("dispatch channel closed".to_string())
                    },
                })
            },
        }
    }

    /// Take the next frame, or `None` once `cancel` fires or the channel
    /// closes. Workers serialize on the internal pull-lock; none of them
    /// may hold a connection lock while waiting here. The turnstile
    /// ticket is claimed before the pull-lock drops, which is what makes
    /// it follow arrival order.
    pub async fn pull(&self, cancel: &CancellationToken) -> Option<Envelope> {
        let mut rx = self.rx.lock().await;
        let envelope = tokio::select! {
            _ = cancel.cancelled() => None,
            envelope = rx.recv() => envelope,
        };
        envelope.map(|mut envelope| {
            envelope.seq = envelope.connection.claim_dispatch_seq();
            envelope
        })
    }

    /// Shutdown path: stop accepting pushes and hand back every queued
    /// lease. Returns how many frames were drained.
    pub async fn drain(&self) -> usize {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut drained = 0;
        while let Ok(envelope) = rx.try_recv() {
            envelope.lease.release();
            drained += 1;
        }
        drained
    }
}
