// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::IpAddr, time::Duration};

use thiserror::Error;

/// Error taxonomy shared by the listener, connections and the dispatch
/// pipeline.
///
/// The taxonomy deliberately mirrors how each error is *acted upon*:
/// notice-and-continue variants are recovered by the pipeline and surfaced
/// to the client as text notices, connection-level variants close the
/// offending connection, and `Fatal` is surfaced to the host.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Malformed length, unknown magic, impossible flag combination or a
    /// header field out of range. Closes the connection.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// AEAD tag mismatch or wrong key. Never reveals which of the two it
    /// was.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Compression / decompression or codec internal error. The message is
    /// dropped, the connection survives.
    #[error("packet transform failed: {0}")]
    TransformFailed(String),

    /// The sliding-window limiter rejected the endpoint.
    #[error("rate limited")]
    RateLimited,

    /// Authorization level of the connection is below the handler minimum.
    #[error("permission denied")]
    PermissionDenied,

    /// Middleware or handler exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The per-connection send queue is full past `send_timeout`.
    #[error("backpressure: send queue full")]
    Backpressure,

    /// The dispatch channel is at capacity and the push policy is to drop.
    #[error("dispatch queue full")]
    QueueFull,

    /// The per-address connection cap rejected the socket.
    #[error("too many connections from {0}")]
    TooManyConnections(IpAddr),

    /// Unrecoverable manager failure (bind error, pool corruption). Stops
    /// accepting.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Why a connection left the `Open` state. Attached to the
/// `Disconnected` event and logged on teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally without an error.
    LocalClose,
    /// The peer shut the socket down (EOF on read).
    RemoteClose,
    /// Framing or header validation failed.
    ProtocolViolation,
    /// No readable bytes within the configured idle timeout.
    IdleTimeout,
    /// Decryption failed on this connection.
    AuthenticationFailed,
    /// The connection limiter rejected the remote address.
    TooManyConnections,
    /// The send queue stayed full past the send timeout.
    Backpressure,
    /// The server is shutting down.
    Shutdown,
    /// An I/O error on read or write.
    IoError,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CloseReason::LocalClose => "local close",
            CloseReason::RemoteClose => "remote close",
            CloseReason::ProtocolViolation => "protocol violation",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::AuthenticationFailed => "authentication failed",
            CloseReason::TooManyConnections => "too many connections",
            CloseReason::Backpressure => "backpressure",
            CloseReason::Shutdown => "server shutdown",
            CloseReason::IoError => "io error",
        };
        f.write_str(s)
    }
}
