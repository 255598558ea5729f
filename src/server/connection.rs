// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A single accepted TCP connection.
//!
//! The read loop frames the stream into length-prefixed buffers rented
//! from the pool and pushes them to the dispatch channel. Writes go
//! through a bounded queue drained by one writer task, so frames leave
//! the wire in enqueue order and at most one socket write is in flight.
//! `close()` is idempotent: the first reason wins, the writer gets a
//! grace period to flush, and the disconnect event fires exactly once.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    codec::crypto::CipherSuite,
    error::{CloseReason, ServerError},
    packet::{
        catalog::AnyPacket,
        fragment::{self, FragmentError, ReassemblyState},
        header::HEADER_LEN,
    },
    pool::buffer::BufferPool,
    server::{
        channel::{DispatchChannel, Envelope},
        common::{IoFailure, io_with_timeout},
    },
    time::{clock::Clock, snowflake::SnowflakeId},
};

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    #[serde(with = "crate::cfg::config::serde_millis")]
    pub idle_timeout: Duration,
    #[serde(with = "crate::cfg::config::serde_millis")]
    pub send_timeout: Duration,
    pub send_queue_depth: usize,
    pub max_frame_len: usize,
    /// How long the writer may keep flushing after close.
    #[serde(with = "crate::cfg::config::serde_millis")]
    pub drain_grace: Duration,
    /// Concurrent connections allowed per remote address.
    pub max_per_address: u32,
    /// Frames one fragmented message may span.
    pub max_fragments: u32,
    /// Cadence of the stale-connection sweep.
    #[serde(with = "crate::cfg::config::serde_millis")]
    pub sweep_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(5),
            send_queue_depth: 64,
            max_frame_len: crate::packet::header::MAX_FRAME_LEN,
            drain_grace: Duration::from_secs(2),
            max_per_address: 16,
            max_fragments: 64,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Connection lifecycle. Transitions only move forward.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Wire traffic counters for one connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrafficStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
}

/// Lifecycle callbacks delivered by the connection. Implementations must
/// not block; anything slow belongs on a spawned task.
pub trait ConnectionEvents: Send + Sync {
    fn on_disconnected(&self, conn: &Arc<Connection>, reason: CloseReason);
    fn on_error(&self, conn: &Arc<Connection>, error: &ServerError);
}

pub struct Connection {
    pub id: SnowflakeId,
    pub remote: SocketAddr,
    cfg: ConnectionConfig,
    clock: Arc<Clock>,
    events: Arc<dyn ConnectionEvents>,

    state: AtomicU8,
    level: AtomicU8,
    cipher: Mutex<Option<CipherSuite>>,
    last_activity_ms: AtomicU64,
    close_reason: Mutex<Option<CloseReason>>,

    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    packets_out: AtomicU64,

    reader: Mutex<Option<OwnedReadHalf>>,
    write_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    reassembly: Mutex<ReassemblyState>,
    cancel: CancellationToken,

    // Dispatch turnstile: tickets are claimed in pull order and workers
    // enter the pipeline strictly by ticket, so frames of one connection
    // replay in arrival order even across many workers.
    dispatch_seq: AtomicU64,
    dispatch_turn: AtomicU64,
    turn_notify: tokio::sync::Notify,

    // Dispatch ordering state: one packet in the pipeline per connection
    // unless a handler opts into parallel execution, which downgrades the
    // guard to per-opcode.
    pub(crate) processing: Arc<tokio::sync::Mutex<()>>,
    pub(crate) opcode_guards: DashMap<u16, Arc<tokio::sync::Mutex<()>>>,
}

impl Connection {
    /// Wrap an accepted stream. Spawns the writer task immediately; the
    /// read loop waits for `begin_receive`.
    pub fn spawn(
        stream: TcpStream,
        id: SnowflakeId,
        cfg: ConnectionConfig,
        clock: Arc<Clock>,
        events: Arc<dyn ConnectionEvents>,
        parent_cancel: &CancellationToken,
    ) -> std::io::Result<Arc<Self>> {
        let remote = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel(cfg.send_queue_depth.max(1));

        let now = clock.unix_ms();
        let conn = Arc::new(Self {
            id,
            remote,
            cfg,
            clock,
            events,
            state: AtomicU8::new(ConnState::Connecting as u8),
            level: AtomicU8::new(0),
            cipher: Mutex::new(None),
            last_activity_ms: AtomicU64::new(now),
            close_reason: Mutex::new(None),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            reader: Mutex::new(Some(reader)),
            write_tx: Mutex::new(Some(write_tx)),
            reassembly: Mutex::new(ReassemblyState::default()),
            cancel: parent_cancel.child_token(),
            dispatch_seq: AtomicU64::new(0),
            dispatch_turn: AtomicU64::new(0),
            turn_notify: tokio::sync::Notify::new(),
            processing: Arc::new(tokio::sync::Mutex::new(())),
            opcode_guards: DashMap::new(),
        });

        tokio::spawn(Arc::clone(&conn).write_loop(writer, write_rx));
        Ok(conn)
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self.state(), ConnState::Connecting | ConnState::Open)
    }

    /// Authorization level checked by the permission middleware.
    #[inline]
    pub fn level(&self) -> u8 {
        self.level.load(Ordering::Relaxed)
    }

    pub fn set_level(&self, level: u8) {
        self.level.store(level, Ordering::Relaxed);
    }

    /// The cipher suite negotiated for this connection, if any.
    pub fn cipher(&self) -> Option<CipherSuite> {
        match self.cipher.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_cipher(&self, suite: Option<CipherSuite>) {
        match self.cipher.lock() {
            Ok(mut guard) => *guard = suite,
            Err(poisoned) => *poisoned.into_inner() = suite,
        }
    }

    #[inline]
    pub fn last_activity_ms(&self) -> u64 {
        self.last_activity_ms.load(Ordering::Relaxed)
    }

    /// Rate-limit fingerprint: the remote endpoint as a string.
    pub fn remote_endpoint(&self) -> String {
        self.remote.to_string()
    }

    #[inline]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self.close_reason.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Issue the next turnstile ticket. Called under the dispatch
    /// channel's pull-lock, which is what ties tickets to arrival order.
    pub(crate) fn claim_dispatch_seq(&self) -> u64 {
        self.dispatch_seq.fetch_add(1, Ordering::AcqRel)
    }

    /// Park until `seq` is the ticket allowed into the pipeline.
    pub(crate) async fn await_turn(&self, seq: u64) {
        loop {
            if self.dispatch_turn.load(Ordering::Acquire) == seq {
                return;
            }
            let notified = self.turn_notify.notified();
            if self.dispatch_turn.load(Ordering::Acquire) == seq {
                return;
            }
            notified.await;
        }
    }

    /// Let the next ticket through. Every claimed ticket completes its
    /// turn exactly once.
    pub(crate) fn complete_turn(&self) {
        self.dispatch_turn.fetch_add(1, Ordering::AcqRel);
        self.turn_notify.notify_waiters();
    }

    /// Feed a decoded frame through this connection's reassembler. Whole
    /// messages come straight back; fragment runs accumulate until their
    /// final frame.
    pub(crate) fn absorb_fragment(
        &self,
        packet: AnyPacket,
    ) -> Result<Option<AnyPacket>, FragmentError> {
        let mut state = match self.reassembly.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        fragment::absorb(&mut state, packet, self.cfg.max_fragments)
    }

    /// Wire traffic counters since accept.
    pub fn traffic(&self) -> TrafficStats {
        TrafficStats {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
        }
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.clock.unix_ms(), Ordering::Relaxed);
    }

    /// Start the read loop. At most once per connection.
    pub fn begin_receive(
        self: &Arc<Self>,
        channel: Arc<DispatchChannel>,
        pool: Arc<BufferPool>,
    ) -> Result<(), ServerError> {
        let reader = {
            let mut guard = match self.reader.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        let Some(reader) = reader else {
            return Err(ServerError::Fatal(format!(
                "begin_receive called twice on connection {}",
                self.id
            )));
        };

        let _ = self.state.compare_exchange(
            ConnState::Connecting as u8,
            ConnState::Open as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        tokio::spawn(Arc::clone(self).read_loop(reader, channel, pool));
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: OwnedReadHalf,
        channel: Arc<DispatchChannel>,
        pool: Arc<BufferPool>,
    ) {
        loop {
            if self.cancel.is_cancelled() {
                self.close(CloseReason::Shutdown);
                return;
            }

            let mut len_buf = [0u8; 2];
            match io_with_timeout(
                reader.read_exact(&mut len_buf),
                self.cfg.idle_timeout,
                &self.cancel,
            )
            .await
            {
                Ok(_) => {},
                Err(failure) => {
                    self.close(close_reason_for(failure));
                    return;
                },
            }

            let frame_len = u16::from_le_bytes(len_buf) as usize;
            if frame_len < HEADER_LEN || frame_len > self.cfg.max_frame_len {
                debug!(conn = %self.id, frame_len, "malformed frame length");
                self.close(CloseReason::ProtocolViolation);
                return;
            }

            let mut lease = pool.rent(frame_len);
            lease.as_mut()[..2].copy_from_slice(&len_buf);
            match io_with_timeout(
                reader.read_exact(&mut lease.as_mut()[2..]),
                self.cfg.idle_timeout,
                &self.cancel,
            )
            .await
            {
                Ok(_) => {},
                Err(failure) => {
                    lease.release();
                    self.close(close_reason_for(failure));
                    return;
                },
            }

            self.touch();
            self.bytes_in.fetch_add(frame_len as u64, Ordering::Relaxed);
            self.packets_in.fetch_add(1, Ordering::Relaxed);

            let envelope = Envelope {
                connection: Arc::clone(&self),
                lease,
                seq: 0, // ticket is claimed at pull time
            };
            match channel.push(envelope).await {
                Ok(()) => {},
                Err(err @ ServerError::QueueFull) => {
                    // Frame dropped; the connection stays up.
                    self.events.on_error(&self, &err);
                },
                Err(err) => {
                    self.events.on_error(&self, &err);
                    self.close(CloseReason::Shutdown);
                    return;
                },
            }
        }
    }

    /// Enqueue one serialized frame. FIFO per connection; blocks up to
    /// `send_timeout` when the queue is full, then fails with
    /// `Backpressure`.
    pub async fn send(&self, frame: Bytes) -> Result<(), ServerError> {
        let tx = {
            let guard = match self.write_tx.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.clone()
        };
        let Some(tx) = tx else {
            return Err(ServerError::Backpressure);
        };

        match timeout(self.cfg.send_timeout, tx.send(frame)).await {
            Err(_) => Err(ServerError::Backpressure),
            Ok(Err(_)) => Err(ServerError::Backpressure),
            Ok(Ok(())) => Ok(()),
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut rx: mpsc::Receiver<Bytes>,
    ) {
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(frame) => {
                        if let Err(failure) = io_with_timeout(
                            writer.write_all(&frame),
                            self.cfg.send_timeout,
                            &self.cancel,
                        )
                        .await
                        {
                            debug!(conn = %self.id, "write failed: {failure:?}");
                            self.close(close_reason_for(failure));
                            break;
                        }
                        self.bytes_out
                            .fetch_add(frame.len() as u64, Ordering::Relaxed);
                        self.packets_out.fetch_add(1, Ordering::Relaxed);
                    },
                    None => break,
                },
                _ = self.cancel.cancelled() => {
                    // Flush what is already queued, within the grace
                    // period, then stop.
                    let deadline = tokio::time::Instant::now() + self.cfg.drain_grace;
                    while let Ok(frame) = rx.try_recv() {
                        let remaining =
                            deadline.saturating_duration_since(tokio::time::Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        if timeout(remaining, writer.write_all(&frame)).await.is_err() {
                            break;
                        }
                    }
                    break;
                },
            }
        }

        let _ = writer.shutdown().await;
        self.state.store(ConnState::Closed as u8, Ordering::Release);
        debug!(conn = %self.id, "connection closed");
    }

    /// Move to `Closing` and tear the connection down. Idempotent: only
    /// the first call records a reason and fires the disconnect event.
    pub fn close(self: &Arc<Self>, reason: CloseReason) {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if current >= ConnState::Closing as u8 {
                return;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    ConnState::Closing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                break;
            }
        }

        match self.close_reason.lock() {
            Ok(mut guard) => *guard = Some(reason),
            Err(poisoned) => *poisoned.into_inner() = Some(reason),
        }

        // Dropping the sender lets the writer drain the queue and exit;
        // the token stops the read loop and any in-flight handlers.
        {
            let mut guard = match self.write_tx.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take();
        }
        self.cancel.cancel();

        if !matches!(reason, CloseReason::LocalClose | CloseReason::RemoteClose) {
            warn!(conn = %self.id, remote = %self.remote, %reason, "closing connection");
        }
        self.events.on_disconnected(self, reason);
    }
}

fn close_reason_for(failure: IoFailure) -> CloseReason {
    match failure {
        IoFailure::Cancelled => CloseReason::Shutdown,
        IoFailure::TimedOut => CloseReason::IdleTimeout,
        IoFailure::Eof => CloseReason::RemoteClose,
        IoFailure::Io(_) => CloseReason::IoError,
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .field("level", &self.level())
            .finish()
    }
}
