// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! TCP listener and accept loop.
//!
//! `activate` spawns `max_simultaneous_accepts` accept workers over one
//! shared listener, so at most that many accepts are outstanding and every
//! completion runs the same code path. Each accepted socket is configured,
//! checked against the connection limiter (rejects close before a single
//! byte is written), wrapped in a [`Connection`] and handed to the
//! protocol. Transient accept errors back off from 10 ms doubling to 1 s;
//! a run of consecutive failures past the threshold surfaces `Fatal` to
//! the host and stops the listener.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Socket, TcpKeepalive, Type};
use tokio::{net::TcpListener, net::TcpStream, sync::watch, time::sleep};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, warn};

use crate::{
    limiter::conn::ConnectionLimiter,
    pool::buffer::BufferPool,
    server::{
        channel::DispatchChannel,
        connection::{Connection, ConnectionConfig, ConnectionEvents},
        protocol::Protocol,
        registry::ConnectionRegistry,
    },
    tasks::manager::TaskManager,
    time::{clock::Clock, snowflake::SnowflakeGenerator},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub host: IpAddr,
    pub port: u16,
    pub buffer_size: usize,
    pub no_delay: bool,
    pub keep_alive: bool,
    pub reuse_address: bool,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            buffer_size: 64 * 1024,
            no_delay: true,
            keep_alive: true,
            reuse_address: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    pub max_simultaneous_accepts: u32,
    #[serde(with = "crate::cfg::config::serde_millis")]
    pub accept_backoff_initial: Duration,
    #[serde(with = "crate::cfg::config::serde_millis")]
    pub accept_backoff_max: Duration,
    pub backlog: u32,
    /// Consecutive accept failures that count as fatal.
    pub fatal_accept_failures: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_accepts: 32,
            accept_backoff_initial: Duration::from_millis(10),
            accept_backoff_max: Duration::from_secs(1),
            backlog: 128,
            fatal_accept_failures: 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Active,
    Stopped,
}

/// Everything an accept worker needs to turn a socket into a running
/// connection.
pub(crate) struct AcceptDeps {
    pub limiter: Arc<ConnectionLimiter>,
    pub ids: Arc<SnowflakeGenerator>,
    pub conn_cfg: ConnectionConfig,
    pub clock: Arc<Clock>,
    pub pool: Arc<BufferPool>,
    pub channel: Arc<DispatchChannel>,
    pub events: Arc<dyn ConnectionEvents>,
    pub protocol: Arc<dyn Protocol>,
    pub tasks: Arc<TaskManager>,
    pub registry: Arc<ConnectionRegistry>,
}

pub struct Listener {
    socket_cfg: SocketConfig,
    cfg: ListenerConfig,
    inner: TcpListener,
    local_addr: SocketAddr,
    state_tx: watch::Sender<ListenerState>,
    fatal_tx: watch::Sender<Option<String>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    consecutive_failures: AtomicU32,
}

impl Listener {
    /// Bind the configured endpoint. A bind failure is fatal to
    /// activation and is returned here.
    pub fn bind(
        socket_cfg: SocketConfig,
        cfg: ListenerConfig,
        parent_cancel: &CancellationToken,
    ) -> Result<Self> {
        let addr = SocketAddr::new(socket_cfg.host, socket_cfg.port);
        let socket = Socket::new(
            Domain::for_address(addr),
            Type::STREAM,
            Some(socket2::Protocol::TCP),
        )
        .context("socket creation failed")?;
        socket
            .set_reuse_address(socket_cfg.reuse_address)
            .context("SO_REUSEADDR failed")?;
        socket
            .set_nonblocking(true)
            .context("nonblocking mode failed")?;
        socket
            .bind(&addr.into())
            .with_context(|| format!("bind {addr} failed"))?;
        socket
            .listen(cfg.backlog.max(100) as i32)
            .context("listen failed")?;

        let inner = TcpListener::from_std(socket.into())
            .context("listener registration failed")?;
        let local_addr = inner.local_addr().context("local_addr failed")?;

        let (state_tx, _) = watch::channel(ListenerState::Created);
        let (fatal_tx, _) = watch::channel(None);
        Ok(Self {
            socket_cfg,
            cfg,
            inner,
            local_addr,
            state_tx,
            fatal_tx,
            cancel: parent_cancel.child_token(),
            tracker: TaskTracker::new(),
            consecutive_failures: AtomicU32::new(0),
        })
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> watch::Receiver<ListenerState> {
        self.state_tx.subscribe()
    }

    /// Fatal listener errors surfaced to the host.
    pub fn fatal_errors(&self) -> watch::Receiver<Option<String>> {
        self.fatal_tx.subscribe()
    }

    /// Spawn the accept workers and the server-time tick.
    pub(crate) fn activate(self: &Arc<Self>, deps: Arc<AcceptDeps>) {
        deps.tasks.start_clock_tick();
        for worker in 0..self.cfg.max_simultaneous_accepts.max(1) {
            let listener = Arc::clone(self);
            let deps = Arc::clone(&deps);
            self.tracker
                .spawn(async move { listener.accept_worker(worker, deps).await });
        }
        self.tracker.close();
        self.state_tx.send_replace(ListenerState::Active);
    }

    /// Cancel the accept workers, wait for outstanding accepts to drain,
    /// then report `Stopped`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.wait().await;
        self.state_tx.send_replace(ListenerState::Stopped);
    }

    async fn accept_worker(self: Arc<Self>, worker: u32, deps: Arc<AcceptDeps>) {
        let mut backoff = self.cfg.accept_backoff_initial;
        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => return,
                accepted = self.inner.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    backoff = self.cfg.accept_backoff_initial;
                    self.handle_accept(stream, peer, &deps).await;
                },
                Err(err) => {
                    let failures =
                        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if failures >= self.cfg.fatal_accept_failures {
                        error!(worker, failures, "accept failing repeatedly: {err}");
                        self.fatal_tx.send_replace(Some(format!(
                            "accept failed {failures} times in a row: {err}"
                        )));
                        self.cancel.cancel();
                        return;
                    }
                    warn!(worker, failures, "accept error: {err}");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(self.cfg.accept_backoff_max);
                },
            }
        }
    }

    async fn handle_accept(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        deps: &Arc<AcceptDeps>,
    ) {
        if let Err(err) = configure_stream(&stream, &self.socket_cfg) {
            debug!(%peer, "socket configuration failed: {err}");
        }

        if !deps.limiter.try_acquire(peer.ip()) {
            // Closed before anything is written to it.
            debug!(%peer, "connection limit reached, rejecting");
            drop(stream);
            return;
        }

        let id = match deps.ids.next_id() {
            Ok(id) => id,
            Err(err) => {
                error!("id generation failed: {err}");
                self.fatal_tx.send_replace(Some(err.to_string()));
                deps.limiter.release(peer.ip());
                self.cancel.cancel();
                return;
            },
        };

        let conn = match Connection::spawn(
            stream,
            id,
            deps.conn_cfg.clone(),
            Arc::clone(&deps.clock),
            Arc::clone(&deps.events),
            &self.cancel,
        ) {
            Ok(conn) => conn,
            Err(err) => {
                debug!(%peer, "connection setup failed: {err}");
                deps.limiter.release(peer.ip());
                return;
            },
        };
        deps.registry.insert(&conn);

        if let Err(err) = deps.protocol.on_accepted(&conn).await {
            debug!(conn = %conn.id, "protocol rejected connection: {err:#}");
            conn.close(crate::error::CloseReason::LocalClose);
            return;
        }

        if let Err(err) =
            conn.begin_receive(Arc::clone(&deps.channel), Arc::clone(&deps.pool))
        {
            warn!(conn = %conn.id, "begin_receive failed: {err}");
            conn.close(crate::error::CloseReason::LocalClose);
        }
    }
}

/// Per-socket options from the config: NoDelay, buffer sizes and TCP
/// keep-alive (3 s idle, 1 s probe interval where the platform allows).
fn configure_stream(stream: &TcpStream, cfg: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(cfg.no_delay)?;
    let sock = socket2::SockRef::from(stream);
    sock.set_recv_buffer_size(cfg.buffer_size)?;
    sock.set_send_buffer_size(cfg.buffer_size)?;
    if cfg.keep_alive {
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(3))
            .with_interval(Duration::from_secs(1));
        sock.set_tcp_keepalive(&keepalive)?;
    }
    Ok(())
}
