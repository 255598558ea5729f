// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Protocol seam and the server runtime.
//!
//! [`Protocol`] is what the host plugs in: acceptance policy, per-packet
//! post-processing and lifecycle notifications. [`Server`] wires the
//! listener, the dispatch channel and workers, the task manager and both
//! limiters together behind a builder, and owns the root cancellation
//! token the whole tree hangs off.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use tokio::sync::watch;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info};

use crate::{
    cfg::config::Config,
    dispatch::{
        context::PropertyBag,
        dedup::DedupCache,
        handler::{HandlerRegistry, HandlerRegistryBuilder},
        pipeline::Pipeline,
    },
    error::{CloseReason, ServerError},
    limiter::{conn::ConnectionLimiter, rate::RateLimiter},
    packet::catalog::{AnyPacket, PacketCatalog},
    pool::{buffer::BufferPool, object::ObjectPool},
    server::{
        channel::DispatchChannel,
        connection::{Connection, ConnectionEvents},
        listener::{AcceptDeps, Listener, ListenerState},
        registry::ConnectionRegistry,
    },
    tasks::manager::TaskManager,
    time::{
        clock::Clock,
        snowflake::{IdKind, SnowflakeGenerator},
    },
};

/// Host-supplied policy and post-processing around the core runtime.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Acceptance policy. Returning an error closes the connection before
    /// its read loop starts.
    async fn on_accepted(&self, _conn: &Arc<Connection>) -> Result<()> {
        Ok(())
    }

    /// Post-processing after a packet completed the pipeline.
    async fn on_packet_done(&self, _conn: &Arc<Connection>, _packet: &AnyPacket) {}

    fn on_disconnected(&self, _conn: &Arc<Connection>, _reason: CloseReason) {}

    fn on_error(&self, _conn: &Arc<Connection>, _error: &ServerError) {}
}

/// A protocol that accepts everything and does nothing.
pub struct NullProtocol;

#[async_trait]
impl Protocol for NullProtocol {}

/// Bridges connection lifecycle events into the limiter, the registry
/// and the protocol.
struct EventBridge {
    limiter: Arc<ConnectionLimiter>,
    registry: Arc<ConnectionRegistry>,
    protocol: Arc<dyn Protocol>,
}

impl ConnectionEvents for EventBridge {
    fn on_disconnected(&self, conn: &Arc<Connection>, reason: CloseReason) {
        self.limiter.release(conn.remote.ip());
        self.registry.remove(conn.id);
        self.protocol.on_disconnected(conn, reason);
    }

    fn on_error(&self, conn: &Arc<Connection>, error: &ServerError) {
        self.protocol.on_error(conn, error);
    }
}

pub struct ServerBuilder {
    config: Config,
    protocol: Option<Arc<dyn Protocol>>,
    handlers: Option<Arc<HandlerRegistry>>,
    catalog: Option<Arc<PacketCatalog>>,
}

impl ServerBuilder {
    pub fn protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn handlers(mut self, handlers: Arc<HandlerRegistry>) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn catalog(mut self, catalog: Arc<PacketCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn build(mut self) -> Result<Arc<Server>> {
        self.config.validate_and_normalize()?;
        let cfg = self.config;

        let clock = Arc::new(Clock::default());
        let tasks = TaskManager::new(
            Arc::clone(&clock),
            cfg.tasks.machine_id,
            cfg.tasks.clone(),
        );
        let pool = BufferPool::new(&cfg.pools);
        let rate = Arc::new(RateLimiter::new(&cfg.rate_limit));
        let conn_limiter =
            Arc::new(ConnectionLimiter::new(cfg.connection.max_per_address));
        let channel =
            DispatchChannel::new(cfg.dispatch.queue_depth, cfg.dispatch.push_policy);
        let catalog = self.catalog.unwrap_or_else(PacketCatalog::with_defaults);
        let handlers = self
            .handlers
            .unwrap_or_else(|| HandlerRegistryBuilder::new().freeze());
        let protocol = self
            .protocol
            .unwrap_or_else(|| Arc::new(NullProtocol) as Arc<dyn Protocol>);
        let registry = Arc::new(ConnectionRegistry::new());
        let contexts = Arc::new(ObjectPool::<PropertyBag>::new(cfg.dispatch.queue_depth));
        let dedup = if cfg.dispatch.dedup_window.is_zero() {
            None
        } else {
            Some(Arc::new(DedupCache::new(cfg.dispatch.dedup_window)))
        };
        let pipeline = Pipeline::new(
            Arc::clone(&catalog),
            Arc::clone(&handlers),
            Arc::clone(&rate),
            Arc::clone(&protocol),
            Arc::clone(&contexts),
            dedup.clone(),
            cfg.connection.max_frame_len,
        );
        let ids = Arc::new(SnowflakeGenerator::new(
            Arc::clone(&clock),
            IdKind::Connection,
            cfg.tasks.machine_id,
        ));

        Ok(Arc::new(Server {
            cfg,
            clock,
            tasks,
            pool,
            rate,
            conn_limiter,
            channel,
            catalog,
            handlers,
            protocol,
            pipeline,
            ids,
            registry,
            contexts,
            dedup,
            listener: OnceCell::new(),
            root: CancellationToken::new(),
            dispatch_tracker: TaskTracker::new(),
        }))
    }
}

pub struct Server {
    cfg: Config,
    clock: Arc<Clock>,
    tasks: Arc<TaskManager>,
    pool: Arc<BufferPool>,
    rate: Arc<RateLimiter>,
    conn_limiter: Arc<ConnectionLimiter>,
    channel: Arc<DispatchChannel>,
    catalog: Arc<PacketCatalog>,
    handlers: Arc<HandlerRegistry>,
    protocol: Arc<dyn Protocol>,
    pipeline: Arc<Pipeline>,
    ids: Arc<SnowflakeGenerator>,
    registry: Arc<ConnectionRegistry>,
    contexts: Arc<ObjectPool<PropertyBag>>,
    dedup: Option<Arc<DedupCache>>,
    listener: OnceCell<Arc<Listener>>,
    root: CancellationToken,
    dispatch_tracker: TaskTracker,
}

impl Server {
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder {
            config,
            protocol: None,
            handlers: None,
            catalog: None,
        }
    }

    /// Bind, start the accept workers and the dispatch workers, schedule
    /// the background sweeps. Returns the bound address. Bind failure is
    /// fatal.
    pub async fn activate(self: &Arc<Self>) -> Result<SocketAddr> {
        let listener = Arc::new(
            Listener::bind(
                self.cfg.socket.clone(),
                self.cfg.listener.clone(),
                &self.root,
            )
            .context("listener activation failed")?,
        );
        if self.listener.set(Arc::clone(&listener)).is_err() {
            bail!("server is already active");
        }

        let events: Arc<dyn ConnectionEvents> = Arc::new(EventBridge {
            limiter: Arc::clone(&self.conn_limiter),
            registry: Arc::clone(&self.registry),
            protocol: Arc::clone(&self.protocol),
        });
        let deps = Arc::new(AcceptDeps {
            limiter: Arc::clone(&self.conn_limiter),
            ids: Arc::clone(&self.ids),
            conn_cfg: self.cfg.connection.clone(),
            clock: Arc::clone(&self.clock),
            pool: Arc::clone(&self.pool),
            channel: Arc::clone(&self.channel),
            events,
            protocol: Arc::clone(&self.protocol),
            tasks: Arc::clone(&self.tasks),
            registry: Arc::clone(&self.registry),
        });
        listener.activate(deps);

        for _ in 0..self.cfg.dispatch.workers.max(1) {
            self.dispatch_tracker.spawn(
                Arc::clone(&self.pipeline)
                    .run_worker(Arc::clone(&self.channel), self.root.child_token()),
            );
        }
        self.dispatch_tracker.close();

        let rate = Arc::clone(&self.rate);
        let idle_age = self.cfg.rate_limit.idle_evict_age;
        let sweep = self.tasks.schedule(
            "rate-limit-sweep",
            self.cfg.rate_limit.sweep_interval,
            Arc::new(move |_cancel| {
                let rate = Arc::clone(&rate);
                Box::pin(async move {
                    let evicted = rate.evict_idle(idle_age);
                    if evicted > 0 {
                        debug!(evicted, "rate limiter sweep");
                    }
                    Ok(())
                })
            }),
            Default::default(),
        );
        if let Err(err) = sweep {
            debug!("rate sweep not scheduled: {err:#}");
        }

        // Backstop for connections whose activity stamp stopped moving;
        // the read loop's own idle timeout normally fires first.
        let registry = Arc::clone(&self.registry);
        let clock = Arc::clone(&self.clock);
        let max_idle = self.cfg.connection.idle_timeout.saturating_mul(2);
        let sweep = self.tasks.schedule(
            "stale-connection-sweep",
            self.cfg.connection.sweep_interval,
            Arc::new(move |_cancel| {
                let registry = Arc::clone(&registry);
                let clock = Arc::clone(&clock);
                Box::pin(async move {
                    let closed = registry.sweep_idle(clock.coarse_ms(), max_idle);
                    if closed > 0 {
                        debug!(closed, "stale connection sweep");
                    }
                    Ok(())
                })
            }),
            Default::default(),
        );
        if let Err(err) = sweep {
            debug!("connection sweep not scheduled: {err:#}");
        }

        let registry = Arc::clone(&self.registry);
        let pool = Arc::clone(&self.pool);
        let rate = Arc::clone(&self.rate);
        let contexts = Arc::clone(&self.contexts);
        let flush = self.tasks.schedule(
            "metrics-flush",
            self.cfg.tasks.metrics_interval,
            Arc::new(move |_cancel| {
                let registry = Arc::clone(&registry);
                let pool = Arc::clone(&pool);
                let rate = Arc::clone(&rate);
                let contexts = Arc::clone(&contexts);
                Box::pin(async move {
                    let buffers = pool.counters();
                    let traffic = registry.aggregate_traffic();
                    info!(
                        connections = registry.count(),
                        bytes_in = traffic.bytes_in,
                        bytes_out = traffic.bytes_out,
                        packets_in = traffic.packets_in,
                        packets_out = traffic.packets_out,
                        buffers_outstanding = pool.outstanding(),
                        buffer_misses = buffers.misses,
                        contexts_free = contexts.free_count(),
                        context_misses = contexts.misses(),
                        endpoints = rate.tracked(),
                        "runtime metrics"
                    );
                    Ok(())
                })
            }),
            Default::default(),
        );
        if let Err(err) = flush {
            debug!("metrics flush not scheduled: {err:#}");
        }

        if let Some(dedup) = &self.dedup {
            let dedup = Arc::clone(dedup);
            let clock = Arc::clone(&self.clock);
            let evict = self.tasks.schedule(
                "dedup-evict",
                self.cfg.dispatch.dedup_window.max(Duration::from_secs(1)),
                Arc::new(move |_cancel| {
                    let dedup = Arc::clone(&dedup);
                    let clock = Arc::clone(&clock);
                    Box::pin(async move {
                        dedup.evict(clock.coarse_ms());
                        Ok(())
                    })
                }),
                Default::default(),
            );
            if let Err(err) = evict {
                debug!("dedup eviction not scheduled: {err:#}");
            }
        }

        let addr = listener.local_addr();
        debug!(
            config = %serde_json::to_string(&self.cfg).unwrap_or_default(),
            "effective configuration"
        );
        info!(%addr, handlers = self.handlers.len(), "server active");
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.get().map(|l| l.local_addr())
    }

    pub fn listener_state(&self) -> Option<watch::Receiver<ListenerState>> {
        self.listener.get().map(|l| l.state())
    }

    /// Fatal errors surfaced by the listener.
    pub fn fatal_errors(&self) -> Option<watch::Receiver<Option<String>>> {
        self.listener.get().map(|l| l.fatal_errors())
    }

    #[inline]
    pub fn clock(&self) -> &Arc<Clock> {
        &self.clock
    }

    #[inline]
    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    #[inline]
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    #[inline]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate
    }

    #[inline]
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    #[inline]
    pub fn context_pool(&self) -> &Arc<ObjectPool<PropertyBag>> {
        &self.contexts
    }

    #[inline]
    pub fn catalog(&self) -> &Arc<PacketCatalog> {
        &self.catalog
    }

    #[inline]
    pub fn default_cipher_algorithm(&self) -> crate::codec::crypto::CipherAlgorithm {
        self.cfg.encryption.algorithm
    }

    /// Graceful shutdown: stop accepting, cancel the connection tree and
    /// the dispatch workers, hand queued leases back, stop the manager.
    pub async fn shutdown(&self) {
        if let Some(listener) = self.listener.get() {
            listener.shutdown().await;
        }
        self.root.cancel();
        self.dispatch_tracker.close();
        self.dispatch_tracker.wait().await;
        let drained = self.channel.drain().await;
        self.tasks.shutdown();
        info!(drained, "server stopped");
    }
}
