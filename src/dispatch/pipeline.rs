// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The pipeline driver.
//!
//! Dispatch workers pull envelopes from the channel, decode through the
//! catalog, resolve the handler, then run the middleware chain with the
//! handler as the endpoint. Handler invocations run on their own task so
//! a panic is recovered into an internal-error notice and a timeout can
//! abort the work; the wrap stage mirrors the request's transforms onto
//! the reply before it is sent.

use std::sync::Arc;

use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    dispatch::{
        context::{DispatchAttributes, PacketContext, PropertyBag},
        dedup::DedupCache,
        handler::{BusyPolicy, HandlerEntry, HandlerRegistry},
        middleware::{
            BUSY_NOTICE, Endpoint, INTERNAL_NOTICE, Middleware, Next, PermissionStage,
            RateLimitStage, StageFuture, TimeoutStage, UnwrapStage, Verdict,
        },
        reply::{WrapSpec, send_notice, send_reply},
    },
    error::CloseReason,
    limiter::rate::RateLimiter,
    packet::{
        catalog::{AnyPacket, PacketBody, PacketCatalog},
        flags::PacketFlags,
    },
    pool::object::ObjectPool,
    server::{
        channel::{DispatchChannel, Envelope},
        connection::Connection,
        protocol::Protocol,
    },
};

pub struct Pipeline {
    catalog: Arc<PacketCatalog>,
    handlers: Arc<HandlerRegistry>,
    chain: Vec<Arc<dyn Middleware>>,
    protocol: Arc<dyn Protocol>,
    contexts: Arc<ObjectPool<PropertyBag>>,
    dedup: Option<Arc<DedupCache>>,
    max_frame_len: usize,
}

impl Pipeline {
    pub(crate) fn new(
        catalog: Arc<PacketCatalog>,
        handlers: Arc<HandlerRegistry>,
        rate: Arc<RateLimiter>,
        protocol: Arc<dyn Protocol>,
        contexts: Arc<ObjectPool<PropertyBag>>,
        dedup: Option<Arc<DedupCache>>,
        max_frame_len: usize,
    ) -> Arc<Self> {
        // Pre stages in order 0..3; the endpoint closes the chain and the
        // wrap stage runs inside it on the reply path.
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(RateLimitStage::new(rate)),
            Arc::new(TimeoutStage),
            Arc::new(PermissionStage),
            Arc::new(UnwrapStage),
        ];
        Arc::new(Self {
            catalog,
            handlers,
            chain,
            protocol,
            contexts,
            dedup,
            max_frame_len,
        })
    }

    /// One dispatch worker: pull until shutdown.
    pub(crate) async fn run_worker(
        self: Arc<Self>,
        channel: Arc<DispatchChannel>,
        cancel: CancellationToken,
    ) {
        while let Some(envelope) = channel.pull(&cancel).await {
            self.process(envelope).await;
        }
    }

    async fn process(&self, envelope: Envelope) {
        let Envelope {
            connection,
            lease,
            seq,
        } = envelope;

        // Enter the connection's turnstile: frames replay in arrival
        // order no matter which worker pulled them. The guard lets the
        // next ticket through on every exit path.
        connection.await_turn(seq).await;
        let turn = TurnGuard {
            connection: Arc::clone(&connection),
        };

        let decoded = self.catalog.decode(lease.as_ref());
        // The packet owns copies of what it needs; the raw frame goes
        // straight back to the pool.
        lease.release();

        let packet = match decoded {
            Ok(packet) => packet,
            Err(err) => {
                debug!(conn = %connection.id, "frame rejected: {err}");
                connection.close(CloseReason::ProtocolViolation);
                return;
            },
        };

        // Fragment runs accumulate on the connection until the final
        // frame; only whole messages enter the chain.
        let packet = match connection.absorb_fragment(packet) {
            Ok(Some(packet)) => packet,
            Ok(None) => return,
            Err(err) => {
                debug!(conn = %connection.id, "reassembly failed: {err}");
                connection.close(CloseReason::ProtocolViolation);
                return;
            },
        };

        if let (Some(dedup), AnyPacket::Binary(binary)) = (&self.dedup, &packet) {
            if !dedup.admit(packet.magic(), packet.opcode(), binary.timestamp_ms) {
                debug!(conn = %connection.id, opcode = packet.opcode(), "duplicate dropped");
                return;
            }
        }

        let Some(entry) = self.handlers.resolve(packet.magic(), packet.opcode())
        else {
            debug!(
                conn = %connection.id,
                magic = %format_args!("0x{:08x}", packet.magic()),
                opcode = packet.opcode(),
                "no handler registered, dropping"
            );
            return;
        };

        if entry.options.parallel_per_connection {
            // Parallel handlers keep a per-(connection, opcode) guard so
            // the same opcode never overlaps itself.
            let guard = connection
                .opcode_guards
                .entry(packet.opcode())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone();
            match entry.options.busy {
                BusyPolicy::Queue => {
                    // Enqueue on the guard while still holding the turn
                    // (the fair mutex keeps same-opcode FIFO), then let
                    // the next ticket through before waiting.
                    let mut lock_fut = Box::pin(Arc::clone(&guard).lock_owned());
                    let enqueued = tokio::select! {
                        biased;
                        held = &mut lock_fut => Some(held),
                        _ = std::future::ready(()) => None,
                    };
                    drop(turn);
                    let _held = match enqueued {
                        Some(held) => held,
                        None => lock_fut.await,
                    };
                    self.execute(entry, packet, connection).await;
                },
                BusyPolicy::Reject => {
                    let attempt = guard.try_lock();
                    drop(turn);
                    match attempt {
                        Ok(_held) => self.execute(entry, packet, connection).await,
                        Err(_) => {
                            debug!(conn = %connection.id, "opcode busy, rejecting");
                            send_notice(&connection, BUSY_NOTICE).await;
                        },
                    }
                },
            }
        } else {
            // One packet in the pipeline per connection: the turn is held
            // until the processing slot is ours, so later frames do not
            // even decode before this one starts.
            let _held = Arc::clone(&connection.processing).lock_owned().await;
            drop(turn);
            self.execute(entry, packet, connection).await;
        }
    }

    async fn execute(
        &self,
        entry: Arc<HandlerEntry>,
        packet: AnyPacket,
        connection: Arc<Connection>,
    ) {
        let flags = packet.flags();
        let attributes = DispatchAttributes {
            timeout: entry.options.timeout,
            min_level: entry.options.min_level,
            request_encrypted: flags.contains(PacketFlags::ENCRYPTED),
            request_compressed: flags.contains(PacketFlags::COMPRESSED),
        };
        let mut ctx = PacketContext::new(packet, Arc::clone(&connection), attributes);

        // The property map is recycled through the context pool.
        let mut bag = self.contexts.take();
        ctx.properties = std::mem::take(&mut bag.map);

        let endpoint = HandlerEndpoint {
            entry,
            max_frame_len: self.max_frame_len,
        };
        let verdict = Next {
            chain: &self.chain,
            endpoint: &endpoint,
        }
        .run(&mut ctx)
        .await;

        match verdict {
            Verdict::Done => {
                self.protocol.on_packet_done(&ctx.connection, &ctx.packet).await;
            },
            Verdict::Notice(text) => send_notice(&ctx.connection, &text).await,
            Verdict::Drop => {},
            Verdict::Close(reason) => ctx.connection.close(reason),
        }

        bag.map = std::mem::take(&mut ctx.properties);
        self.contexts.put(bag);
    }
}

/// Aborts the spawned handler task when the surrounding future is
/// dropped, which is exactly what the timeout stage does on expiry.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Lets the next turnstile ticket through on drop, so every exit path of
/// `process` releases the connection's intake exactly once.
struct TurnGuard {
    connection: Arc<Connection>,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.connection.complete_turn();
    }
}

struct HandlerEndpoint {
    entry: Arc<HandlerEntry>,
    max_frame_len: usize,
}

impl Endpoint for HandlerEndpoint {
    fn invoke<'a>(&'a self, ctx: &'a mut PacketContext) -> StageFuture<'a> {
        Box::pin(async move {
            let packet = ctx.packet.clone();
            let connection = Arc::clone(&ctx.connection);
            let cancel = connection.cancellation().child_token();

            let task = tokio::spawn((self.entry.func)(
                packet,
                Arc::clone(&connection),
                cancel,
            ));
            let _abort = AbortOnDrop(task.abort_handle());

            let result = match task.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    warn!(conn = %connection.id, "handler panicked");
                    return Verdict::Notice(INTERNAL_NOTICE.to_string());
                },
                Err(_) => return Verdict::Drop,
            };

            match result {
                Ok(reply) => {
                    let wrap = WrapSpec {
                        compress: ctx.attributes.request_compressed,
                        suite: if ctx.attributes.request_encrypted {
                            connection.cipher()
                        } else {
                            None
                        },
                        max_frame_len: self.max_frame_len,
                    };
                    match send_reply(&connection, reply, ctx.packet.opcode(), &wrap)
                        .await
                    {
                        Ok(()) => Verdict::Done,
                        Err(err) => {
                            debug!(conn = %connection.id, "reply send failed: {err}");
                            Verdict::Drop
                        },
                    }
                },
                Err(err) => {
                    warn!(conn = %connection.id, "handler failed: {err:#}");
                    Verdict::Notice(INTERNAL_NOTICE.to_string())
                },
            }
        })
    }
}
