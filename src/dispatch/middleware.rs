// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Continuation-passing middleware.
//!
//! Each stage receives the context and a [`Next`] continuation; a stage
//! short-circuits by returning a verdict without calling `next.run(ctx)`.
//! Short-circuits are values, never panics: the pipeline driver interprets
//! the verdict (send a notice, drop, close) after the chain unwinds.
//!
//! The built-in chain, in order: rate limit, timeout, permission, unwrap.
//! The handler endpoint sits at the end of the chain; the wrap stage runs
//! inside the endpoint when the reply is sent.

use std::{pin::Pin, sync::Arc};

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    dispatch::context::PacketContext,
    error::CloseReason,
    limiter::rate::RateLimiter,
    packet::{catalog::PacketBody, flags::PacketFlags},
};

pub const RATE_LIMIT_NOTICE: &str = "You have been rate limited.";
pub const PERMISSION_NOTICE: &str = "Permission denied.";
pub const TRANSFORM_NOTICE: &str = "Packet transform failed.";
pub const INTERNAL_NOTICE: &str = "Internal error.";
pub const BUSY_NOTICE: &str = "Busy.";

/// Outcome of the chain, interpreted by the pipeline driver.
#[derive(Debug)]
pub enum Verdict {
    /// The handler ran and its reply (if any) was sent.
    Done,
    /// Short-circuit: send this text notice, drop the message, continue.
    Notice(String),
    /// Drop the message silently.
    Drop,
    /// Tear the connection down.
    Close(CloseReason),
}

pub type StageFuture<'a> = Pin<Box<dyn Future<Output = Verdict> + Send + 'a>>;

/// Terminal stage of the chain: invokes the resolved handler.
pub trait Endpoint: Send + Sync {
    fn invoke<'a>(&'a self, ctx: &'a mut PacketContext) -> StageFuture<'a>;
}

/// The continuation handed to each stage.
pub struct Next<'a> {
    pub(crate) chain: &'a [Arc<dyn Middleware>],
    pub(crate) endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn run<'b>(self, ctx: &'b mut PacketContext) -> StageFuture<'b>
    where 'a: 'b {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((stage, rest)) => {
                    stage
                        .handle(ctx, Next {
                            chain: rest,
                            endpoint: self.endpoint,
                        })
                        .await
                },
                None => self.endpoint.invoke(ctx).await,
            }
        })
    }
}

/// One pipeline stage. Stages must be safe to invoke concurrently on
/// distinct contexts and must not mutate shared state without their own
/// synchronization.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: &mut PacketContext, next: Next<'_>) -> Verdict;
}

/// Pre stage 0: sliding-window rate limiting by remote endpoint.
pub struct RateLimitStage {
    limiter: Arc<RateLimiter>,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

#[async_trait]
impl Middleware for RateLimitStage {
    async fn handle(&self, ctx: &mut PacketContext, next: Next<'_>) -> Verdict {
        if !self.limiter.check(&ctx.connection.remote_endpoint()) {
            debug!(conn = %ctx.connection.id, "rate limited");
            return Verdict::Notice(RATE_LIMIT_NOTICE.to_string());
        }
        next.run(ctx).await
    }
}

/// Pre stage 1: race the rest of the pipeline against the handler's
/// declared deadline. Dropping the continuation cancels the downstream
/// stages and the handler with it.
pub struct TimeoutStage;

#[async_trait]
impl Middleware for TimeoutStage {
    async fn handle(&self, ctx: &mut PacketContext, next: Next<'_>) -> Verdict {
        let Some(limit) = ctx.attributes.timeout else {
            return next.run(ctx).await;
        };
        let ms = limit.as_millis();
        match timeout(limit, next.run(ctx)).await {
            Ok(verdict) => verdict,
            Err(_) => Verdict::Notice(format!("Request timeout ({ms}ms)")),
        }
    }
}

/// Pre stage 2: authorization level check.
pub struct PermissionStage;

#[async_trait]
impl Middleware for PermissionStage {
    async fn handle(&self, ctx: &mut PacketContext, next: Next<'_>) -> Verdict {
        if ctx.attributes.min_level > ctx.connection.level() {
            debug!(
                conn = %ctx.connection.id,
                required = ctx.attributes.min_level,
                actual = ctx.connection.level(),
                "permission denied"
            );
            return Verdict::Notice(PERMISSION_NOTICE.to_string());
        }
        next.run(ctx).await
    }
}

/// Pre stage 3: peel encryption and compression off the payload. An AEAD
/// failure closes the connection; any other transform failure surfaces as
/// a notice.
pub struct UnwrapStage;

#[async_trait]
impl Middleware for UnwrapStage {
    async fn handle(&self, ctx: &mut PacketContext, next: Next<'_>) -> Verdict {
        // Runs unconditionally: unwrapping is a no-op for plain payloads,
        // but text packets re-validate their class cap and UTF-8 here,
        // which also covers reassembled fragment runs that skipped the
        // per-frame checks.
        let flags = ctx.packet.flags();
        let suite = if flags.contains(PacketFlags::ENCRYPTED) {
            ctx.connection.cipher()
        } else {
            None
        };
        if let Err(err) = ctx.packet.unwrap_transforms(suite.as_ref()) {
            if err.is_authentication_failure() {
                warn!(conn = %ctx.connection.id, "packet decryption failed");
                return Verdict::Close(CloseReason::AuthenticationFailed);
            }
            debug!(conn = %ctx.connection.id, "transform failed: {err}");
            return Verdict::Notice(TRANSFORM_NOTICE.to_string());
        }
        next.run(ctx).await
    }
}
