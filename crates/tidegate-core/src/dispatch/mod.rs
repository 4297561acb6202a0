//! Opcode-routed packet dispatcher.
//!
//! The dispatcher drains a connection's incoming queue and, for each packet:
//! rents a pooled context, runs the pre-middleware chain around the terminal
//! stage, and returns the context. The terminal enforces descriptor policy
//! (cancellation, permission, rate limit, encryption), decrypts and
//! decompresses the payload, invokes the handler under its timeout, adapts
//! the reply through the tagged [`HandlerReply`] router, and runs the
//! post-middleware chain around the outbound send.
//!
//! Packets from one connection dispatch in arrival order; packets from
//! different connections dispatch concurrently. Handler failures - errors
//! and panics alike - become control-fail directives, never crashes.

pub mod classify;
mod context;
mod descriptor;
mod middleware;

use std::{collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::FutureExt;

pub use context::{DispatchContext, Outbound};
pub use descriptor::{
    EncryptionPolicy, HandlerDescriptor, HandlerRegistration, HandlerReply, PacketController,
    PacketHandler, handler_fn,
};
pub use middleware::{Middleware, Next, Terminal};

use crate::{
    connection::Connection,
    env::Environment,
    error::{DispatchError, HandlerError, RegistrationError},
    pool::Pool,
    rate::RateLimiter,
};
use tidegate_crypto::Cipher;
use tidegate_proto::{
    ControlDirective, DirectiveFlags, OPCODE_CONTROL, Packet, ProtocolAction, ProtocolReason,
};

/// Builder assembling the immutable handler table and middleware chains.
///
/// Registration happens once at startup; errors abort it. The built
/// [`Dispatcher`] never mutates its table.
pub struct DispatcherBuilder {
    handlers: HashMap<u16, Arc<HandlerDescriptor>>,
    pre: Vec<Arc<dyn Middleware>>,
    post: Vec<Arc<dyn Middleware>>,
    max_payload_len: usize,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherBuilder {
    /// Start an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            pre: Vec::new(),
            post: Vec::new(),
            max_payload_len: 1024 * 1024,
        }
    }

    /// Register one handler.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::ReservedOpcode`] for opcode 0
    /// - [`RegistrationError::DuplicateOpcode`] if the opcode is taken
    ///
    /// On error the table is unchanged.
    pub fn register(
        &mut self,
        registration: HandlerRegistration,
    ) -> Result<&mut Self, RegistrationError> {
        let opcode = registration.opcode;
        if opcode == OPCODE_CONTROL {
            return Err(RegistrationError::ReservedOpcode);
        }
        if self.handlers.contains_key(&opcode) {
            return Err(RegistrationError::DuplicateOpcode(opcode));
        }
        self.handlers.insert(opcode, Arc::new(registration.into_descriptor()));
        Ok(self)
    }

    /// Register every handler a controller contributes, atomically: a
    /// duplicate or reserved opcode anywhere in the controller leaves the
    /// table unchanged.
    ///
    /// # Errors
    ///
    /// - [`RegistrationError::EmptyController`] if it contributes nothing
    /// - [`RegistrationError::ReservedOpcode`] / [`RegistrationError::DuplicateOpcode`]
    pub fn register_controller(
        &mut self,
        controller: &dyn PacketController,
    ) -> Result<&mut Self, RegistrationError> {
        let registrations = controller.registrations();
        if registrations.is_empty() {
            return Err(RegistrationError::EmptyController);
        }

        let mut staged: HashMap<u16, HandlerRegistration> = HashMap::new();
        for registration in registrations {
            let opcode = registration.opcode;
            if opcode == OPCODE_CONTROL {
                return Err(RegistrationError::ReservedOpcode);
            }
            if self.handlers.contains_key(&opcode) || staged.contains_key(&opcode) {
                return Err(RegistrationError::DuplicateOpcode(opcode));
            }
            staged.insert(opcode, registration);
        }

        for (opcode, registration) in staged {
            self.handlers.insert(opcode, Arc::new(registration.into_descriptor()));
        }
        Ok(self)
    }

    /// Append a middleware running before the terminal (insertion order).
    pub fn use_pre(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.pre.push(middleware);
        self
    }

    /// Append a middleware wrapping the outbound send (inverse insertion
    /// order; the last added is outermost).
    pub fn use_post(&mut self, middleware: Arc<dyn Middleware>) -> &mut Self {
        self.post.push(middleware);
        self
    }

    /// Bound for inflated payload sizes on the decompress path.
    pub fn max_payload_len(&mut self, len: usize) -> &mut Self {
        self.max_payload_len = len;
        self
    }

    /// Number of opcodes currently staged in the builder.
    #[must_use]
    pub fn staged_count(&self) -> usize {
        self.handlers.len()
    }

    /// Freeze the table into a dispatcher.
    #[must_use]
    pub fn build<E: Environment>(
        self,
        env: E,
        limiter: Arc<RateLimiter>,
        cipher: Arc<dyn Cipher>,
    ) -> Arc<Dispatcher<E>> {
        let mut post_reversed = self.post;
        post_reversed.reverse();

        Arc::new(Dispatcher {
            env,
            handlers: self.handlers,
            pre: self.pre,
            post_reversed,
            limiter,
            cipher,
            contexts: Pool::new(64),
            max_payload_len: self.max_payload_len,
        })
    }
}

/// The packet dispatcher.
///
/// Immutable after build; shared across all connections.
pub struct Dispatcher<E: Environment> {
    env: E,
    handlers: HashMap<u16, Arc<HandlerDescriptor>>,
    pre: Vec<Arc<dyn Middleware>>,
    post_reversed: Vec<Arc<dyn Middleware>>,
    limiter: Arc<RateLimiter>,
    cipher: Arc<dyn Cipher>,
    contexts: Pool<DispatchContext>,
    max_payload_len: usize,
}

/// What came out of the handler invocation.
enum Invocation {
    Reply(Result<HandlerReply, HandlerError>),
    Panicked,
    TimedOut,
    Cancelled,
}

impl<E: Environment> Dispatcher<E> {
    /// Number of registered opcodes.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// The rate limiter backing descriptor rate policies.
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Attach to a connection: spawn the task that drains its incoming
    /// queue and dispatches packets in arrival order.
    pub fn attach(self: &Arc<Self>, conn: Arc<Connection>) -> tokio::task::JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher.run_connection(conn).await;
        })
    }

    /// Drain and dispatch until the connection closes.
    pub async fn run_connection(&self, conn: Arc<Connection>) {
        loop {
            let raw = tokio::select! {
                () = conn.cancelled() => break,
                raw = conn.channel().next_packet() => raw,
            };
            let Some(raw) = raw else { break };
            self.dispatch_raw(&conn, raw).await;
        }
    }

    /// Dispatch one whole frame body from `conn`.
    pub async fn dispatch_raw(&self, conn: &Arc<Connection>, raw: Bytes) {
        let packet = match Packet::decode(&raw) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!(remote = %conn.remote(), error = %e, "malformed packet");
                self.try_send_fail(
                    conn,
                    ProtocolReason::RequestInvalid,
                    ProtocolAction::FixAndRetry,
                    DirectiveFlags::NONE,
                    0,
                    None,
                )
                .await;
                return;
            },
        };

        let opcode = packet.opcode();
        let sequence = packet.sequence_id();
        let Some(descriptor) = self.handlers.get(&opcode) else {
            tracing::warn!(opcode, remote = %conn.remote(), "no handler for opcode");
            self.try_send_fail(
                conn,
                ProtocolReason::RequestInvalid,
                ProtocolAction::None,
                DirectiveFlags::NONE,
                sequence,
                Some(u32::from(opcode)),
            )
            .await;
            return;
        };

        let mut ctx = self.contexts.rent_or(DispatchContext::new);
        ctx.init(packet, Arc::clone(conn), Arc::clone(descriptor));

        let terminal = DispatchTerminal { dispatcher: self };
        let result = Next::new(&self.pre, &terminal).run(&mut ctx).await;
        if let Err(e) = result {
            tracing::warn!(opcode, remote = %conn.remote(), error = %e, "dispatch failed");
        }

        // The context goes back on every exit path.
        ctx.reset();
        self.contexts.give(ctx);
    }

    /// The terminal stage: policy checks, handler invocation, reply routing,
    /// and the post chain around the send.
    async fn terminal_stage(&self, ctx: &mut DispatchContext) -> Result<(), DispatchError> {
        let (Some(descriptor), Some(conn)) =
            (ctx.descriptor().map(Arc::clone), ctx.connection().map(Arc::clone))
        else {
            debug_assert!(false, "terminal reached with unarmed context");
            return Ok(());
        };
        let sequence = ctx.sequence_id();
        let opcode = descriptor.opcode();

        // Pre-conditions, cheapest first. Each failure sends a directive
        // and returns without invoking the handler.
        if conn.cancellation().is_cancelled() {
            return self
                .send_fail(
                    &conn,
                    ProtocolReason::Timeout,
                    ProtocolAction::Retry,
                    DirectiveFlags::IS_TRANSIENT,
                    sequence,
                    None,
                )
                .await;
        }

        if let Some(required) = descriptor.required_permission() {
            if conn.permission() < required {
                tracing::debug!(
                    opcode,
                    remote = %conn.remote(),
                    have = ?conn.permission(),
                    need = ?required,
                    "permission denied"
                );
                return self
                    .send_fail(
                        &conn,
                        ProtocolReason::AccountLocked,
                        ProtocolAction::None,
                        DirectiveFlags::NONE,
                        sequence,
                        None,
                    )
                    .await;
            }
        }

        if let Some(policy) = descriptor.rate_policy() {
            if !self.limiter.check(conn.remote(), opcode, policy, self.env.now()) {
                tracing::debug!(opcode, remote = %conn.remote(), "rate limited");
                return self
                    .send_fail(
                        &conn,
                        ProtocolReason::RateLimited,
                        ProtocolAction::Retry,
                        DirectiveFlags::IS_TRANSIENT,
                        sequence,
                        Some(u32::from(opcode)),
                    )
                    .await;
            }
        }

        let encrypted = ctx.packet().is_some_and(Packet::is_encrypted);
        let mismatch = match descriptor.encryption_policy() {
            EncryptionPolicy::Required => !encrypted,
            EncryptionPolicy::Forbidden => encrypted,
            EncryptionPolicy::Any => false,
        };
        if mismatch {
            tracing::debug!(opcode, remote = %conn.remote(), encrypted, "encryption mismatch");
            return self
                .send_fail(
                    &conn,
                    ProtocolReason::EncryptionMismatch,
                    ProtocolAction::FixAndRetry,
                    DirectiveFlags::NONE,
                    sequence,
                    None,
                )
                .await;
        }

        // Inbound transforms: decrypt, then decompress.
        if encrypted {
            let decrypted = conn.secret().and_then(|secret| {
                let packet = ctx.packet()?;
                self.cipher
                    .decrypt(conn.suite(), &secret, &packet.payload)
                    .ok()
                    .map(|plain| packet.with_decrypted_payload(plain))
            });
            match decrypted {
                Some(packet) => ctx.set_packet(packet),
                None => {
                    tracing::warn!(opcode, remote = %conn.remote(), "packet decryption failed");
                    return self
                        .send_fail(
                            &conn,
                            ProtocolReason::NetworkError,
                            ProtocolAction::Retry,
                            DirectiveFlags::IS_TRANSIENT,
                            sequence,
                            None,
                        )
                        .await;
                },
            }
        }

        if ctx.packet().is_some_and(Packet::is_compressed) {
            let inflated =
                ctx.packet().and_then(|packet| packet.decompressed(self.max_payload_len).ok());
            match inflated {
                Some(packet) => ctx.set_packet(packet),
                None => {
                    tracing::warn!(opcode, remote = %conn.remote(), "packet decompression failed");
                    return self
                        .send_fail(
                            &conn,
                            ProtocolReason::RequestInvalid,
                            ProtocolAction::FixAndRetry,
                            DirectiveFlags::NONE,
                            sequence,
                            None,
                        )
                        .await;
                },
            }
        }

        let Some(packet) = ctx.packet().cloned() else {
            return Ok(());
        };

        let invocation = self.invoke(&descriptor, packet, &conn).await;

        match invocation {
            Invocation::Cancelled | Invocation::TimedOut => {
                self.send_fail(
                    &conn,
                    ProtocolReason::Timeout,
                    ProtocolAction::Retry,
                    DirectiveFlags::IS_TRANSIENT,
                    sequence,
                    None,
                )
                .await
            },
            Invocation::Panicked => {
                tracing::error!(opcode, remote = %conn.remote(), "handler panicked");
                self.send_fail(
                    &conn,
                    ProtocolReason::InternalError,
                    ProtocolAction::None,
                    DirectiveFlags::NONE,
                    sequence,
                    None,
                )
                .await
            },
            Invocation::Reply(Err(err)) => {
                let (reason, action, flags) = classify::classify(&err);
                tracing::warn!(
                    opcode,
                    remote = %conn.remote(),
                    error = %err,
                    ?reason,
                    "handler failed"
                );
                self.send_fail(&conn, reason, action, flags, sequence, None).await
            },
            Invocation::Reply(Ok(reply)) => {
                self.adapt_reply(ctx, &conn, reply, sequence)?;
                let send_terminal = SendTerminal { dispatcher: self };
                Next::new(&self.post_reversed, &send_terminal).run(ctx).await
            },
        }
    }

    /// Invoke the handler under its timeout and the connection's
    /// cancellation, containing panics.
    async fn invoke(
        &self,
        descriptor: &Arc<HandlerDescriptor>,
        packet: Packet,
        conn: &Arc<Connection>,
    ) -> Invocation {
        let fut = AssertUnwindSafe(descriptor.handler().handle(packet, Arc::clone(conn)))
            .catch_unwind();

        if let Some(limit) = descriptor.timeout() {
            tokio::select! {
                () = conn.cancelled() => Invocation::Cancelled,
                outcome = tokio::time::timeout(limit, fut) => match outcome {
                    Ok(Ok(reply)) => Invocation::Reply(reply),
                    Ok(Err(_panic)) => Invocation::Panicked,
                    Err(_elapsed) => Invocation::TimedOut,
                },
            }
        } else {
            tokio::select! {
                () = conn.cancelled() => Invocation::Cancelled,
                outcome = fut => match outcome {
                    Ok(reply) => Invocation::Reply(reply),
                    Err(_panic) => Invocation::Panicked,
                },
            }
        }
    }

    /// Route the handler's return value into the context's outbound slot.
    fn adapt_reply(
        &self,
        ctx: &mut DispatchContext,
        conn: &Arc<Connection>,
        reply: HandlerReply,
        sequence: u32,
    ) -> Result<(), DispatchError> {
        match reply {
            HandlerReply::None => {
                ctx.skip_outbound = true;
            },
            HandlerReply::Bytes(bytes) => {
                ctx.outbound = Some(Outbound::Raw(bytes));
            },
            HandlerReply::Text(text) => {
                ctx.outbound = Some(Outbound::Packet(Packet::text(sequence, &text)));
            },
            HandlerReply::Packet(mut packet) => {
                if packet.sequence_id() == 0 && sequence != 0 {
                    packet.header.set_sequence_id(sequence);
                }

                let squeezed = packet.compressed()?;
                let sealed = match conn.secret() {
                    Some(secret) => {
                        let ciphertext =
                            self.cipher.encrypt(conn.suite(), &secret, &squeezed.payload)?;
                        squeezed.with_encrypted_payload(ciphertext)
                    },
                    None => {
                        tracing::debug!(
                            remote = %conn.remote(),
                            "no session secret; reply sent unencrypted"
                        );
                        squeezed
                    },
                };
                ctx.outbound = Some(Outbound::Packet(sealed));
            },
        }
        Ok(())
    }

    /// The send stage at the center of the post chain.
    async fn send_stage(&self, ctx: &mut DispatchContext) -> Result<(), DispatchError> {
        if ctx.skip_outbound {
            return Ok(());
        }
        let Some(outbound) = ctx.outbound.take() else {
            return Ok(());
        };
        let Some(conn) = ctx.connection().map(Arc::clone) else {
            return Ok(());
        };

        match outbound {
            Outbound::Raw(bytes) => conn.send_bytes(&bytes).await?,
            Outbound::Packet(packet) => conn.send_packet(&packet).await?,
        }
        Ok(())
    }

    /// Send a control-fail directive.
    async fn send_fail(
        &self,
        conn: &Arc<Connection>,
        reason: ProtocolReason,
        action: ProtocolAction,
        flags: DirectiveFlags,
        sequence: u32,
        arg0: Option<u32>,
    ) -> Result<(), DispatchError> {
        let mut directive = ControlDirective::fail(reason, action, flags, sequence);
        if let Some(arg0) = arg0 {
            directive = directive.with_arg0(arg0);
        }

        let packet = directive.into_packet();
        let mut buf = BytesMut::with_capacity(packet.wire_len());
        packet.encode(&mut buf)?;

        // Straight to the channel: directives may race the closing state.
        conn.channel().send(&buf).await.map_err(DispatchError::Send)?;
        Ok(())
    }

    /// Send a control-fail, demoting failures to a debug log (used on paths
    /// where the connection is already suspect).
    async fn try_send_fail(
        &self,
        conn: &Arc<Connection>,
        reason: ProtocolReason,
        action: ProtocolAction,
        flags: DirectiveFlags,
        sequence: u32,
        arg0: Option<u32>,
    ) {
        if let Err(e) = self.send_fail(conn, reason, action, flags, sequence, arg0).await {
            tracing::debug!(remote = %conn.remote(), error = %e, "control-fail not delivered");
        }
    }
}

/// Terminal adapter: the dispatch terminal stage.
struct DispatchTerminal<'d, E: Environment> {
    dispatcher: &'d Dispatcher<E>,
}

#[async_trait]
impl<E: Environment> Terminal for DispatchTerminal<'_, E> {
    async fn call(&self, ctx: &mut DispatchContext) -> Result<(), DispatchError> {
        self.dispatcher.terminal_stage(ctx).await
    }
}

/// Terminal adapter: the outbound send stage.
struct SendTerminal<'d, E: Environment> {
    dispatcher: &'d Dispatcher<E>,
}

#[async_trait]
impl<E: Environment> Terminal for SendTerminal<'_, E> {
    async fn call(&self, ctx: &mut DispatchContext) -> Result<(), DispatchError> {
        self.dispatcher.send_stage(ctx).await
    }
}
