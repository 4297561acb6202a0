//! Handler descriptors and registration.
//!
//! Registration is explicit: handlers are functions or types registered
//! against an opcode through a builder, optionally bundled into controllers.
//! There is no reflection anywhere near the hot path - descriptor lookup is
//! one hash probe and invocation goes through a trait object captured at
//! registration time.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    connection::Connection,
    error::HandlerError,
    permission::PermissionLevel,
    rate::RatePolicy,
};
use bytes::Bytes;
use tidegate_proto::Packet;

/// What a handler produced, routed by the dispatcher.
///
/// The tagged variant replaces return-type reflection: matching is a single
/// branch.
#[derive(Debug)]
pub enum HandlerReply {
    /// No outbound reply.
    None,
    /// Raw pre-encoded packet bytes, framed and sent as-is.
    Bytes(Bytes),
    /// Text sent as an opcode-0 string packet.
    Text(String),
    /// A packet: compressed, encrypted with the connection's secret and
    /// suite, then sent.
    Packet(Packet),
}

/// An opcode handler.
#[async_trait]
pub trait PacketHandler: Send + Sync {
    /// Handle one packet from one connection.
    async fn handle(
        &self,
        packet: Packet,
        conn: Arc<Connection>,
    ) -> Result<HandlerReply, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> PacketHandler for FnHandler<F>
where
    F: Fn(Packet, Arc<Connection>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<HandlerReply, HandlerError>> + Send,
{
    async fn handle(
        &self,
        packet: Packet,
        conn: Arc<Connection>,
    ) -> Result<HandlerReply, HandlerError> {
        (self.0)(packet, conn).await
    }
}

/// Wrap an async function as a [`PacketHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn PacketHandler>
where
    F: Fn(Packet, Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerReply, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Whether a handler accepts encrypted and/or plaintext packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionPolicy {
    /// Either form is accepted.
    #[default]
    Any,
    /// The packet must arrive encrypted.
    Required,
    /// The packet must arrive in plaintext.
    Forbidden,
}

/// A handler registration: opcode, handler, and policy bundle.
///
/// Built fluently and frozen into a [`HandlerDescriptor`] at registration.
#[derive(Clone)]
pub struct HandlerRegistration {
    pub(crate) opcode: u16,
    handler: Arc<dyn PacketHandler>,
    timeout: Option<Duration>,
    rate: Option<RatePolicy>,
    permission: Option<PermissionLevel>,
    encryption: EncryptionPolicy,
}

impl HandlerRegistration {
    /// Register `handler` for `opcode` with no policies.
    #[must_use]
    pub fn new(opcode: u16, handler: Arc<dyn PacketHandler>) -> Self {
        Self {
            opcode,
            handler,
            timeout: None,
            rate: None,
            permission: None,
            encryption: EncryptionPolicy::default(),
        }
    }

    /// Bound handler execution time.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Rate-limit dispatches per remote endpoint.
    #[must_use]
    pub fn with_rate_limit(mut self, policy: RatePolicy) -> Self {
        self.rate = Some(policy);
        self
    }

    /// Require a minimum permission level.
    #[must_use]
    pub fn with_permission(mut self, level: PermissionLevel) -> Self {
        self.permission = Some(level);
        self
    }

    /// Require packets to arrive encrypted.
    #[must_use]
    pub fn require_encryption(mut self) -> Self {
        self.encryption = EncryptionPolicy::Required;
        self
    }

    /// Require packets to arrive in plaintext.
    #[must_use]
    pub fn require_plaintext(mut self) -> Self {
        self.encryption = EncryptionPolicy::Forbidden;
        self
    }

    pub(crate) fn into_descriptor(self) -> HandlerDescriptor {
        HandlerDescriptor {
            opcode: self.opcode,
            handler: self.handler,
            timeout: self.timeout,
            rate: self.rate,
            permission: self.permission,
            encryption: self.encryption,
        }
    }
}

impl std::fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("opcode", &format!("{:#06x}", self.opcode))
            .field("timeout", &self.timeout)
            .field("permission", &self.permission)
            .field("encryption", &self.encryption)
            .finish_non_exhaustive()
    }
}

/// A group of handler registrations applied atomically.
///
/// The registration-time analog of an annotated controller type: either
/// every handler in the controller registers, or (on a duplicate opcode)
/// none do.
pub trait PacketController: Send + Sync {
    /// The registrations this controller contributes.
    fn registrations(&self) -> Vec<HandlerRegistration>;
}

/// Immutable per-opcode handler metadata.
///
/// Created once at registration and never mutated; the dispatcher clones the
/// `Arc` per dispatch.
pub struct HandlerDescriptor {
    opcode: u16,
    handler: Arc<dyn PacketHandler>,
    timeout: Option<Duration>,
    rate: Option<RatePolicy>,
    permission: Option<PermissionLevel>,
    encryption: EncryptionPolicy,
}

impl HandlerDescriptor {
    /// The opcode this descriptor serves.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    /// Execution timeout, if bounded.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Rate policy, if any.
    #[must_use]
    pub fn rate_policy(&self) -> Option<&RatePolicy> {
        self.rate.as_ref()
    }

    /// Minimum permission level, if any.
    #[must_use]
    pub fn required_permission(&self) -> Option<PermissionLevel> {
        self.permission
    }

    /// Encryption requirement.
    #[must_use]
    pub fn encryption_policy(&self) -> EncryptionPolicy {
        self.encryption
    }

    /// The handler itself.
    #[must_use]
    pub fn handler(&self) -> &Arc<dyn PacketHandler> {
        &self.handler
    }
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("opcode", &format!("{:#06x}", self.opcode))
            .field("timeout", &self.timeout)
            .field("rate", &self.rate)
            .field("permission", &self.permission)
            .field("encryption", &self.encryption)
            .finish_non_exhaustive()
    }
}
