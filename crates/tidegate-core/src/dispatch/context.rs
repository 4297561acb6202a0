//! Pooled per-dispatch context.
//!
//! One context is rented per dispatched packet and returned when the
//! dispatch settles, on every exit path. It carries the packet, the owning
//! connection, the descriptor's policy bundle, the skip-outbound flag, and
//! the adapted outbound frame for the post chain. Contexts must not escape
//! the dispatch scope - middleware receive a mutable borrow, never the
//! context itself.

use std::sync::Arc;

use bytes::Bytes;

use super::descriptor::HandlerDescriptor;
use crate::connection::Connection;
use tidegate_proto::Packet;

/// Adapted outbound frame awaiting the send stage.
#[derive(Debug)]
pub enum Outbound {
    /// Raw pre-encoded packet bytes.
    Raw(Bytes),
    /// A packet to encode and send.
    Packet(Packet),
}

/// Mutable state threaded through one dispatch.
#[derive(Default)]
pub struct DispatchContext {
    packet: Option<Packet>,
    connection: Option<Arc<Connection>>,
    descriptor: Option<Arc<HandlerDescriptor>>,

    /// When set, the send stage transmits nothing.
    pub skip_outbound: bool,

    /// The adapted reply, if the handler produced one.
    pub outbound: Option<Outbound>,
}

impl DispatchContext {
    /// Create an empty context (pool use).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the context for one dispatch.
    pub(crate) fn init(
        &mut self,
        packet: Packet,
        connection: Arc<Connection>,
        descriptor: Arc<HandlerDescriptor>,
    ) {
        self.packet = Some(packet);
        self.connection = Some(connection);
        self.descriptor = Some(descriptor);
        self.skip_outbound = false;
        self.outbound = None;
    }

    /// Clear everything before returning to the pool.
    pub(crate) fn reset(&mut self) {
        self.packet = None;
        self.connection = None;
        self.descriptor = None;
        self.skip_outbound = false;
        self.outbound = None;
    }

    /// The packet under dispatch.
    #[must_use]
    pub fn packet(&self) -> Option<&Packet> {
        self.packet.as_ref()
    }

    /// Replace the packet (decrypt/decompress stages).
    pub fn set_packet(&mut self, packet: Packet) {
        self.packet = Some(packet);
    }

    /// The owning connection.
    #[must_use]
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.connection.as_ref()
    }

    /// The descriptor's policy bundle.
    #[must_use]
    pub fn descriptor(&self) -> Option<&Arc<HandlerDescriptor>> {
        self.descriptor.as_ref()
    }

    /// Sequence id of the inbound packet (zero when unsequenced or empty).
    #[must_use]
    pub fn sequence_id(&self) -> u32 {
        self.packet.as_ref().map_or(0, Packet::sequence_id)
    }
}

impl std::fmt::Debug for DispatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchContext")
            .field("opcode", &self.packet.as_ref().map(Packet::opcode))
            .field("skip_outbound", &self.skip_outbound)
            .finish_non_exhaustive()
    }
}
