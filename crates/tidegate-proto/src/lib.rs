//! Tidegate wire types.
//!
//! Bit-stable, little-endian representations of everything that crosses the
//! socket: the fixed packet header, the control directive sent on dispatch
//! failures, and the normalized endpoint key used by the rate limiter.
//!
//! The framing rule is defined once, here: every packet on the wire is
//! preceded by a 4-byte little-endian `u32` length prefix counting the packet
//! bytes that follow (header + payload). The receive loop in the channel
//! layer enforces the configured maximum before allocating.
//!
//! Payloads are opaque to this crate. The only structure it knows about is
//! the 8-byte header and, for opcode 0 (reserved), the control-type
//! discriminant in the first payload byte.

pub mod directive;
pub mod endpoint;
pub mod errors;
pub mod packet;

pub use directive::{ControlDirective, DirectiveFlags, ProtocolAction, ProtocolReason};
pub use endpoint::EndpointKey;
pub use errors::{ProtocolError, Result};
pub use packet::{Packet, PacketFlags, PacketHeader};

/// Opcode reserved for control packets (text notices and fail directives).
pub const OPCODE_CONTROL: u16 = 0;

/// Control-type discriminant for a UTF-8 text packet (first payload byte of
/// an opcode-0 packet).
pub const CONTROL_TYPE_TEXT: u8 = 1;

/// Control-type discriminant for a fail directive.
pub const CONTROL_TYPE_FAIL: u8 = 2;

/// Width of the frame length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;
