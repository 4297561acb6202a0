//! Control directive: the server-originated fail/notice message.
//!
//! When a dispatch cannot proceed (rate limited, permission denied, handler
//! error) the peer receives a fixed 21-byte directive identifying what went
//! wrong and what to do about it. The layout is bit-exact and little-endian;
//! field widths and ordering must never change:
//!
//! ```text
//! control_type:u8  reason:u16  action:u16  flags:u16
//! sequence_id:u32  arg0:u32    arg1:u32    arg2:u16
//! ```
//!
//! `sequence_id` echoes the inbound packet's sequence when it carried one;
//! zero means server-initiated / no correlation. `arg0..arg2` are
//! reason-specific (the rate-limited path puts the violating opcode in
//! `arg0`).

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    CONTROL_TYPE_FAIL, OPCODE_CONTROL, Packet,
    errors::{ProtocolError, Result},
};

/// Why a dispatch failed.
///
/// Wire values are stable; new reasons append, never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProtocolReason {
    /// Per-remote rate limit exceeded.
    RateLimited = 1,
    /// Handler exceeded its descriptor timeout or the dispatch was
    /// cancelled.
    Timeout = 2,
    /// Malformed or invalid request.
    RequestInvalid = 3,
    /// Caller lacks the required permission level.
    AccountLocked = 4,
    /// Operation not supported by this server.
    OperationUnsupported = 5,
    /// Socket or I/O failure while handling the request.
    NetworkError = 6,
    /// Unclassified server-side failure.
    InternalError = 7,
    /// Packet encryption state did not match the handler's requirement.
    EncryptionMismatch = 8,
}

impl ProtocolReason {
    /// Wire value.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a wire value. `None` if unrecognized.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::RateLimited),
            2 => Some(Self::Timeout),
            3 => Some(Self::RequestInvalid),
            4 => Some(Self::AccountLocked),
            5 => Some(Self::OperationUnsupported),
            6 => Some(Self::NetworkError),
            7 => Some(Self::InternalError),
            8 => Some(Self::EncryptionMismatch),
            _ => None,
        }
    }
}

/// What the peer should do about a failed dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ProtocolAction {
    /// Nothing; the request will not succeed as sent.
    None = 0,
    /// Retry the same request later.
    Retry = 1,
    /// Correct the request before retrying.
    FixAndRetry = 2,
}

impl ProtocolAction {
    /// Wire value.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Parse a wire value. `None` if unrecognized.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            1 => Some(Self::Retry),
            2 => Some(Self::FixAndRetry),
            _ => None,
        }
    }
}

/// Directive flags bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirectiveFlags(u16);

impl DirectiveFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// The failure is transient; an identical retry may succeed.
    pub const IS_TRANSIENT: Self = Self(0b0000_0001);

    /// Construct from a raw wire value.
    #[must_use]
    pub fn from_u16(value: u16) -> Self {
        Self(value)
    }

    /// Raw wire value.
    #[must_use]
    pub fn to_u16(self) -> u16 {
        self.0
    }

    /// Whether the transient bit is set.
    #[must_use]
    pub fn is_transient(self) -> bool {
        self.0 & Self::IS_TRANSIENT.0 != 0
    }
}

/// The 21-byte control directive.
///
/// Stored as raw little-endian byte arrays (packed, zerocopy) so encoding is
/// a memcpy and decoding never allocates.
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct ControlDirective {
    control_type: u8,
    reason: [u8; 2],
    action: [u8; 2],
    flags: [u8; 2],
    sequence_id: [u8; 4],
    arg0: [u8; 4],
    arg1: [u8; 4],
    arg2: [u8; 2],
}

impl ControlDirective {
    /// Size of the serialized directive (21 bytes).
    pub const SIZE: usize = 21;

    /// Create a fail directive.
    ///
    /// `sequence_id` should echo the inbound packet's sequence id, or zero
    /// for server-initiated directives.
    #[must_use]
    pub fn fail(
        reason: ProtocolReason,
        action: ProtocolAction,
        flags: DirectiveFlags,
        sequence_id: u32,
    ) -> Self {
        Self {
            control_type: CONTROL_TYPE_FAIL,
            reason: reason.to_u16().to_le_bytes(),
            action: action.to_u16().to_le_bytes(),
            flags: flags.to_u16().to_le_bytes(),
            sequence_id: sequence_id.to_le_bytes(),
            arg0: [0; 4],
            arg1: [0; 4],
            arg2: [0; 2],
        }
    }

    /// Copy with `arg0` set.
    #[must_use]
    pub fn with_arg0(mut self, arg0: u32) -> Self {
        self.arg0 = arg0.to_le_bytes();
        self
    }

    /// Copy with `arg1` set.
    #[must_use]
    pub fn with_arg1(mut self, arg1: u32) -> Self {
        self.arg1 = arg1.to_le_bytes();
        self
    }

    /// Copy with `arg2` set.
    #[must_use]
    pub fn with_arg2(mut self, arg2: u16) -> Self {
        self.arg2 = arg2.to_le_bytes();
        self
    }

    /// Control-type discriminant (always [`CONTROL_TYPE_FAIL`] for
    /// directives built with [`ControlDirective::fail`]).
    #[must_use]
    pub fn control_type(&self) -> u8 {
        self.control_type
    }

    /// Reason code. `None` if the wire value is unrecognized.
    #[must_use]
    pub fn reason(&self) -> Option<ProtocolReason> {
        ProtocolReason::from_u16(u16::from_le_bytes(self.reason))
    }

    /// Raw reason wire value.
    #[must_use]
    pub fn reason_raw(&self) -> u16 {
        u16::from_le_bytes(self.reason)
    }

    /// Suggested action. `None` if the wire value is unrecognized.
    #[must_use]
    pub fn action(&self) -> Option<ProtocolAction> {
        ProtocolAction::from_u16(u16::from_le_bytes(self.action))
    }

    /// Directive flags.
    #[must_use]
    pub fn flags(&self) -> DirectiveFlags {
        DirectiveFlags::from_u16(u16::from_le_bytes(self.flags))
    }

    /// Echoed sequence id (zero = no correlation).
    #[must_use]
    pub fn sequence_id(&self) -> u32 {
        u32::from_le_bytes(self.sequence_id)
    }

    /// Reason-specific argument 0.
    #[must_use]
    pub fn arg0(&self) -> u32 {
        u32::from_le_bytes(self.arg0)
    }

    /// Reason-specific argument 1.
    #[must_use]
    pub fn arg1(&self) -> u32 {
        u32::from_le_bytes(self.arg1)
    }

    /// Reason-specific argument 2.
    #[must_use]
    pub fn arg2(&self) -> u16 {
        u16::from_le_bytes(self.arg2)
    }

    /// Serialize to the 21-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Parse a directive from an opcode-0 payload.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::DirectiveTooShort`] if fewer than 21 bytes
    /// - [`ProtocolError::InvalidControlType`] if the first byte is not the
    ///   fail discriminant
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let directive = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::DirectiveTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if directive.control_type != CONTROL_TYPE_FAIL {
            return Err(ProtocolError::InvalidControlType(directive.control_type));
        }

        Ok(*directive)
    }

    /// Wrap the directive in an opcode-0 packet ready to send.
    #[must_use]
    pub fn into_packet(self) -> Packet {
        let mut packet = Packet::new(OPCODE_CONTROL, self.to_bytes().to_vec());
        packet.header.set_sequence_id(self.sequence_id());
        packet
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for ControlDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlDirective")
            .field("control_type", &self.control_type)
            .field("reason", &self.reason())
            .field("action", &self.action())
            .field("flags", &self.flags())
            .field("sequence_id", &self.sequence_id())
            .field("arg0", &self.arg0())
            .finish_non_exhaustive()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for ControlDirective {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for ControlDirective {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_size() {
        assert_eq!(std::mem::size_of::<ControlDirective>(), ControlDirective::SIZE);
        assert_eq!(ControlDirective::SIZE, 21);
    }

    #[test]
    fn fail_directive_round_trip() {
        let directive = ControlDirective::fail(
            ProtocolReason::RateLimited,
            ProtocolAction::Retry,
            DirectiveFlags::IS_TRANSIENT,
            0xDEAD_BEEF,
        )
        .with_arg0(0x0010)
        .with_arg2(3);

        let bytes = directive.to_bytes();
        let parsed = ControlDirective::from_bytes(&bytes).unwrap();

        assert_eq!(parsed, directive);
        assert_eq!(parsed.reason(), Some(ProtocolReason::RateLimited));
        assert_eq!(parsed.action(), Some(ProtocolAction::Retry));
        assert!(parsed.flags().is_transient());
        assert_eq!(parsed.sequence_id(), 0xDEAD_BEEF);
        assert_eq!(parsed.arg0(), 0x0010);
        assert_eq!(parsed.arg2(), 3);
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let directive = ControlDirective::fail(
            ProtocolReason::Timeout,
            ProtocolAction::Retry,
            DirectiveFlags::IS_TRANSIENT,
            0x0102_0304,
        );
        let bytes = directive.to_bytes();

        assert_eq!(bytes[0], CONTROL_TYPE_FAIL);
        assert_eq!(bytes[1..3], [0x02, 0x00]); // reason = Timeout = 2
        assert_eq!(bytes[3..5], [0x01, 0x00]); // action = Retry = 1
        assert_eq!(bytes[5..7], [0x01, 0x00]); // flags = IS_TRANSIENT
        assert_eq!(bytes[7..11], [0x04, 0x03, 0x02, 0x01]); // sequence_id
    }

    #[test]
    fn reject_short_directive() {
        let result = ControlDirective::from_bytes(&[CONTROL_TYPE_FAIL; 12]);
        assert!(matches!(result, Err(ProtocolError::DirectiveTooShort { .. })));
    }

    #[test]
    fn reject_wrong_control_type() {
        let mut bytes = ControlDirective::fail(
            ProtocolReason::InternalError,
            ProtocolAction::None,
            DirectiveFlags::NONE,
            0,
        )
        .to_bytes();
        bytes[0] = 0x77;

        let result = ControlDirective::from_bytes(&bytes);
        assert_eq!(result, Err(ProtocolError::InvalidControlType(0x77)));
    }

    #[test]
    fn into_packet_carries_sequence() {
        let directive = ControlDirective::fail(
            ProtocolReason::AccountLocked,
            ProtocolAction::None,
            DirectiveFlags::NONE,
            42,
        );
        let packet = directive.into_packet();

        assert_eq!(packet.opcode(), OPCODE_CONTROL);
        assert_eq!(packet.sequence_id(), 42);

        let parsed = ControlDirective::from_bytes(&packet.payload).unwrap();
        assert_eq!(parsed.reason(), Some(ProtocolReason::AccountLocked));
    }

    #[test]
    fn unknown_reason_parses_as_none() {
        let mut bytes = ControlDirective::fail(
            ProtocolReason::Timeout,
            ProtocolAction::None,
            DirectiveFlags::NONE,
            0,
        )
        .to_bytes();
        bytes[1] = 0xFF;
        bytes[2] = 0xFF;

        let parsed = ControlDirective::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.reason(), None);
        assert_eq!(parsed.reason_raw(), 0xFFFF);
    }
}
