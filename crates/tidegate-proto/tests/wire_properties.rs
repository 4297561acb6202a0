//! Property-based tests for packet and directive wire formats.
//!
//! These verify that serialization is correct for ALL valid inputs, not just
//! specific examples, and that the bit-stable layouts never drift.

use proptest::prelude::*;
use tidegate_proto::{
    ControlDirective, DirectiveFlags, Packet, PacketHeader, ProtocolAction, ProtocolReason,
};

/// Strategy for generating arbitrary reasons
fn arbitrary_reason() -> impl Strategy<Value = ProtocolReason> {
    prop_oneof![
        Just(ProtocolReason::RateLimited),
        Just(ProtocolReason::Timeout),
        Just(ProtocolReason::RequestInvalid),
        Just(ProtocolReason::AccountLocked),
        Just(ProtocolReason::OperationUnsupported),
        Just(ProtocolReason::NetworkError),
        Just(ProtocolReason::InternalError),
        Just(ProtocolReason::EncryptionMismatch),
    ]
}

/// Strategy for generating arbitrary actions
fn arbitrary_action() -> impl Strategy<Value = ProtocolAction> {
    prop_oneof![
        Just(ProtocolAction::None),
        Just(ProtocolAction::Retry),
        Just(ProtocolAction::FixAndRetry),
    ]
}

proptest! {
    #[test]
    fn packet_round_trip(
        opcode in any::<u16>(),
        sequence in any::<u32>(),
        payload in prop::collection::vec(any::<u8>(), 0..4096),
    ) {
        let packet = Packet::sequenced(opcode, sequence, payload);

        let mut wire = Vec::new();
        packet.encode(&mut wire).unwrap();
        prop_assert_eq!(wire.len(), packet.wire_len());

        let parsed = Packet::decode(&wire).unwrap();
        prop_assert_eq!(&parsed, &packet);
        prop_assert_eq!(parsed.opcode(), opcode);
        prop_assert_eq!(parsed.sequence_id(), sequence);
    }

    #[test]
    fn directive_round_trip(
        reason in arbitrary_reason(),
        action in arbitrary_action(),
        transient in any::<bool>(),
        sequence in any::<u32>(),
        arg0 in any::<u32>(),
        arg1 in any::<u32>(),
        arg2 in any::<u16>(),
    ) {
        let flags = if transient { DirectiveFlags::IS_TRANSIENT } else { DirectiveFlags::NONE };
        let directive = ControlDirective::fail(reason, action, flags, sequence)
            .with_arg0(arg0)
            .with_arg1(arg1)
            .with_arg2(arg2);

        let parsed = ControlDirective::from_bytes(&directive.to_bytes()).unwrap();

        prop_assert_eq!(parsed, directive);
        prop_assert_eq!(parsed.reason(), Some(reason));
        prop_assert_eq!(parsed.action(), Some(action));
        prop_assert_eq!(parsed.flags().is_transient(), transient);
        prop_assert_eq!(parsed.sequence_id(), sequence);
        prop_assert_eq!((parsed.arg0(), parsed.arg1(), parsed.arg2()), (arg0, arg1, arg2));
    }

    #[test]
    fn directive_packet_embedding(
        reason in arbitrary_reason(),
        sequence in any::<u32>(),
    ) {
        let packet = ControlDirective::fail(
            reason,
            ProtocolAction::Retry,
            DirectiveFlags::NONE,
            sequence,
        )
        .into_packet();

        prop_assert_eq!(packet.opcode(), tidegate_proto::OPCODE_CONTROL);
        prop_assert_eq!(packet.sequence_id(), sequence);

        let mut wire = Vec::new();
        packet.encode(&mut wire).unwrap();
        let reparsed = Packet::decode(&wire).unwrap();
        let directive = ControlDirective::from_bytes(&reparsed.payload).unwrap();
        prop_assert_eq!(directive.reason(), Some(reason));
    }

    #[test]
    fn header_parse_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        // Arbitrary input must produce Ok or Err, never a panic.
        let _ = PacketHeader::from_bytes(&bytes);
        let _ = Packet::decode(&bytes);
        let _ = ControlDirective::from_bytes(&bytes);
    }
}
