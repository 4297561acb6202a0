//! Fuzz target for Packet::decode
//!
//! Feeds arbitrary byte sequences to the packet parser to find crashes,
//! panics, or inconsistent header accessors. Any input must produce Ok or
//! Err, never a panic, and a successful decode must re-encode losslessly.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tidegate_proto::Packet;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::decode(data) {
        // Accessors must not panic on any decoded packet.
        let _ = packet.opcode();
        let _ = packet.sequence_id();
        let _ = packet.is_encrypted();
        let _ = packet.is_compressed();

        // Re-encode must succeed and reproduce the input bytes.
        let mut wire = Vec::with_capacity(packet.wire_len());
        packet.encode(&mut wire).expect("decoded packet must re-encode");
        assert_eq!(wire, data);
    }
});
