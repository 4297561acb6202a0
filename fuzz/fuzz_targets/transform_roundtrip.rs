//! Fuzz target for the packet compress/decompress transformers.
//!
//! Compression followed by decompression must reproduce the payload for any
//! input, and decompression of arbitrary garbage must fail cleanly rather
//! than panic or over-allocate.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tidegate_proto::{Packet, PacketFlags};

#[derive(Arbitrary, Debug)]
struct Input {
    opcode: u16,
    sequence: u32,
    payload: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let packet = Packet::sequenced(input.opcode, input.sequence, input.payload.clone());

    let squeezed = packet.compressed().expect("plain packet must compress");
    let restored = squeezed
        .decompressed(input.payload.len().max(1))
        .expect("own compression output must decompress within its original size");
    assert_eq!(&restored.payload[..], &input.payload[..]);

    // Arbitrary bytes flagged as compressed must never panic the inflater.
    let mut header = packet.header;
    header.set_flags(PacketFlags::default().with_compressed(true));
    let garbage = Packet { header, payload: bytes::Bytes::from(input.payload) };
    let _ = garbage.decompressed(1 << 16);
});
