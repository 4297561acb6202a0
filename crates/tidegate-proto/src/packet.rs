//! Packet header and packet type with zero-copy parsing.
//!
//! A packet is an 8-byte little-endian header followed by an opaque payload.
//! The header is the only structure the runtime interprets: it carries the
//! opcode used for handler routing, a flags byte recording which transforms
//! have been applied, and an optional sequence id echoed back in replies.
//!
//! On the wire each packet is preceded by a 4-byte little-endian length
//! prefix (see the crate docs); this module deals with the bytes after that
//! prefix.

use std::io::Read;

use bytes::{BufMut, Bytes};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
    CONTROL_TYPE_TEXT, OPCODE_CONTROL,
    errors::{ProtocolError, Result},
};

/// Transform flags carried in the packet header.
///
/// Bit 0 records symmetric encryption, bit 1 records payload compression.
/// The dispatcher consults the encrypted bit to enforce per-handler
/// encryption policy; the remaining bits are reserved and must be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketFlags(u8);

impl PacketFlags {
    /// Payload has been encrypted with the connection's secret.
    pub const ENCRYPTED: u8 = 0b0000_0001;
    /// Payload has been compressed.
    pub const COMPRESSED: u8 = 0b0000_0010;

    /// Construct from a raw flags byte.
    #[must_use]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw flags byte.
    #[must_use]
    pub fn to_byte(self) -> u8 {
        self.0
    }

    /// Whether the encrypted bit is set.
    #[must_use]
    pub fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    /// Whether the compressed bit is set.
    #[must_use]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Copy with the encrypted bit set or cleared.
    #[must_use]
    pub fn with_encrypted(self, on: bool) -> Self {
        if on { Self(self.0 | Self::ENCRYPTED) } else { Self(self.0 & !Self::ENCRYPTED) }
    }

    /// Copy with the compressed bit set or cleared.
    #[must_use]
    pub fn with_compressed(self, on: bool) -> Self {
        if on { Self(self.0 | Self::COMPRESSED) } else { Self(self.0 & !Self::COMPRESSED) }
    }
}

/// Fixed 8-byte packet header (little-endian).
///
/// Fields are stored as raw byte arrays to avoid alignment issues; all
/// multi-byte integers are little-endian. The `#[repr(C, packed)]` layout
/// with zerocopy traits ensures the struct can be cast from untrusted
/// network bytes without undefined behavior - every 8-byte pattern parses,
/// and validation happens explicitly in [`PacketHeader::from_bytes`].
///
/// # Invariants
///
/// - The reserved byte is zero on every valid header. [`from_bytes`] rejects
///   non-zero values so future protocol revisions can claim the byte.
/// - `sequence_id == 0` means "no sequence"; replies to unsequenced packets
///   carry zero in the directive's correlation field.
///
/// [`from_bytes`]: PacketHeader::from_bytes
#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PacketHeader {
    pub(crate) opcode: [u8; 2],
    flags: u8,
    reserved: u8,
    pub(crate) sequence_id: [u8; 4],
}

impl PacketHeader {
    /// Size of the serialized header (8 bytes).
    pub const SIZE: usize = 8;

    /// Absolute payload cap (16 MiB). Channels usually configure a lower
    /// per-connection maximum; this is the protocol ceiling.
    pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

    /// Create a header for the given opcode with no sequence and no flags.
    #[must_use]
    pub fn new(opcode: u16) -> Self {
        Self { opcode: opcode.to_le_bytes(), flags: 0, reserved: 0, sequence_id: [0; 4] }
    }

    /// Parse a header from the start of `bytes`.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::PacketTooShort`] if fewer than 8 bytes
    /// - [`ProtocolError::ReservedByteSet`] if the reserved byte is non-zero
    pub fn from_bytes(bytes: &[u8]) -> Result<&Self> {
        let header = Self::ref_from_prefix(bytes)
            .map_err(|_| ProtocolError::PacketTooShort {
                expected: Self::SIZE,
                actual: bytes.len(),
            })?
            .0;

        if header.reserved != 0 {
            return Err(ProtocolError::ReservedByteSet(header.reserved));
        }

        Ok(header)
    }

    /// Serialize the header to its 8-byte wire form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let bytes = IntoBytes::as_bytes(self);
        let mut arr = [0u8; Self::SIZE];
        arr.copy_from_slice(bytes);
        arr
    }

    /// Operation code selecting the handler.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        u16::from_le_bytes(self.opcode)
    }

    /// Transform flags.
    #[must_use]
    pub fn flags(&self) -> PacketFlags {
        PacketFlags::from_byte(self.flags)
    }

    /// Sequence id for request/response correlation. Zero means "none".
    #[must_use]
    pub fn sequence_id(&self) -> u32 {
        u32::from_le_bytes(self.sequence_id)
    }

    /// Update the opcode.
    pub fn set_opcode(&mut self, opcode: u16) {
        self.opcode = opcode.to_le_bytes();
    }

    /// Update the transform flags.
    pub fn set_flags(&mut self, flags: PacketFlags) {
        self.flags = flags.to_byte();
    }

    /// Update the sequence id.
    pub fn set_sequence_id(&mut self, sequence_id: u32) {
        self.sequence_id = sequence_id.to_le_bytes();
    }
}

// Manual Debug implementation (can't derive due to packed repr)
impl std::fmt::Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketHeader")
            .field("opcode", &format!("{:#06x}", self.opcode()))
            .field("flags", &self.flags())
            .field("sequence_id", &self.sequence_id())
            .finish()
    }
}

// Manual PartialEq implementation (can't derive due to packed repr)
impl PartialEq for PacketHeader {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PacketHeader {}

/// A packet: header plus opaque payload bytes.
///
/// The runtime routes on the header and treats the payload as an immutable
/// buffer lease. Transform state (encrypted, compressed) lives in the header
/// flags so the dispatcher can check policy without touching the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header (8 bytes on the wire)
    pub header: PacketHeader,

    /// Opaque payload bytes
    pub payload: Bytes,
}

impl Packet {
    /// Create a packet for `opcode` with the given payload.
    #[must_use]
    pub fn new(opcode: u16, payload: impl Into<Bytes>) -> Self {
        Self { header: PacketHeader::new(opcode), payload: payload.into() }
    }

    /// Create a sequenced packet.
    #[must_use]
    pub fn sequenced(opcode: u16, sequence_id: u32, payload: impl Into<Bytes>) -> Self {
        let mut header = PacketHeader::new(opcode);
        header.set_sequence_id(sequence_id);
        Self { header, payload: payload.into() }
    }

    /// Create an opcode-0 text packet carrying a UTF-8 string.
    #[must_use]
    pub fn text(sequence_id: u32, text: &str) -> Self {
        let mut payload = Vec::with_capacity(1 + text.len());
        payload.push(CONTROL_TYPE_TEXT);
        payload.extend_from_slice(text.as_bytes());

        let mut header = PacketHeader::new(OPCODE_CONTROL);
        header.set_sequence_id(sequence_id);
        Self { header, payload: Bytes::from(payload) }
    }

    /// Extract the string from a text packet.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InvalidControlType`] if this is not a text packet
    /// - [`ProtocolError::InvalidUtf8`] if the body is not valid UTF-8
    pub fn as_text(&self) -> Result<&str> {
        let Some((&control_type, body)) = self.payload.split_first() else {
            return Err(ProtocolError::PacketTooShort { expected: 1, actual: 0 });
        };
        if self.header.opcode() != OPCODE_CONTROL || control_type != CONTROL_TYPE_TEXT {
            return Err(ProtocolError::InvalidControlType(control_type));
        }
        std::str::from_utf8(body).map_err(|_| ProtocolError::InvalidUtf8)
    }

    /// Opcode from the header.
    #[must_use]
    pub fn opcode(&self) -> u16 {
        self.header.opcode()
    }

    /// Sequence id from the header. Zero means "none".
    #[must_use]
    pub fn sequence_id(&self) -> u32 {
        self.header.sequence_id()
    }

    /// Whether the payload is encrypted.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.header.flags().is_encrypted()
    }

    /// Whether the payload is compressed.
    #[must_use]
    pub fn is_compressed(&self) -> bool {
        self.header.flags().is_compressed()
    }

    /// Serialized length (header + payload).
    #[must_use]
    pub fn wire_len(&self) -> usize {
        PacketHeader::SIZE + self.payload.len()
    }

    /// Encode into `dst` (header + payload; the frame length prefix is the
    /// channel's concern).
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::PayloadTooLarge`] if the payload exceeds the
    ///   protocol cap
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > PacketHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: PacketHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decode a packet from a whole frame body.
    ///
    /// The payload is everything after the header; trailing garbage cannot
    /// exist because the frame length bounds `bytes` exactly.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::PacketTooShort`] if fewer than 8 bytes
    /// - [`ProtocolError::ReservedByteSet`] if the reserved byte is non-zero
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = *PacketHeader::from_bytes(bytes)?;

        // INVARIANT: from_bytes succeeded, so bytes.len() >= SIZE.
        let payload = Bytes::copy_from_slice(bytes.get(PacketHeader::SIZE..).unwrap_or(&[]));

        Ok(Self { header, payload })
    }

    /// Compress the payload (DEFLATE) and set the compressed flag.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InvalidTransform`] if already compressed
    /// - [`ProtocolError::Compression`] on encoder failure
    pub fn compressed(&self) -> Result<Self> {
        if self.is_compressed() {
            return Err(ProtocolError::InvalidTransform("packet is already compressed"));
        }

        let mut encoder =
            flate2::read::DeflateEncoder::new(&self.payload[..], flate2::Compression::fast());
        let mut out = Vec::with_capacity(self.payload.len() / 2 + 16);
        encoder
            .read_to_end(&mut out)
            .map_err(|e| ProtocolError::Compression(e.to_string()))?;

        let mut header = self.header;
        header.set_flags(self.header.flags().with_compressed(true));
        Ok(Self { header, payload: Bytes::from(out) })
    }

    /// Decompress the payload and clear the compressed flag.
    ///
    /// `max_len` bounds the inflated size; a payload that inflates past it
    /// is rejected rather than allocated.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::InvalidTransform`] if not compressed
    /// - [`ProtocolError::PayloadTooLarge`] if the inflated payload exceeds
    ///   `max_len`
    /// - [`ProtocolError::Compression`] on corrupt input
    pub fn decompressed(&self, max_len: usize) -> Result<Self> {
        if !self.is_compressed() {
            return Err(ProtocolError::InvalidTransform("packet is not compressed"));
        }

        let decoder = flate2::read::DeflateDecoder::new(&self.payload[..]);
        let mut out = Vec::new();
        let limit = max_len as u64 + 1;
        decoder
            .take(limit)
            .read_to_end(&mut out)
            .map_err(|e| ProtocolError::Compression(e.to_string()))?;

        if out.len() > max_len {
            return Err(ProtocolError::PayloadTooLarge { size: out.len(), max: max_len });
        }

        let mut header = self.header;
        header.set_flags(self.header.flags().with_compressed(false));
        Ok(Self { header, payload: Bytes::from(out) })
    }

    /// Replace the payload with its encrypted form and set the encrypted
    /// flag. The cipher itself lives behind the core's `Cipher` capability;
    /// this only records the transform.
    #[must_use]
    pub fn with_encrypted_payload(&self, ciphertext: impl Into<Bytes>) -> Self {
        let mut header = self.header;
        header.set_flags(self.header.flags().with_encrypted(true));
        Self { header, payload: ciphertext.into() }
    }

    /// Replace the payload with its decrypted form and clear the encrypted
    /// flag.
    #[must_use]
    pub fn with_decrypted_payload(&self, plaintext: impl Into<Bytes>) -> Self {
        let mut header = self.header;
        header.set_flags(self.header.flags().with_encrypted(false));
        Self { header, payload: plaintext.into() }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn header_size() {
        assert_eq!(std::mem::size_of::<PacketHeader>(), PacketHeader::SIZE);
        assert_eq!(PacketHeader::SIZE, 8);
    }

    #[test]
    fn header_layout_is_little_endian() {
        let mut header = PacketHeader::new(0x1234);
        header.set_sequence_id(0xAABB_CCDD);
        header.set_flags(PacketFlags::from_byte(PacketFlags::ENCRYPTED));

        let bytes = header.to_bytes();
        assert_eq!(bytes[0..2], [0x34, 0x12]);
        assert_eq!(bytes[2], 0x01);
        assert_eq!(bytes[3], 0x00);
        assert_eq!(bytes[4..8], [0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn reject_reserved_byte() {
        let mut bytes = PacketHeader::new(7).to_bytes();
        bytes[3] = 0x42;
        let result = PacketHeader::from_bytes(&bytes);
        assert_eq!(result, Err(ProtocolError::ReservedByteSet(0x42)));
    }

    #[test]
    fn reject_short_buffer() {
        let result = PacketHeader::from_bytes(&[0u8; 5]);
        assert_eq!(result, Err(ProtocolError::PacketTooShort { expected: 8, actual: 5 }));
    }

    #[test]
    fn encode_decode_round_trip() {
        let packet = Packet::sequenced(0x0001, 99, vec![1u8, 2, 3]);

        let mut wire = Vec::new();
        packet.encode(&mut wire).unwrap();
        assert_eq!(wire.len(), packet.wire_len());

        let parsed = Packet::decode(&wire).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.opcode(), 0x0001);
        assert_eq!(parsed.sequence_id(), 99);
    }

    #[test]
    fn empty_payload_round_trip() {
        let packet = Packet::new(42, Vec::new());
        let mut wire = Vec::new();
        packet.encode(&mut wire).unwrap();
        assert_eq!(wire.len(), 8);

        let parsed = Packet::decode(&wire).unwrap();
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn compress_round_trip() {
        let body: Vec<u8> = std::iter::repeat_n(b"tidegate".as_slice(), 64).flatten().copied().collect();
        let packet = Packet::new(5, body.clone());

        let squeezed = packet.compressed().unwrap();
        assert!(squeezed.is_compressed());
        assert!(squeezed.payload.len() < body.len());

        let restored = squeezed.decompressed(1 << 20).unwrap();
        assert!(!restored.is_compressed());
        assert_eq!(&restored.payload[..], &body[..]);
    }

    #[test]
    fn double_compress_rejected() {
        let packet = Packet::new(5, vec![0u8; 32]).compressed().unwrap();
        assert!(matches!(packet.compressed(), Err(ProtocolError::InvalidTransform(_))));
    }

    #[test]
    fn decompress_respects_limit() {
        let packet = Packet::new(5, vec![0u8; 4096]).compressed().unwrap();
        let result = packet.decompressed(1024);
        assert!(matches!(result, Err(ProtocolError::PayloadTooLarge { .. })));
    }

    #[test]
    fn text_packet_round_trip() {
        let packet = Packet::text(7, "hello");
        assert_eq!(packet.opcode(), OPCODE_CONTROL);
        assert_eq!(packet.sequence_id(), 7);
        assert_eq!(packet.as_text().unwrap(), "hello");
    }

    #[test]
    fn text_extraction_rejects_wrong_type() {
        let packet = Packet::new(OPCODE_CONTROL, vec![0xEE, b'x']);
        assert!(matches!(packet.as_text(), Err(ProtocolError::InvalidControlType(0xEE))));
    }

    #[test]
    fn encrypted_flag_transform() {
        let packet = Packet::new(9, vec![1u8, 2, 3]);
        assert!(!packet.is_encrypted());

        let sealed = packet.with_encrypted_payload(vec![9u8; 19]);
        assert!(sealed.is_encrypted());
        assert_eq!(sealed.opcode(), 9);

        let opened = sealed.with_decrypted_payload(vec![1u8, 2, 3]);
        assert!(!opened.is_encrypted());
        assert_eq!(opened, packet);
    }

    proptest! {
        #[test]
        fn packet_round_trip(
            opcode in any::<u16>(),
            sequence in any::<u32>(),
            payload in prop::collection::vec(any::<u8>(), 0..1024),
        ) {
            let packet = Packet::sequenced(opcode, sequence, payload);

            let mut wire = Vec::new();
            packet.encode(&mut wire).unwrap();

            let parsed = Packet::decode(&wire).unwrap();
            prop_assert_eq!(parsed, packet);
        }

        #[test]
        fn compress_is_lossless(payload in prop::collection::vec(any::<u8>(), 0..2048)) {
            let packet = Packet::new(1, payload.clone());
            let restored = packet.compressed().unwrap().decompressed(1 << 20).unwrap();
            prop_assert_eq!(&restored.payload[..], &payload[..]);
        }
    }
}
