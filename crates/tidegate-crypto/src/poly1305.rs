//! Poly1305 one-time authenticator (RFC 8439).
//!
//! The key splits into `r` (clamped per RFC 8439 §2.5) and `s`. The message
//! is processed in 16-byte blocks, each extended with a `0x01` byte (at
//! position 16 for full blocks, at the message length for the final short
//! block), accumulated, multiplied by `r`, and reduced modulo 2^130 - 5.
//! After the last block the accumulator is fully reduced, `s` is added
//! modulo 2^128, and the low 16 bytes are the tag, little-endian.
//!
//! Arithmetic uses five 26-bit limbs in `u32` words with `u64` products;
//! reduction folds the bits above 2^130 back in times 5 (2^130 ≡ 5 mod p).
//!
//! # Security
//!
//! Poly1305 keys are one-time: authenticating two messages under the same
//! key forfeits unforgeability. Callers derive a fresh key per protected
//! payload. `r` and `s` are zeroized on drop; tag checks go through the
//! constant-time comparison.

use zeroize::Zeroize;

use crate::{ct::constant_time_eq, error::MacError};

/// Mask keeping the low 26 bits of a limb.
const LIMB_MASK: u32 = 0x03ff_ffff;

/// Poly1305 state: clamped `r` and the final addend `s`.
pub struct Poly1305 {
    /// Clamped multiplier, five 26-bit limbs
    r: [u32; 5],
    /// Final addend, four little-endian words
    s: [u32; 4],
}

impl Poly1305 {
    /// Required key length.
    pub const KEY_SIZE: usize = 32;

    /// Tag length.
    pub const TAG_SIZE: usize = 16;

    /// Create an authenticator from a 32-byte one-time key.
    ///
    /// `key[0..16]` becomes `r` (clamped), `key[16..32]` becomes `s`.
    ///
    /// # Errors
    ///
    /// - [`MacError::InvalidKeySize`] if `key` is not exactly 32 bytes
    pub fn new(key: &[u8]) -> Result<Self, MacError> {
        if key.len() != Self::KEY_SIZE {
            return Err(MacError::InvalidKeySize { expected: Self::KEY_SIZE, actual: key.len() });
        }

        // RFC 8439 clamp, expressed over 26-bit limbs: the top 4 bits of
        // r[3]/r[7]/r[11]/r[15] and the low 2 bits of r[4]/r[8]/r[12] are
        // cleared by these masks.
        let r = [
            load_u32_le(key, 0) & 0x03ff_ffff,
            (load_u32_le(key, 3) >> 2) & 0x03ff_ff03,
            (load_u32_le(key, 6) >> 4) & 0x03ff_c0ff,
            (load_u32_le(key, 9) >> 6) & 0x03f0_3fff,
            (load_u32_le(key, 12) >> 8) & 0x000f_ffff,
        ];

        let s = [
            load_u32_le(key, 16),
            load_u32_le(key, 20),
            load_u32_le(key, 24),
            load_u32_le(key, 28),
        ];

        Ok(Self { r, s })
    }

    /// Compute the 16-byte tag over `msg`.
    #[must_use]
    pub fn compute(&self, msg: &[u8]) -> [u8; Self::TAG_SIZE] {
        let [r0, r1, r2, r3, r4] = self.r;

        // Precomputed r * 5 for the reduction fold
        let s1 = r1.wrapping_mul(5);
        let s2 = r2.wrapping_mul(5);
        let s3 = r3.wrapping_mul(5);
        let s4 = r4.wrapping_mul(5);

        let mut h = [0u32; 5];

        for block in msg.chunks(16) {
            // Extend the block with its pad byte: bit 2^128 for full
            // blocks, the 0x01 at position `len` for the final short block.
            if block.len() == 16 {
                h[0] = h[0].wrapping_add(load_u32_le(block, 0) & LIMB_MASK);
                h[1] = h[1].wrapping_add((load_u32_le(block, 3) >> 2) & LIMB_MASK);
                h[2] = h[2].wrapping_add((load_u32_le(block, 6) >> 4) & LIMB_MASK);
                h[3] = h[3].wrapping_add((load_u32_le(block, 9) >> 6) & LIMB_MASK);
                h[4] = h[4].wrapping_add((load_u32_le(block, 12) >> 8) | (1 << 24));
            } else {
                let mut padded = [0u8; 17];
                padded[..block.len()].copy_from_slice(block);
                padded[block.len()] = 0x01;

                h[0] = h[0].wrapping_add(load_u32_le(&padded, 0) & LIMB_MASK);
                h[1] = h[1].wrapping_add((load_u32_le(&padded, 3) >> 2) & LIMB_MASK);
                h[2] = h[2].wrapping_add((load_u32_le(&padded, 6) >> 4) & LIMB_MASK);
                h[3] = h[3].wrapping_add((load_u32_le(&padded, 9) >> 6) & LIMB_MASK);
                h[4] = h[4].wrapping_add(load_u32_le(&padded, 12) >> 8);
            }

            // h *= r mod 2^130 - 5, schoolbook over limbs with the high
            // limbs folded via the precomputed r*5 values
            let d0 = u64::from(h[0]) * u64::from(r0)
                + u64::from(h[1]) * u64::from(s4)
                + u64::from(h[2]) * u64::from(s3)
                + u64::from(h[3]) * u64::from(s2)
                + u64::from(h[4]) * u64::from(s1);
            let mut d1 = u64::from(h[0]) * u64::from(r1)
                + u64::from(h[1]) * u64::from(r0)
                + u64::from(h[2]) * u64::from(s4)
                + u64::from(h[3]) * u64::from(s3)
                + u64::from(h[4]) * u64::from(s2);
            let mut d2 = u64::from(h[0]) * u64::from(r2)
                + u64::from(h[1]) * u64::from(r1)
                + u64::from(h[2]) * u64::from(r0)
                + u64::from(h[3]) * u64::from(s4)
                + u64::from(h[4]) * u64::from(s3);
            let mut d3 = u64::from(h[0]) * u64::from(r3)
                + u64::from(h[1]) * u64::from(r2)
                + u64::from(h[2]) * u64::from(r1)
                + u64::from(h[3]) * u64::from(r0)
                + u64::from(h[4]) * u64::from(s4);
            let mut d4 = u64::from(h[0]) * u64::from(r4)
                + u64::from(h[1]) * u64::from(r3)
                + u64::from(h[2]) * u64::from(r2)
                + u64::from(h[3]) * u64::from(r1)
                + u64::from(h[4]) * u64::from(r0);

            // Carry propagation back to 26-bit limbs
            let mut carry = (d0 >> 26) as u32;
            h[0] = (d0 as u32) & LIMB_MASK;
            d1 += u64::from(carry);
            carry = (d1 >> 26) as u32;
            h[1] = (d1 as u32) & LIMB_MASK;
            d2 += u64::from(carry);
            carry = (d2 >> 26) as u32;
            h[2] = (d2 as u32) & LIMB_MASK;
            d3 += u64::from(carry);
            carry = (d3 >> 26) as u32;
            h[3] = (d3 as u32) & LIMB_MASK;
            d4 += u64::from(carry);
            carry = (d4 >> 26) as u32;
            h[4] = (d4 as u32) & LIMB_MASK;

            // 2^130 ≡ 5 (mod p): fold the overflow back in times 5
            h[0] = h[0].wrapping_add(carry.wrapping_mul(5));
            carry = h[0] >> 26;
            h[0] &= LIMB_MASK;
            h[1] = h[1].wrapping_add(carry);
        }

        // Full carry pass
        let mut carry = h[1] >> 26;
        h[1] &= LIMB_MASK;
        h[2] = h[2].wrapping_add(carry);
        carry = h[2] >> 26;
        h[2] &= LIMB_MASK;
        h[3] = h[3].wrapping_add(carry);
        carry = h[3] >> 26;
        h[3] &= LIMB_MASK;
        h[4] = h[4].wrapping_add(carry);
        carry = h[4] >> 26;
        h[4] &= LIMB_MASK;
        h[0] = h[0].wrapping_add(carry.wrapping_mul(5));
        carry = h[0] >> 26;
        h[0] &= LIMB_MASK;
        h[1] = h[1].wrapping_add(carry);

        // g = h - p = h + 5 - 2^130; select g when h >= p
        let mut g0 = h[0].wrapping_add(5);
        carry = g0 >> 26;
        g0 &= LIMB_MASK;
        let mut g1 = h[1].wrapping_add(carry);
        carry = g1 >> 26;
        g1 &= LIMB_MASK;
        let mut g2 = h[2].wrapping_add(carry);
        carry = g2 >> 26;
        g2 &= LIMB_MASK;
        let mut g3 = h[3].wrapping_add(carry);
        carry = g3 >> 26;
        g3 &= LIMB_MASK;
        let g4 = h[4].wrapping_add(carry).wrapping_sub(1 << 26);

        // Branch-free select: subtraction borrowed iff h < p
        let keep_g = (g4 >> 31).wrapping_sub(1);
        let keep_h = !keep_g;
        h[0] = (h[0] & keep_h) | (g0 & keep_g);
        h[1] = (h[1] & keep_h) | (g1 & keep_g);
        h[2] = (h[2] & keep_h) | (g2 & keep_g);
        h[3] = (h[3] & keep_h) | (g3 & keep_g);
        h[4] = (h[4] & keep_h) | (g4 & keep_g);

        // Repack 26-bit limbs into four 32-bit words (h mod 2^128)
        let w0 = h[0] | (h[1] << 26);
        let w1 = (h[1] >> 6) | (h[2] << 20);
        let w2 = (h[2] >> 12) | (h[3] << 14);
        let w3 = (h[3] >> 18) | (h[4] << 8);

        // tag = (h + s) mod 2^128
        let mut f = u64::from(w0) + u64::from(self.s[0]);
        let t0 = f as u32;
        f = u64::from(w1) + u64::from(self.s[1]) + (f >> 32);
        let t1 = f as u32;
        f = u64::from(w2) + u64::from(self.s[2]) + (f >> 32);
        let t2 = f as u32;
        f = u64::from(w3) + u64::from(self.s[3]) + (f >> 32);
        let t3 = f as u32;

        let mut tag = [0u8; Self::TAG_SIZE];
        tag[0..4].copy_from_slice(&t0.to_le_bytes());
        tag[4..8].copy_from_slice(&t1.to_le_bytes());
        tag[8..12].copy_from_slice(&t2.to_le_bytes());
        tag[12..16].copy_from_slice(&t3.to_le_bytes());
        tag
    }

    /// Verify `tag` against the authenticator for `msg` in constant time.
    #[must_use]
    pub fn verify(&self, msg: &[u8], tag: &[u8]) -> bool {
        if tag.len() != Self::TAG_SIZE {
            return false;
        }
        constant_time_eq(&self.compute(msg), tag)
    }
}

impl Drop for Poly1305 {
    fn drop(&mut self) {
        self.r.zeroize();
        self.s.zeroize();
    }
}

impl std::fmt::Debug for Poly1305 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poly1305").finish_non_exhaustive()
    }
}

/// Load a little-endian `u32` starting at `offset`. Reads past the end are
/// zero-filled (used for the final 17-byte padded block).
fn load_u32_le(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    for (i, slot) in word.iter_mut().enumerate() {
        if let Some(&b) = bytes.get(offset + i) {
            *slot = b;
        }
    }
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc8439_section_2_5_2() {
        let key = hex::decode(
            "85d6be7857556d337f4452fe42d506a80103808afb0db2fd4abff6af4149f51b",
        )
        .unwrap();
        let msg = b"Cryptographic Forum Research Group";

        let mac = Poly1305::new(&key).unwrap();
        let tag = mac.compute(msg);

        assert_eq!(hex::encode(tag), "a8061dc1305136c6c22b8baf0c0127a9");
        assert!(mac.verify(msg, &tag));
    }

    #[test]
    fn rfc8439_appendix_a3_vector_1() {
        // Zero key, 64-byte zero message: tag is all zero.
        let mac = Poly1305::new(&[0u8; 32]).unwrap();
        let tag = mac.compute(&[0u8; 64]);
        assert_eq!(tag, [0u8; 16]);
    }

    #[test]
    fn rfc8439_appendix_a3_vector_2() {
        // r = 0, s = 36e5f6b5...: tag equals s regardless of message.
        let mut key = [0u8; 32];
        let s = hex::decode("36e5f6b5c5e06070f0efca96227a863e").unwrap();
        key[16..].copy_from_slice(&s);

        let msg = b"Any submission to the IETF intended by the Contributor for publication as all or part of an IETF Internet-Draft or RFC and any statement made within the context of an IETF activity is considered an \"IETF Contribution\". Such statements include oral statements in IETF sessions, as well as written and electronic communications made at any time or place, which are addressed to";

        let mac = Poly1305::new(&key).unwrap();
        assert_eq!(hex::encode(mac.compute(msg)), "36e5f6b5c5e06070f0efca96227a863e");
    }

    #[test]
    fn invalid_key_size_rejected() {
        assert_eq!(
            Poly1305::new(&[0u8; 16]).err(),
            Some(MacError::InvalidKeySize { expected: 32, actual: 16 })
        );
        assert_eq!(
            Poly1305::new(&[0u8; 33]).err(),
            Some(MacError::InvalidKeySize { expected: 32, actual: 33 })
        );
    }

    #[test]
    fn empty_message_tag_is_s() {
        // No blocks processed: accumulator stays zero, tag = s.
        let mut key = [0u8; 32];
        key[0] = 0xFF; // r is nonzero but unused
        key[16..].copy_from_slice(&[0xABu8; 16]);

        let mac = Poly1305::new(&key).unwrap();
        assert_eq!(mac.compute(&[]), [0xABu8; 16]);
    }

    #[test]
    fn partial_block_padding() {
        // A 5-byte message and the same message explicitly padded must
        // differ: the pad byte position is part of the input.
        let key: Vec<u8> = (0u8..32).collect();
        let mac = Poly1305::new(&key).unwrap();

        let short = mac.compute(&[1, 2, 3, 4, 5]);
        let mut padded = [0u8; 16];
        padded[..5].copy_from_slice(&[1, 2, 3, 4, 5]);
        let full = mac.compute(&padded);

        assert_ne!(short, full);
    }

    #[test]
    fn verify_rejects_wrong_length_and_tamper() {
        let key: Vec<u8> = (0u8..32).collect();
        let mac = Poly1305::new(&key).unwrap();
        let mut tag = mac.compute(b"message");

        assert!(mac.verify(b"message", &tag));
        assert!(!mac.verify(b"message", &tag[..15]));

        tag[7] ^= 0x80;
        assert!(!mac.verify(b"message", &tag));
    }

    #[test]
    fn message_lengths_around_block_boundary() {
        // Exercise the full-block, exact-multiple, and short-tail paths.
        let key: Vec<u8> = (100u8..132).collect();
        let mac = Poly1305::new(&key).unwrap();

        let mut tags = Vec::new();
        for len in [0usize, 1, 15, 16, 17, 31, 32, 33, 255] {
            let msg = vec![0x5Au8; len];
            let tag = mac.compute(&msg);
            assert!(mac.verify(&msg, &tag));
            tags.push(tag);
        }

        // All tags distinct
        for i in 0..tags.len() {
            for j in (i + 1)..tags.len() {
                assert_ne!(tags[i], tags[j], "lengths {i} and {j} collided");
            }
        }
    }
}
