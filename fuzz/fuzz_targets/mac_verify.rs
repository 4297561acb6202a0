//! Fuzz target for the MAC primitives.
//!
//! For any key and message: a computed tag must verify, a flipped tag must
//! not, and streaming HMAC must agree with the one-shot path.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tidegate_crypto::{Hmac, HmacAlgorithm, Poly1305};

#[derive(Arbitrary, Debug)]
struct Input {
    key: Vec<u8>,
    poly_key: [u8; 32],
    message: Vec<u8>,
    split: usize,
}

fuzz_target!(|input: Input| {
    for algo in [
        HmacAlgorithm::Sha1,
        HmacAlgorithm::Sha224,
        HmacAlgorithm::Sha256,
        HmacAlgorithm::Sha384,
    ] {
        let Ok(mut mac) = Hmac::new(&input.key, algo) else {
            assert!(input.key.is_empty());
            continue;
        };

        // Streaming in two arbitrary chunks must match the one-shot tag.
        let split = input.split.min(input.message.len());
        mac.update(&input.message[..split]).unwrap();
        mac.update(&input.message[split..]).unwrap();
        let streamed = mac.finalize().unwrap();
        assert_eq!(streamed, mac.compute(&input.message).unwrap());

        assert!(mac.verify(&input.message, &streamed).unwrap());
        if let Some(first) = streamed.first() {
            let mut bad = streamed.clone();
            bad[0] = first ^ 0x01;
            assert!(!mac.verify(&input.message, &bad).unwrap());
        }
    }

    let poly = Poly1305::new(&input.poly_key).unwrap();
    let tag = poly.compute(&input.message);
    assert!(poly.verify(&input.message, &tag));

    let mut bad = tag;
    bad[0] ^= 0x80;
    assert!(!poly.verify(&input.message, &bad));
});
