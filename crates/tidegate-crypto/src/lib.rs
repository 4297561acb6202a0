//! Tidegate cryptographic primitives.
//!
//! Message authentication for framed payloads: HMAC over the SHA family and
//! Poly1305, both with constant-time tag verification, plus the 32-byte
//! per-connection session secret and the opaque cipher capability the
//! dispatcher uses for packet encryption.
//!
//! # Key hygiene
//!
//! Every type holding key material zeroizes it on drop: HMAC pad buffers,
//! Poly1305 `r`/`s`, and session secrets. Nothing in this crate logs or
//! formats key bytes; `Debug` implementations redact.
//!
//! # Security
//!
//! Tag comparison always goes through [`constant_time_eq`] so verification
//! time does not depend on where two tags diverge. Length mismatches
//! short-circuit - MAC tags have fixed, public lengths.

#![forbid(unsafe_code)]

pub mod cipher;
pub mod ct;
pub mod error;
pub mod hmac;
pub mod poly1305;
pub mod secret;

pub use cipher::{AeadCipher, Cipher, CipherSuite};
pub use ct::constant_time_eq;
pub use error::{CryptoError, MacError};
pub use hmac::{Hmac, HmacAlgorithm};
pub use poly1305::Poly1305;
pub use secret::SessionSecret;
