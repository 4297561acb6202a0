//! Opaque cipher capability for packet payloads.
//!
//! The dispatcher encrypts outbound and decrypts inbound packet payloads
//! through the [`Cipher`] trait without interpreting the suite tag. The
//! default implementation seals with ChaCha20-Poly1305 (or the XChaCha
//! variant) using a random nonce prefixed to the ciphertext:
//!
//! ```text
//! [nonce: 12 or 24 bytes] + [ciphertext + 16-byte AEAD tag]
//! ```
//!
//! Decrypt failures are opaque: a tampered ciphertext and a wrong key are
//! indistinguishable to the caller.

use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};

use crate::{error::CryptoError, secret::SessionSecret};

/// Symmetric cipher family tag.
///
/// Forwarded to the cipher capability without interpretation by the runtime.
/// Stored per connection as a single byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CipherSuite {
    /// ChaCha20-Poly1305 AEAD (RFC 8439), 12-byte nonce. The default.
    #[default]
    ChaCha20Poly1305 = 0,
    /// XChaCha20-Poly1305 AEAD, 24-byte nonce.
    XChaCha20Poly1305 = 1,
}

impl CipherSuite {
    /// Wire/storage value.
    #[must_use]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a stored value. `None` if unrecognized.
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ChaCha20Poly1305),
            1 => Some(Self::XChaCha20Poly1305),
            _ => None,
        }
    }

    /// Nonce length for this suite.
    #[must_use]
    pub fn nonce_size(self) -> usize {
        match self {
            Self::ChaCha20Poly1305 => 12,
            Self::XChaCha20Poly1305 => 24,
        }
    }
}

/// Symmetric cipher capability consumed by the dispatcher.
pub trait Cipher: Send + Sync {
    /// Seal `plaintext` under `secret` for the given suite.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Encrypt`] on cipher failure
    /// - [`CryptoError::Rng`] if nonce generation fails
    fn encrypt(
        &self,
        suite: CipherSuite,
        secret: &SessionSecret,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Open `ciphertext` under `secret` for the given suite.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::Decrypt`] on malformed input, tag mismatch, or wrong
    ///   key (all indistinguishable)
    fn decrypt(
        &self,
        suite: CipherSuite,
        secret: &SessionSecret,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

/// Default AEAD cipher over the ChaCha20-Poly1305 family.
#[derive(Debug, Clone, Copy, Default)]
pub struct AeadCipher;

impl AeadCipher {
    /// Create the default cipher.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Cipher for AeadCipher {
    fn encrypt(
        &self,
        suite: CipherSuite,
        secret: &SessionSecret,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let key = Key::from_slice(secret.as_bytes());

        let mut nonce = [0u8; 24];
        let nonce_len = suite.nonce_size();
        getrandom::fill(&mut nonce[..nonce_len]).map_err(|_| CryptoError::Rng)?;

        let sealed = match suite {
            CipherSuite::ChaCha20Poly1305 => ChaCha20Poly1305::new(key)
                .encrypt(Nonce::from_slice(&nonce[..nonce_len]), plaintext)
                .map_err(|_| CryptoError::Encrypt)?,
            CipherSuite::XChaCha20Poly1305 => XChaCha20Poly1305::new(key)
                .encrypt(XNonce::from_slice(&nonce[..nonce_len]), plaintext)
                .map_err(|_| CryptoError::Encrypt)?,
        };

        let mut out = Vec::with_capacity(nonce_len + sealed.len());
        out.extend_from_slice(&nonce[..nonce_len]);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(
        &self,
        suite: CipherSuite,
        secret: &SessionSecret,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce_len = suite.nonce_size();
        if ciphertext.len() < nonce_len {
            return Err(CryptoError::Decrypt);
        }
        let (nonce, body) = ciphertext.split_at(nonce_len);

        let key = Key::from_slice(secret.as_bytes());
        let opened = match suite {
            CipherSuite::ChaCha20Poly1305 => ChaCha20Poly1305::new(key)
                .decrypt(Nonce::from_slice(nonce), body)
                .map_err(|_| CryptoError::Decrypt)?,
            CipherSuite::XChaCha20Poly1305 => XChaCha20Poly1305::new(key)
                .decrypt(XNonce::from_slice(nonce), body)
                .map_err(|_| CryptoError::Decrypt)?,
        };
        Ok(opened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(byte: u8) -> SessionSecret {
        SessionSecret::new([byte; 32])
    }

    #[test]
    fn seal_open_round_trip_both_suites() {
        let cipher = AeadCipher::new();
        let key = secret(0x42);

        for suite in [CipherSuite::ChaCha20Poly1305, CipherSuite::XChaCha20Poly1305] {
            let sealed = cipher.encrypt(suite, &key, b"framed payload").unwrap();
            assert_ne!(&sealed[..], b"framed payload");
            assert_eq!(sealed.len(), suite.nonce_size() + b"framed payload".len() + 16);

            let opened = cipher.decrypt(suite, &key, &sealed).unwrap();
            assert_eq!(opened, b"framed payload");
        }
    }

    #[test]
    fn wrong_key_fails_opaquely() {
        let cipher = AeadCipher::new();
        let sealed =
            cipher.encrypt(CipherSuite::ChaCha20Poly1305, &secret(1), b"payload").unwrap();

        let result = cipher.decrypt(CipherSuite::ChaCha20Poly1305, &secret(2), &sealed);
        assert_eq!(result, Err(CryptoError::Decrypt));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let cipher = AeadCipher::new();
        let key = secret(7);
        let mut sealed =
            cipher.encrypt(CipherSuite::ChaCha20Poly1305, &key, b"payload").unwrap();

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(
            cipher.decrypt(CipherSuite::ChaCha20Poly1305, &key, &sealed),
            Err(CryptoError::Decrypt)
        );
    }

    #[test]
    fn truncated_ciphertext_fails() {
        let cipher = AeadCipher::new();
        let key = secret(7);
        assert_eq!(
            cipher.decrypt(CipherSuite::ChaCha20Poly1305, &key, &[0u8; 5]),
            Err(CryptoError::Decrypt)
        );
    }

    #[test]
    fn nonces_are_fresh() {
        let cipher = AeadCipher::new();
        let key = secret(9);
        let a = cipher.encrypt(CipherSuite::ChaCha20Poly1305, &key, b"same").unwrap();
        let b = cipher.encrypt(CipherSuite::ChaCha20Poly1305, &key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn suite_tag_round_trip() {
        assert_eq!(CipherSuite::from_u8(0), Some(CipherSuite::ChaCha20Poly1305));
        assert_eq!(CipherSuite::from_u8(1), Some(CipherSuite::XChaCha20Poly1305));
        assert_eq!(CipherSuite::from_u8(9), None);
        assert_eq!(CipherSuite::default(), CipherSuite::ChaCha20Poly1305);
    }
}
