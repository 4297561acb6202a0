//! Crypto error types.

use thiserror::Error;

/// Errors from the MAC primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacError {
    /// HMAC key must not be empty.
    #[error("empty key")]
    EmptyKey,

    /// Key length did not match the algorithm's requirement.
    #[error("invalid key size: expected {expected} bytes, got {actual}")]
    InvalidKeySize {
        /// Required key length
        expected: usize,
        /// Provided key length
        actual: usize,
    },

    /// Operation on a disposed MAC state.
    #[error("MAC state has been disposed")]
    Disposed,
}

/// Errors from secrets and the cipher capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Session secrets are exactly 32 bytes.
    #[error("invalid secret length: expected 32 bytes, got {actual}")]
    InvalidSecretLength {
        /// Provided length
        actual: usize,
    },

    /// Encryption failed.
    ///
    /// Deliberately carries no detail - cipher failures must not leak
    /// plaintext or key structure.
    #[error("encryption failed")]
    Encrypt,

    /// Decryption or tag verification failed.
    #[error("decryption failed")]
    Decrypt,

    /// OS RNG was unavailable for nonce generation.
    #[error("random source unavailable")]
    Rng,
}
