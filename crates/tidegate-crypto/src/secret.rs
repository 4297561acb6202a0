//! Per-connection symmetric secret.

use zeroize::Zeroize;

use crate::error::CryptoError;

/// A 32-byte symmetric session key.
///
/// Constructed only from exactly 32 bytes; zeroized on drop. `Debug` redacts
/// the key material so secrets cannot leak through logging.
pub struct SessionSecret([u8; Self::SIZE]);

impl SessionSecret {
    /// Required secret length.
    pub const SIZE: usize = 32;

    /// Wrap an owned 32-byte key.
    #[must_use]
    pub fn new(bytes: [u8; Self::SIZE]) -> Self {
        Self(bytes)
    }

    /// Copy a secret out of a slice.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::InvalidSecretLength`] if `bytes` is not exactly 32
    ///   bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; Self::SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidSecretLength { actual: bytes.len() })?;
        Ok(Self(arr))
    }

    /// Key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; Self::SIZE] {
        &self.0
    }
}

impl Drop for SessionSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionSecret(..)")
    }
}
