//! HMAC over the SHA family (RFC 2104).
//!
//! Streaming keyed MAC: prepare a block-sized key once, then `update` any
//! number of times and `finalize` for the tag. The construction is
//! `H((k ^ opad) || H((k ^ ipad) || msg))` with `ipad = 0x36`,
//! `opad = 0x5C`. Keys longer than the block size are hashed first; shorter
//! keys are right-padded with zeros.
//!
//! The compression functions come from the `sha1`/`sha2` crates; the keyed
//! construction, key preparation, and tag verification live here because
//! their exact semantics (block sizing, disposal, constant-time verify) are
//! part of this runtime's contract.

use sha2::Digest;
use zeroize::{Zeroize, Zeroizing};

use crate::{ct::constant_time_eq, error::MacError};

/// Hash algorithm selecting block and output sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HmacAlgorithm {
    /// SHA-1 (64-byte block, 20-byte tag). Legacy peers only.
    Sha1,
    /// SHA-224 (64-byte block, 28-byte tag).
    Sha224,
    /// SHA-256 (64-byte block, 32-byte tag).
    Sha256,
    /// SHA-384 (128-byte block, 48-byte tag).
    Sha384,
}

impl HmacAlgorithm {
    /// Compression-function block size in bytes.
    #[must_use]
    pub fn block_size(self) -> usize {
        match self {
            Self::Sha1 | Self::Sha224 | Self::Sha256 => 64,
            Self::Sha384 => 128,
        }
    }

    /// Tag size in bytes.
    #[must_use]
    pub fn output_size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
        }
    }
}

/// Streaming digest state, dispatched over the algorithm tag.
enum DigestState {
    Sha1(sha1::Sha1),
    Sha224(sha2::Sha224),
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
}

impl DigestState {
    fn new(algo: HmacAlgorithm) -> Self {
        match algo {
            HmacAlgorithm::Sha1 => Self::Sha1(sha1::Sha1::new()),
            HmacAlgorithm::Sha224 => Self::Sha224(sha2::Sha224::new()),
            HmacAlgorithm::Sha256 => Self::Sha256(sha2::Sha256::new()),
            HmacAlgorithm::Sha384 => Self::Sha384(sha2::Sha384::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(d) => d.update(data),
            Self::Sha224(d) => d.update(data),
            Self::Sha256(d) => d.update(data),
            Self::Sha384(d) => d.update(data),
        }
    }

    fn finalize_reset(&mut self) -> Zeroizing<Vec<u8>> {
        let out = match self {
            Self::Sha1(d) => d.finalize_reset().to_vec(),
            Self::Sha224(d) => d.finalize_reset().to_vec(),
            Self::Sha256(d) => d.finalize_reset().to_vec(),
            Self::Sha384(d) => d.finalize_reset().to_vec(),
        };
        Zeroizing::new(out)
    }
}

/// Streaming HMAC state with a prepared block-sized key.
///
/// # Invariants
///
/// - Pad buffers are zeroized on [`dispose`](Self::dispose) and on drop; any
///   call after disposal fails with [`MacError::Disposed`].
/// - [`verify`](Self::verify) is independent of the streaming state: it
///   computes the tag over its own message from the prepared pads and never
///   disturbs an in-progress `update` sequence.
pub struct Hmac {
    algo: HmacAlgorithm,
    /// `k ^ ipad`, block-sized
    ipad_key: Zeroizing<Vec<u8>>,
    /// `k ^ opad`, block-sized
    opad_key: Zeroizing<Vec<u8>>,
    /// Inner hash, seeded with `ipad_key`
    inner: DigestState,
    disposed: bool,
}

impl Hmac {
    /// Inner pad byte.
    const IPAD: u8 = 0x36;
    /// Outer pad byte.
    const OPAD: u8 = 0x5C;

    /// Create an HMAC state with a prepared key.
    ///
    /// Keys longer than the block size are hashed down; shorter keys are
    /// right-padded with zeros to the block size.
    ///
    /// # Errors
    ///
    /// - [`MacError::EmptyKey`] if `key` is empty
    pub fn new(key: &[u8], algo: HmacAlgorithm) -> Result<Self, MacError> {
        if key.is_empty() {
            return Err(MacError::EmptyKey);
        }

        let block = algo.block_size();
        let mut prepared = Zeroizing::new(vec![0u8; block]);
        if key.len() > block {
            let mut hasher = DigestState::new(algo);
            hasher.update(key);
            let digest = hasher.finalize_reset();
            prepared[..digest.len()].copy_from_slice(&digest);
        } else {
            prepared[..key.len()].copy_from_slice(key);
        }

        let ipad_key = Zeroizing::new(prepared.iter().map(|b| b ^ Self::IPAD).collect::<Vec<u8>>());
        let opad_key = Zeroizing::new(prepared.iter().map(|b| b ^ Self::OPAD).collect::<Vec<u8>>());

        let mut inner = DigestState::new(algo);
        inner.update(&ipad_key);

        Ok(Self { algo, ipad_key, opad_key, inner, disposed: false })
    }

    /// Algorithm this state was created with.
    #[must_use]
    pub fn algorithm(&self) -> HmacAlgorithm {
        self.algo
    }

    /// Tag size in bytes.
    #[must_use]
    pub fn output_size(&self) -> usize {
        self.algo.output_size()
    }

    /// Feed message bytes into the streaming state.
    ///
    /// # Errors
    ///
    /// - [`MacError::Disposed`] after [`dispose`](Self::dispose)
    pub fn update(&mut self, data: &[u8]) -> Result<(), MacError> {
        if self.disposed {
            return Err(MacError::Disposed);
        }
        self.inner.update(data);
        Ok(())
    }

    /// Produce the tag over everything fed via [`update`](Self::update) and
    /// reset the streaming state for reuse.
    ///
    /// # Errors
    ///
    /// - [`MacError::Disposed`] after [`dispose`](Self::dispose)
    pub fn finalize(&mut self) -> Result<Vec<u8>, MacError> {
        if self.disposed {
            return Err(MacError::Disposed);
        }

        let inner_hash = self.inner.finalize_reset();

        // Re-seed for the next message
        self.inner.update(&self.ipad_key);

        let mut outer = DigestState::new(self.algo);
        outer.update(&self.opad_key);
        outer.update(&inner_hash);
        Ok(outer.finalize_reset().to_vec())
    }

    /// One-shot tag over `msg`, independent of the streaming state.
    ///
    /// # Errors
    ///
    /// - [`MacError::Disposed`] after [`dispose`](Self::dispose)
    pub fn compute(&self, msg: &[u8]) -> Result<Vec<u8>, MacError> {
        if self.disposed {
            return Err(MacError::Disposed);
        }

        let mut inner = DigestState::new(self.algo);
        inner.update(&self.ipad_key);
        inner.update(msg);
        let inner_hash = inner.finalize_reset();

        let mut outer = DigestState::new(self.algo);
        outer.update(&self.opad_key);
        outer.update(&inner_hash);
        Ok(outer.finalize_reset().to_vec())
    }

    /// Verify `expected` against the tag for `msg` in constant time.
    ///
    /// Returns `false` on length mismatch without computing anything.
    ///
    /// # Errors
    ///
    /// - [`MacError::Disposed`] after [`dispose`](Self::dispose)
    pub fn verify(&self, msg: &[u8], expected: &[u8]) -> Result<bool, MacError> {
        if self.disposed {
            return Err(MacError::Disposed);
        }
        if expected.len() != self.output_size() {
            return Ok(false);
        }
        let tag = self.compute(msg)?;
        Ok(constant_time_eq(&tag, expected))
    }

    /// Zeroize the prepared key material. Further calls fail with
    /// [`MacError::Disposed`].
    pub fn dispose(&mut self) {
        self.ipad_key.zeroize();
        self.opad_key.zeroize();
        self.disposed = true;
    }
}

// Pad buffers are Zeroizing; nothing else retains key material.
impl Drop for Hmac {
    fn drop(&mut self) {
        self.disposed = true;
    }
}

impl std::fmt::Debug for Hmac {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hmac")
            .field("algo", &self.algo)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}
