//! Environment abstraction over time and randomness.
//!
//! Decouples the runtime from system resources so tests can substitute
//! deterministic implementations. Production uses the server crate's
//! `SystemEnv` (real monotonic time, OS RNG).

use std::time::{Duration, Instant};

/// Abstract environment providing time, randomness, and async sleep.
///
/// Implementations MUST guarantee that `now()` never goes backwards within a
/// process and that `random_bytes()` draws from a cryptographically secure
/// source in production - session identifiers come from it.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current monotonic time.
    fn now(&self) -> Instant;

    /// Sleep for the given duration.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Random `u64` (request ids, jitter).
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_le_bytes(bytes)
    }

    /// Random `u128` (session identifiers).
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_le_bytes(bytes)
    }
}
