//! Production environment: system time and OS RNG.

use std::time::{Duration, Instant};

use tidegate_core::Environment;

/// Production [`Environment`] backed by monotonic system time, tokio sleep,
/// and the OS cryptographic RNG.
///
/// # Panics
///
/// Panics if the OS RNG fails. A server that cannot draw secure randomness
/// cannot mint session identifiers or nonces, and continuing would be worse
/// than dying; RNG failure indicates OS-level breakage.
#[derive(Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// Create a new system environment.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer)
            .expect("invariant: OS RNG failure is unrecoverable for a packet server");
    }
}
