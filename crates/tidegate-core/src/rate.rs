//! Per-remote token-bucket rate limiter.
//!
//! Buckets are keyed by the normalized remote endpoint (address + port)
//! plus a scope: the opcode by default, or a named group when a policy
//! shares one bucket across opcodes. Refill is lazy - tokens accrue on
//! `check` based on elapsed time, so idle buckets cost nothing.
//!
//! Time is passed in by the caller, keeping the limiter a pure state
//! machine that tests drive with a synthetic clock.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tidegate_proto::EndpointKey;

/// Rate policy attached to a handler descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct RatePolicy {
    /// Burst capacity (maximum tokens in the bucket).
    pub capacity: u32,
    /// Tokens restored per second.
    pub refill_per_sec: f64,
    /// Optional group name: policies sharing a group share one bucket per
    /// endpoint, across opcodes.
    pub group: Option<String>,
}

impl RatePolicy {
    /// Policy with the given burst capacity and per-second refill.
    #[must_use]
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self { capacity, refill_per_sec, group: None }
    }

    /// Copy of this policy sharing a named bucket across opcodes.
    #[must_use]
    pub fn grouped(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Bucket scope: per-opcode by default, or a shared named group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RateScope {
    Opcode(u16),
    Group(String),
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Concurrent token-bucket map.
///
/// Safe under concurrent readers and writers; each check touches exactly one
/// shard of the underlying map.
pub struct RateLimiter {
    buckets: DashMap<(EndpointKey, RateScope), Bucket>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Create an empty limiter.
    #[must_use]
    pub fn new() -> Self {
        Self { buckets: DashMap::new() }
    }

    /// Take one token from the bucket for (`endpoint`, scope).
    ///
    /// Returns `true` if the request is admitted. A missing bucket starts
    /// full at `policy.capacity`.
    pub fn check(
        &self,
        endpoint: EndpointKey,
        opcode: u16,
        policy: &RatePolicy,
        now: Instant,
    ) -> bool {
        let scope = match &policy.group {
            Some(group) => RateScope::Group(group.clone()),
            None => RateScope::Opcode(opcode),
        };

        let mut entry = self.buckets.entry((endpoint, scope)).or_insert_with(|| Bucket {
            tokens: f64::from(policy.capacity),
            last_refill: now,
            last_seen: now,
        });
        let bucket = entry.value_mut();

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * policy.refill_per_sec)
            .min(f64::from(policy.capacity));
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Evict buckets idle for longer than `threshold`. Returns the number of
    /// evicted entries.
    pub fn evict_idle(&self, threshold: Duration, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) <= threshold);
        before - self.buckets.len()
    }

    /// Number of live buckets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no buckets exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(port: u16) -> EndpointKey {
        EndpointKey::from_socket(format!("10.0.0.1:{port}").parse().unwrap())
    }

    #[test]
    fn burst_then_reject() {
        let limiter = RateLimiter::new();
        let policy = RatePolicy::new(2, 1.0);
        let t0 = Instant::now();

        assert!(limiter.check(endpoint(1), 0x10, &policy, t0));
        assert!(limiter.check(endpoint(1), 0x10, &policy, t0));
        assert!(!limiter.check(endpoint(1), 0x10, &policy, t0));
    }

    #[test]
    fn refill_restores_tokens() {
        let limiter = RateLimiter::new();
        let policy = RatePolicy::new(2, 1.0);
        let t0 = Instant::now();

        assert!(limiter.check(endpoint(1), 0x10, &policy, t0));
        assert!(limiter.check(endpoint(1), 0x10, &policy, t0));
        assert!(!limiter.check(endpoint(1), 0x10, &policy, t0));

        // One second restores one token.
        let t1 = t0 + Duration::from_secs(1);
        assert!(limiter.check(endpoint(1), 0x10, &policy, t1));
        assert!(!limiter.check(endpoint(1), 0x10, &policy, t1));
    }

    #[test]
    fn refill_caps_at_capacity() {
        let limiter = RateLimiter::new();
        let policy = RatePolicy::new(3, 100.0);
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check(endpoint(1), 0x10, &policy, t0));
        }

        // An hour of refill still yields at most `capacity` admits.
        let t1 = t0 + Duration::from_secs(3600);
        for _ in 0..3 {
            assert!(limiter.check(endpoint(1), 0x10, &policy, t1));
        }
        assert!(!limiter.check(endpoint(1), 0x10, &policy, t1));
    }

    #[test]
    fn endpoints_have_independent_buckets() {
        let limiter = RateLimiter::new();
        let policy = RatePolicy::new(1, 0.0);
        let t0 = Instant::now();

        assert!(limiter.check(endpoint(1), 0x10, &policy, t0));
        assert!(limiter.check(endpoint(2), 0x10, &policy, t0));
        assert!(!limiter.check(endpoint(1), 0x10, &policy, t0));
    }

    #[test]
    fn opcodes_have_independent_buckets() {
        let limiter = RateLimiter::new();
        let policy = RatePolicy::new(1, 0.0);
        let t0 = Instant::now();

        assert!(limiter.check(endpoint(1), 0x10, &policy, t0));
        assert!(limiter.check(endpoint(1), 0x11, &policy, t0));
        assert!(!limiter.check(endpoint(1), 0x10, &policy, t0));
    }

    #[test]
    fn grouped_policies_share_a_bucket() {
        let limiter = RateLimiter::new();
        let policy = RatePolicy::new(2, 0.0).grouped("auth");
        let t0 = Instant::now();

        assert!(limiter.check(endpoint(1), 0x10, &policy, t0));
        assert!(limiter.check(endpoint(1), 0x11, &policy, t0));
        assert!(!limiter.check(endpoint(1), 0x12, &policy, t0));
    }

    #[test]
    fn idle_buckets_evict() {
        let limiter = RateLimiter::new();
        let policy = RatePolicy::new(1, 1.0);
        let t0 = Instant::now();

        limiter.check(endpoint(1), 0x10, &policy, t0);
        limiter.check(endpoint(2), 0x10, &policy, t0);
        assert_eq!(limiter.len(), 2);

        // Endpoint 2 stays active.
        let t1 = t0 + Duration::from_secs(120);
        limiter.check(endpoint(2), 0x10, &policy, t1);

        let evicted = limiter.evict_idle(Duration::from_secs(60), t1);
        assert_eq!(evicted, 1);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn concurrent_checks_are_safe() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new());
        let policy = RatePolicy::new(1000, 0.0);
        let t0 = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let policy = policy.clone();
                std::thread::spawn(move || {
                    let mut admitted = 0;
                    for _ in 0..200 {
                        if limiter.check(endpoint(1), 0x10, &policy, t0) {
                            admitted += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 1000);
    }
}
