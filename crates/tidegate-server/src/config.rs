//! Runtime configuration.
//!
//! Assembled once at startup from CLI arguments (or defaults) and treated as
//! immutable afterwards: queue bounds, frame limits, rate-limiter hygiene,
//! and idle supervision all read from here.

use std::time::Duration;

use tidegate_core::{ChannelConfig, ConnectionConfig, OverflowPolicy};

/// Immutable server runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// TCP bind address (e.g. `0.0.0.0:7420`).
    pub bind_address: String,
    /// Optional UDP bind address for the shared ancillary datagram socket.
    pub udp_bind_address: Option<String>,
    /// Maximum frame length accepted from peers (bytes).
    pub max_frame_len: usize,
    /// Per-connection incoming queue capacity (packets).
    pub queue_capacity: usize,
    /// Overflow behavior when a connection's queue is full.
    pub overflow: OverflowPolicy,
    /// Disconnect connections idle longer than this. `None` disables idle
    /// supervision.
    pub idle_timeout: Option<Duration>,
    /// Cadence of the maintenance sweep (idle disconnects, rate-bucket
    /// eviction).
    pub sweep_interval: Duration,
    /// Rate-limiter buckets idle longer than this are evicted by the sweep.
    pub rate_bucket_idle: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7420".to_string(),
            udp_bind_address: None,
            max_frame_len: 1024 * 1024,
            queue_capacity: 64,
            overflow: OverflowPolicy::default(),
            idle_timeout: Some(Duration::from_secs(90)),
            sweep_interval: Duration::from_secs(10),
            rate_bucket_idle: Duration::from_secs(300),
        }
    }
}

impl RuntimeConfig {
    /// Per-connection configuration derived from the runtime settings.
    #[must_use]
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            channel: ChannelConfig {
                max_frame_len: self.max_frame_len,
                queue_capacity: self.queue_capacity,
                overflow: self.overflow,
            },
        }
    }

    /// Validate bounds that would otherwise wedge the runtime.
    ///
    /// # Errors
    ///
    /// Returns a message naming the offending field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_frame_len < tidegate_proto::PacketHeader::SIZE {
            return Err(format!(
                "max_frame_len {} is below the packet header size",
                self.max_frame_len
            ));
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".to_string());
        }
        Ok(())
    }
}
