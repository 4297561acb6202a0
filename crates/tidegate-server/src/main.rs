//! Tidegate server binary.
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default port with the built-in echo controller
//! tidegate-server --bind 0.0.0.0:7420
//!
//! # With the ancillary UDP transport and tighter limits
//! tidegate-server --bind 0.0.0.0:7420 --udp-bind 0.0.0.0:7421 --max-frame-len 65536
//! ```

use std::{sync::Arc, time::Duration};

use clap::Parser;
use tidegate_core::{
    DispatcherBuilder, HandlerRegistration, HandlerReply, PacketController, RateLimiter,
    RatePolicy, handler_fn,
};
use tidegate_crypto::AeadCipher;
use tidegate_server::{RuntimeConfig, Server, SystemEnv};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Tidegate packet server
#[derive(Parser, Debug)]
#[command(name = "tidegate-server")]
#[command(about = "Opcode-routed TCP packet server")]
#[command(version)]
struct Args {
    /// TCP address to bind to
    #[arg(short, long, default_value = "0.0.0.0:7420")]
    bind: String,

    /// Optional UDP address for the shared ancillary transport
    #[arg(long)]
    udp_bind: Option<String>,

    /// Maximum accepted frame length in bytes
    #[arg(long, default_value = "1048576")]
    max_frame_len: usize,

    /// Per-connection incoming queue capacity
    #[arg(long, default_value = "64")]
    queue_capacity: usize,

    /// Disconnect connections idle for this many seconds (0 disables)
    #[arg(long, default_value = "90")]
    idle_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Built-in diagnostics controller: echo and ping.
struct DiagnosticsController;

impl PacketController for DiagnosticsController {
    fn registrations(&self) -> Vec<HandlerRegistration> {
        vec![
            // 0x0001: echo the packet back through the normal reply path.
            HandlerRegistration::new(
                0x0001,
                handler_fn(|packet, _conn| async move { Ok(HandlerReply::Packet(packet)) }),
            )
            .with_rate_limit(RatePolicy::new(32, 16.0)),
            // 0x0002: liveness probe answered with a text packet.
            HandlerRegistration::new(
                0x0002,
                handler_fn(|_packet, _conn| async move {
                    Ok(HandlerReply::Text("pong".to_string()))
                }),
            ),
        ]
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("tidegate server starting");

    let config = RuntimeConfig {
        bind_address: args.bind,
        udp_bind_address: args.udp_bind,
        max_frame_len: args.max_frame_len,
        queue_capacity: args.queue_capacity,
        idle_timeout: (args.idle_timeout_secs > 0)
            .then(|| Duration::from_secs(args.idle_timeout_secs)),
        ..RuntimeConfig::default()
    };

    let mut builder = DispatcherBuilder::new();
    builder.max_payload_len(config.max_frame_len);
    builder.register_controller(&DiagnosticsController)?;
    let dispatcher =
        builder.build(SystemEnv::new(), Arc::new(RateLimiter::new()), Arc::new(AeadCipher::new()));

    let server = Server::bind(config, dispatcher).await?;
    tracing::info!(local = %server.local_addr()?, "listening");

    server.run().await?;

    Ok(())
}
