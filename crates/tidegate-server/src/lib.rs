//! Tidegate production server.
//!
//! Glue between the runtime core and real sockets: a TCP accept loop that
//! constructs connections, registers them in the hub, and attaches the
//! dispatcher; a shared UDP transport; a maintenance sweep for idle
//! connections and stale rate buckets; and the production environment
//! (system time, OS RNG).
//!
//! Handler registration happens before bind through
//! [`DispatcherBuilder`](tidegate_core::DispatcherBuilder); the server owns
//! everything after `accept`.

#![forbid(unsafe_code)]

mod config;
mod error;
mod system_env;
mod udp;

use std::sync::Arc;

pub use config::RuntimeConfig;
pub use error::ServerError;
pub use system_env::SystemEnv;
pub use udp::SharedUdp;

use tidegate_core::{Connection, ConnectionHub, Dispatcher};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Production Tidegate server.
///
/// Owns the listener, the hub, and the maintenance sweep. The dispatcher is
/// built by the caller and shared in.
pub struct Server {
    listener: TcpListener,
    hub: Arc<ConnectionHub>,
    dispatcher: Arc<Dispatcher<SystemEnv>>,
    env: SystemEnv,
    config: RuntimeConfig,
    udp: Option<Arc<SharedUdp>>,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the TCP listener (and the shared UDP socket, if configured).
    ///
    /// # Errors
    ///
    /// - [`ServerError::Config`] on invalid configuration
    /// - [`ServerError::Transport`] if a bind fails
    pub async fn bind(
        config: RuntimeConfig,
        dispatcher: Arc<Dispatcher<SystemEnv>>,
    ) -> Result<Self, ServerError> {
        config.validate().map_err(ServerError::Config)?;

        let listener = TcpListener::bind(&config.bind_address).await?;
        tracing::info!(local = %listener.local_addr()?, "tcp listener bound");

        let udp = match &config.udp_bind_address {
            Some(address) => Some(SharedUdp::bind(address).await?),
            None => None,
        };

        Ok(Self {
            listener,
            hub: ConnectionHub::new(),
            dispatcher,
            env: SystemEnv::new(),
            config,
            udp,
            shutdown: CancellationToken::new(),
        })
    }

    /// The connection hub.
    #[must_use]
    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Local TCP address.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Transport`] if the socket refuses to report it
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and serve connections until shutdown.
    ///
    /// # Errors
    ///
    /// Accept errors are logged and survived; only shutdown ends the loop.
    pub async fn run(self) -> Result<(), ServerError> {
        let sweeper = self.spawn_sweep();

        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!(remote = %peer, error = %e, "set_nodelay failed");
                    }

                    let conn = Connection::new(
                        stream,
                        peer,
                        &self.env,
                        self.config.connection_config(),
                    );

                    if let Some(udp) = &self.udp {
                        conn.attach_udp(udp.lease(peer));
                    }

                    if self.hub.register(Arc::clone(&conn)) {
                        tracing::debug!(session = %conn.id(), remote = %peer, "connection accepted");
                        self.dispatcher.attach(conn);
                    } else {
                        // Astronomically unlikely id collision; refuse the
                        // stranger rather than corrupt the registry.
                        tracing::warn!(remote = %peer, "session id collision; dropping connection");
                        conn.dispose();
                    }
                },
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                },
            }
        }

        sweeper.abort();
        self.hub.close_all(Some("shutdown".to_string())).await;
        tracing::info!("server stopped");
        Ok(())
    }

    /// Maintenance sweep: disconnect idle connections, evict stale rate
    /// buckets, and log channel counters for closing sessions.
    fn spawn_sweep(&self) -> tokio::task::JoinHandle<()> {
        let hub = Arc::clone(&self.hub);
        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown = self.shutdown.clone();
        let interval = self.config.sweep_interval;
        let idle_timeout = self.config.idle_timeout;
        let bucket_idle = self.config.rate_bucket_idle;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {},
                }

                if let Some(limit) = idle_timeout {
                    let limit_ms = limit.as_millis() as u64;
                    for conn in hub.list_connections() {
                        if conn.idle_ms() > limit_ms {
                            let stats = conn.channel().stats();
                            tracing::info!(
                                session = %conn.id(),
                                remote = %conn.remote(),
                                idle_ms = conn.idle_ms(),
                                received = stats.received(),
                                sent = stats.sent(),
                                dropped = stats.dropped(),
                                "disconnecting idle connection"
                            );
                            conn.disconnect(Some("idle timeout".to_string())).await;
                        }
                    }
                }

                let evicted =
                    dispatcher.rate_limiter().evict_idle(bucket_idle, std::time::Instant::now());
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted idle rate buckets");
                }
            }
        })
    }
}
