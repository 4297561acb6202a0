//! Shared ancillary UDP transport.
//!
//! One process-wide UDP socket serves every connection. Each connection
//! holds a pooled lease pairing the shared socket with the peer's address;
//! dropping the lease (connection dispose) returns it to the pool. Sends are
//! non-blocking - a full socket buffer surfaces as an I/O error rather than
//! stalling the dispatch path.

use std::{
    net::SocketAddr,
    sync::{Arc, atomic::{AtomicUsize, Ordering}},
};

use tokio::net::UdpSocket;

use tidegate_core::{connection::DatagramSender, error::ChannelError};

use crate::error::ServerError;

/// Process-wide UDP socket shared by all connections.
pub struct SharedUdp {
    socket: Arc<UdpSocket>,
    active_leases: AtomicUsize,
}

impl SharedUdp {
    /// Bind the shared socket.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Config`] on an unparsable address
    /// - [`ServerError::Transport`] if the bind fails
    pub async fn bind(address: &str) -> Result<Arc<Self>, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid udp bind address '{address}': {e}")))?;

        let socket = UdpSocket::bind(addr).await?;
        tracing::info!(local = %socket.local_addr()?, "udp transport bound");

        Ok(Arc::new(Self { socket: Arc::new(socket), active_leases: AtomicUsize::new(0) }))
    }

    /// Local address of the shared socket.
    ///
    /// # Errors
    ///
    /// - [`ServerError::Transport`] if the socket refuses to report it
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    /// Lease the shared transport for one peer.
    #[must_use]
    pub fn lease(self: &Arc<Self>, peer: SocketAddr) -> Box<dyn DatagramSender> {
        self.active_leases.fetch_add(1, Ordering::Relaxed);
        Box::new(UdpLease { pool: Arc::clone(self), peer })
    }

    /// Number of outstanding leases.
    #[must_use]
    pub fn active_leases(&self) -> usize {
        self.active_leases.load(Ordering::Relaxed)
    }
}

/// A connection's handle on the shared UDP socket.
struct UdpLease {
    pool: Arc<SharedUdp>,
    peer: SocketAddr,
}

impl DatagramSender for UdpLease {
    fn try_send(&self, payload: &[u8]) -> Result<(), ChannelError> {
        self.pool
            .socket
            .try_send_to(payload, self.peer)
            .map(|_| ())
            .map_err(ChannelError::from)
    }
}

impl Drop for UdpLease {
    fn drop(&mut self) {
        self.pool.active_leases.fetch_sub(1, Ordering::Relaxed);
    }
}
