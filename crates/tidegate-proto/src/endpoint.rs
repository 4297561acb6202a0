//! Normalized endpoint key for rate maps and routing.
//!
//! Wraps an IP address (IPv4-mapped IPv6 collapses to IPv4) plus an optional
//! port. Equality and hashing are structural over the normalized components,
//! so `::ffff:10.0.0.1` and `10.0.0.1` key the same rate bucket while a true
//! IPv6 address with the same low bits does not.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

/// Normalized (address, optional port) map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    addr: IpAddr,
    port: Option<u16>,
}

impl EndpointKey {
    /// Key over an address only (per-address rate buckets).
    #[must_use]
    pub fn from_addr(addr: IpAddr) -> Self {
        Self { addr: normalize(addr), port: None }
    }

    /// Key over an address and port (per-endpoint rate buckets).
    #[must_use]
    pub fn from_socket(socket: SocketAddr) -> Self {
        Self { addr: normalize(socket.ip()), port: Some(socket.port()) }
    }

    /// Normalized address.
    #[must_use]
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Port, if this key includes one.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Whether the normalized address is IPv6.
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Copy of this key without its port.
    #[must_use]
    pub fn without_port(&self) -> Self {
        Self { addr: self.addr, port: None }
    }
}

/// Collapse IPv4-mapped IPv6 addresses to IPv4.
fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
        v4 @ IpAddr::V4(_) => v4,
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.addr, self.port) {
            (IpAddr::V6(addr), Some(port)) => write!(f, "[{addr}]:{port}"),
            (addr, Some(port)) => write!(f, "{addr}:{port}"),
            (addr, None) => write!(f, "{addr}"),
        }
    }
}

impl From<SocketAddr> for EndpointKey {
    fn from(socket: SocketAddr) -> Self {
        Self::from_socket(socket)
    }
}

impl From<IpAddr> for EndpointKey {
    fn from(addr: IpAddr) -> Self {
        Self::from_addr(addr)
    }
}
