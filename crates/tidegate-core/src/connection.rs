//! Connection: identity, cipher state, and lifecycle over a framed channel.
//!
//! A connection glues a [`FramedChannel`] to a 128-bit session identifier,
//! the per-connection 32-byte secret, permission and cipher-suite tags, and
//! three lifecycle events: close (at most once), packet-ready, and
//! post-send.
//!
//! # State machine
//!
//! ```text
//! Open ──► Closing ──► Closed ──► Disposed
//! ```
//!
//! The first of `close`, `disconnect`, or channel EOF moves Open → Closing;
//! dispatching the close event moves Closing → Closed; `dispose` moves
//! Closed → Disposed. No transition goes back. Sends in Closing or later
//! fail.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
};

use bytes::BytesMut;
use tokio_util::sync::CancellationToken;

use crate::{
    channel::{ChannelConfig, FramedChannel, StreamIo},
    env::Environment,
    error::ChannelError,
    permission::PermissionLevel,
};
use tidegate_crypto::{CipherSuite, CryptoError, SessionSecret};
use tidegate_proto::{EndpointKey, Packet, ProtocolError};

/// Opaque 128-bit session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u128);

impl SessionId {
    /// Serialized length.
    pub const SIZE: usize = 16;

    /// Wrap a raw value.
    #[must_use]
    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// Raw value.
    #[must_use]
    pub fn to_u128(self) -> u128 {
        self.0
    }

    /// Serialize to 16 little-endian bytes.
    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        self.0.to_le_bytes()
    }

    /// Parse from serialized bytes. `None` unless exactly 16 bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; Self::SIZE] = bytes.try_into().ok()?;
        Some(Self(u128::from_le_bytes(arr)))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the stream between frames.
    RemoteClosed,
    /// Local close or disconnect, with optional reason text.
    LocalClosed(Option<String>),
    /// RX framing corruption (fatal).
    Framing(ProtocolError),
    /// Socket I/O failure.
    Network(String),
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    /// Accepting traffic.
    Open = 0,
    /// Close initiated; events not yet dispatched.
    Closing = 1,
    /// Close event dispatched.
    Closed = 2,
    /// Resources released.
    Disposed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            2 => Self::Closed,
            _ => Self::Disposed,
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    /// Framed channel settings.
    pub channel: ChannelConfig,
}

/// Ancillary datagram transport a connection may hold.
///
/// One process-wide UDP socket is shared by all connections; each lease
/// carries the peer address and returns to its pool when dropped.
pub trait DatagramSender: Send + Sync {
    /// Send one datagram to the connection's peer without blocking.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Io`] if the socket rejects the datagram
    fn try_send(&self, payload: &[u8]) -> Result<(), ChannelError>;
}

/// Subscription handle for a close hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

type CloseHook = Box<dyn Fn(&CloseReason) + Send + Sync>;

/// A live session.
///
/// # Invariants
///
/// - Once disposed, no further events fire.
/// - The secret setter is atomic with respect to readers: readers clone the
///   current `Arc`, writers swap the whole reference under the lock.
/// - Close is idempotent and signals the close hooks at most once (guarded
///   by a compare-and-swap flag).
pub struct Connection {
    id: SessionId,
    remote: EndpointKey,
    remote_addr: SocketAddr,
    channel: Arc<FramedChannel>,

    secret: Mutex<Option<Arc<SessionSecret>>>,
    permission: AtomicU8,
    suite: AtomicU8,

    state: AtomicU8,
    close_fired: AtomicBool,
    cancel: CancellationToken,

    close_hooks: Mutex<Vec<(u64, CloseHook)>>,
    next_hook_id: AtomicU64,

    udp: Mutex<Option<Box<dyn DatagramSender>>>,
}

impl Connection {
    /// Take ownership of a freshly accepted stream.
    ///
    /// Allocates a session identifier from the environment, builds the
    /// framed channel, wires the channel's disconnected callback to the
    /// close event, and starts the receive task.
    pub fn new<E: Environment>(
        stream: impl StreamIo + 'static,
        remote_addr: SocketAddr,
        env: &E,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let channel = FramedChannel::new(stream, config.channel, cancel.child_token());

        let conn = Arc::new(Self {
            id: SessionId::from_u128(env.random_u128()),
            remote: EndpointKey::from_socket(remote_addr),
            remote_addr,
            channel: Arc::clone(&channel),
            secret: Mutex::new(None),
            permission: AtomicU8::new(PermissionLevel::None.to_u8()),
            suite: AtomicU8::new(CipherSuite::default().to_u8()),
            state: AtomicU8::new(ConnectionState::Open.to_u8_state()),
            close_fired: AtomicBool::new(false),
            cancel,
            close_hooks: Mutex::new(Vec::new()),
            next_hook_id: AtomicU64::new(1),
            udp: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&conn);
        channel.set_disconnect_hook(move |reason| {
            if let Some(conn) = weak.upgrade() {
                conn.on_channel_closed(reason);
            }
        });
        channel.start();

        conn
    }

    /// Session identifier.
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Normalized remote endpoint key.
    #[must_use]
    pub fn remote(&self) -> EndpointKey {
        self.remote
    }

    /// Raw remote socket address.
    #[must_use]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The framed channel carrying this connection's traffic.
    #[must_use]
    pub fn channel(&self) -> &Arc<FramedChannel> {
        &self.channel
    }

    /// Milliseconds since the connection was constructed.
    #[must_use]
    pub fn uptime_ms(&self) -> u64 {
        self.channel.uptime_ms()
    }

    /// Milliseconds since the last successful receive.
    #[must_use]
    pub fn idle_ms(&self) -> u64 {
        self.channel.idle_ms()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the connection has passed Open.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.state() > ConnectionState::Open
    }

    /// Cancellation token linked to the socket lifetime.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Resolves when the connection is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Current session secret, if one has been set.
    #[must_use]
    pub fn secret(&self) -> Option<Arc<SessionSecret>> {
        lock(&self.secret).clone()
    }

    /// Replace the session secret.
    ///
    /// # Errors
    ///
    /// - [`CryptoError::InvalidSecretLength`] unless exactly 32 bytes
    pub fn set_secret(&self, bytes: &[u8]) -> Result<(), CryptoError> {
        let secret = SessionSecret::from_slice(bytes)?;
        *lock(&self.secret) = Some(Arc::new(secret));
        Ok(())
    }

    /// Permission level.
    #[must_use]
    pub fn permission(&self) -> PermissionLevel {
        PermissionLevel::from_u8(self.permission.load(Ordering::Relaxed))
            .unwrap_or(PermissionLevel::None)
    }

    /// Update the permission level.
    pub fn set_permission(&self, level: PermissionLevel) {
        self.permission.store(level.to_u8(), Ordering::Relaxed);
    }

    /// Cipher suite tag.
    #[must_use]
    pub fn suite(&self) -> CipherSuite {
        CipherSuite::from_u8(self.suite.load(Ordering::Relaxed)).unwrap_or_default()
    }

    /// Update the cipher suite tag.
    pub fn set_suite(&self, suite: CipherSuite) {
        self.suite.store(suite.to_u8(), Ordering::Relaxed);
    }

    /// Subscribe to the close event. The hook fires at most once.
    pub fn on_close(&self, hook: impl Fn(&CloseReason) + Send + Sync + 'static) -> HookId {
        let id = self.next_hook_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.close_hooks).push((id, Box::new(hook)));
        HookId(id)
    }

    /// Remove a close subscription.
    pub fn remove_close_hook(&self, id: HookId) {
        lock(&self.close_hooks).retain(|(hook_id, _)| *hook_id != id.0);
    }

    /// Subscribe to the post-send event (fires after each successful send).
    pub fn on_post_process(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.channel.set_post_send_hook(hook);
    }

    /// Subscribe to the packet-ready event (fires once per packet queued).
    pub fn on_process(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.channel.set_packet_hook(hook);
    }

    /// Send a raw pre-encoded frame over TCP.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] once closing has begun
    /// - channel errors otherwise
    pub async fn send_bytes(&self, frame: &[u8]) -> Result<(), ChannelError> {
        if self.is_closing() {
            return Err(ChannelError::Closed);
        }
        self.channel.send(frame).await
    }

    /// Encode and send a packet over TCP.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] once closing has begun
    /// - [`ChannelError::Framing`] if the packet fails to encode
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), ChannelError> {
        if self.is_closing() {
            return Err(ChannelError::Closed);
        }
        let mut buf = BytesMut::with_capacity(packet.wire_len());
        packet.encode(&mut buf)?;
        self.channel.send(&buf).await
    }

    /// Attach a pooled datagram lease for ancillary UDP sends.
    pub fn attach_udp(&self, sender: Box<dyn DatagramSender>) {
        *lock(&self.udp) = Some(sender);
    }

    /// Send one datagram to the peer via the attached UDP lease.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] if closing or no lease is attached
    /// - [`ChannelError::Io`] if the socket rejects the datagram
    pub fn send_datagram(&self, payload: &[u8]) -> Result<(), ChannelError> {
        if self.is_closing() {
            return Err(ChannelError::Closed);
        }
        match lock(&self.udp).as_ref() {
            Some(udp) => udp.try_send(payload),
            None => Err(ChannelError::Closed),
        }
    }

    /// Close the connection.
    ///
    /// With `force = false` the channel drains a pending outbound frame
    /// first; with `force = true` everything cancels immediately. Idempotent;
    /// the close event fires at most once across all callers.
    pub async fn close(&self, force: bool) {
        if !self.begin_close() {
            return;
        }
        self.channel.close(force).await;
        self.finish_close(&CloseReason::LocalClosed(None));
    }

    /// Forcibly disconnect with an optional reason.
    pub async fn disconnect(&self, reason: Option<String>) {
        if !self.begin_close() {
            return;
        }
        self.channel.close(true).await;
        self.finish_close(&CloseReason::LocalClosed(reason));
    }

    /// Release resources: cancel pending operations, tear down the channel,
    /// return the UDP lease to its pool. Idempotent.
    pub fn dispose(&self) {
        let prev = self.state.swap(ConnectionState::Disposed.to_u8_state(), Ordering::AcqRel);
        if prev == ConnectionState::Disposed.to_u8_state() {
            return;
        }

        self.cancel.cancel();
        self.channel.dispose();

        // Lease returns to its pool on drop.
        *lock(&self.udp) = None;
    }

    /// Move Open → Closing. Returns whether this caller won the transition.
    fn begin_close(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Open.to_u8_state(),
                ConnectionState::Closing.to_u8_state(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Dispatch the close event (at most once) and settle in Closed.
    fn finish_close(&self, reason: &CloseReason) {
        if self.close_fired.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cancel.cancel();

        // Drain before invoking: a hook may unsubscribe itself (the hub
        // does) and must not deadlock against this lock. Close fires once,
        // so the drained list is never needed again.
        let hooks = std::mem::take(&mut *lock(&self.close_hooks));

        // Disposed connections fire no further events.
        if self.state() != ConnectionState::Disposed {
            for (_, hook) in &hooks {
                hook(reason);
            }
        }

        let _ = self.state.compare_exchange(
            ConnectionState::Closing.to_u8_state(),
            ConnectionState::Closed.to_u8_state(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Channel disconnected callback: remote EOF, framing failure, or I/O
    /// error on either direction.
    fn on_channel_closed(&self, reason: CloseReason) {
        self.begin_close();
        self.finish_close(&reason);
    }
}

impl ConnectionState {
    fn to_u8_state(self) -> u8 {
        self as u8
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .field("permission", &self.permission())
            .field("suite", &self.suite())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
