//! Framed socket channel: exclusive owner of a connection's stream.
//!
//! The channel splits the stream, runs a receive task that turns the byte
//! stream into whole packets, and serializes all outbound writes so a frame
//! is never interleaved with another. Nothing else touches the socket; the
//! connection routes every send through here.
//!
//! # Framing
//!
//! Each packet is preceded by a 4-byte little-endian length prefix counting
//! the packet bytes that follow. The receive state machine reads the prefix,
//! reads exactly that many payload bytes, enqueues the payload as an
//! immutable buffer, and loops. A prefix above the configured maximum fails
//! the channel; end-of-stream between frames is a clean close, mid-frame is
//! a truncated-frame failure.
//!
//! # Backpressure
//!
//! The incoming queue is bounded. Overflow behavior is configurable via
//! [`OverflowPolicy`]; the default drops the oldest queued packet and bumps
//! the dropped counter.

use std::{
    collections::VecDeque,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Instant,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Notify,
};
use tokio_util::sync::CancellationToken;

use crate::{
    connection::CloseReason,
    error::ChannelError,
    pool::BufferPool,
};
use tidegate_proto::{LENGTH_PREFIX_SIZE, PacketHeader, ProtocolError};

/// Stream the channel can own: any async byte stream.
///
/// Production passes a `TcpStream`; tests pass one half of
/// `tokio::io::duplex`.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

/// Boxed stream owned by a channel.
pub type BoxedStream = Box<dyn StreamIo>;

/// Behavior when the incoming queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Discard the packet that just arrived.
    DropNewest,
    /// Discard the oldest queued packet and keep the new one.
    #[default]
    DropOldest,
    /// Suspend the receive task until the consumer drains a slot.
    Block,
    /// Replace a queued packet with the same opcode; fall back to
    /// `DropOldest` when none matches.
    CoalesceByOpcode,
}

/// Channel configuration, immutable after construction.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Maximum frame length accepted from the peer (bytes).
    pub max_frame_len: usize,
    /// Incoming queue capacity (packets).
    pub queue_capacity: usize,
    /// Overflow behavior when the queue is full.
    pub overflow: OverflowPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 1024 * 1024,
            queue_capacity: 64,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Monotonic channel counters.
#[derive(Debug, Default)]
pub struct ChannelStats {
    received: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl ChannelStats {
    /// Frames received and enqueued.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Frames written to the socket.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Packets discarded by the overflow policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;
type DisconnectHook = Box<dyn Fn(CloseReason) + Send + Sync>;

/// Per-connection framed channel.
///
/// # Invariants
///
/// - Only this channel mutates the stream; the read half lives in the
///   receive task, the write half behind the writer lock.
/// - A single frame is never interleaved with another: every send holds the
///   writer lock for the whole prefix+body write.
/// - The disconnected callback fires at most once, whatever combination of
///   remote EOF, I/O failure, and local close races it.
pub struct FramedChannel {
    /// Write half, serialized. `None` after dispose.
    writer: tokio::sync::Mutex<Option<WriteHalf<BoxedStream>>>,
    /// Read half, parked here between `new` and `start`.
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,

    queue: Mutex<VecDeque<Bytes>>,
    /// Signalled when the queue gains a packet or the RX task exits.
    readable: Notify,
    /// Signalled when the consumer frees a slot (Block policy).
    writable: Notify,

    config: ChannelConfig,
    stats: ChannelStats,

    /// Rejects sends once closing begins.
    closed: AtomicBool,
    /// RX task has exited; `next_packet` drains then returns `None`.
    rx_done: AtomicBool,
    disconnect_fired: AtomicBool,

    epoch: Instant,
    /// Milliseconds since `epoch` of the last successful receive.
    last_ping_ms: AtomicU64,

    on_packet: Mutex<Option<Hook>>,
    on_post_send: Mutex<Option<Hook>>,
    on_disconnect: Mutex<Option<DisconnectHook>>,

    cancel: CancellationToken,
    tx_buffers: BufferPool,
}

impl FramedChannel {
    /// Create a channel owning `stream`. The receive task does not run until
    /// [`start`](Self::start) - wire callbacks first.
    #[must_use]
    pub fn new(
        stream: impl StreamIo + 'static,
        config: ChannelConfig,
        cancel: CancellationToken,
    ) -> std::sync::Arc<Self> {
        let boxed: BoxedStream = Box::new(stream);
        let (read_half, write_half) = tokio::io::split(boxed);

        std::sync::Arc::new(Self {
            writer: tokio::sync::Mutex::new(Some(write_half)),
            reader: Mutex::new(Some(read_half)),
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity)),
            readable: Notify::new(),
            writable: Notify::new(),
            config,
            stats: ChannelStats::default(),
            closed: AtomicBool::new(false),
            rx_done: AtomicBool::new(false),
            disconnect_fired: AtomicBool::new(false),
            epoch: Instant::now(),
            last_ping_ms: AtomicU64::new(0),
            on_packet: Mutex::new(None),
            on_post_send: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            cancel,
            tx_buffers: BufferPool::new(4),
        })
    }

    /// Spawn the receive task. Call once, after callbacks are wired; later
    /// calls are no-ops.
    pub fn start(self: &std::sync::Arc<Self>) {
        let Some(reader) = lock(&self.reader).take() else {
            return;
        };
        let this = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            this.rx_loop(reader).await;
        });
    }

    /// Set the callback invoked once per packet enqueued.
    pub fn set_packet_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.on_packet) = Some(Box::new(hook));
    }

    /// Set the callback invoked after each successful send.
    pub fn set_post_send_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *lock(&self.on_post_send) = Some(Box::new(hook));
    }

    /// Set the callback invoked when the channel disconnects (at most once).
    pub fn set_disconnect_hook(&self, hook: impl Fn(CloseReason) + Send + Sync + 'static) {
        *lock(&self.on_disconnect) = Some(Box::new(hook));
    }

    /// Channel counters.
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    /// Milliseconds since channel construction.
    pub fn uptime_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Milliseconds (since construction) of the last successful receive.
    pub fn last_ping_ms(&self) -> u64 {
        self.last_ping_ms.load(Ordering::Relaxed)
    }

    /// Milliseconds since the last successful receive.
    pub fn idle_ms(&self) -> u64 {
        self.uptime_ms().saturating_sub(self.last_ping_ms())
    }

    /// Whether sends are still accepted.
    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Cancellation token tied to this channel's lifetime.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Pop the next whole packet, waiting if the queue is empty.
    ///
    /// Returns `None` once the receive task has exited and the queue is
    /// drained.
    pub async fn next_packet(&self) -> Option<Bytes> {
        loop {
            let waiter = self.readable.notified();
            {
                let mut queue = lock(&self.queue);
                if let Some(payload) = queue.pop_front() {
                    drop(queue);
                    self.writable.notify_one();
                    return Some(payload);
                }
                if self.rx_done.load(Ordering::Acquire) {
                    return None;
                }
            }
            waiter.await;
        }
    }

    /// Pop a packet without waiting.
    pub fn try_next_packet(&self) -> Option<Bytes> {
        let payload = lock(&self.queue).pop_front();
        if payload.is_some() {
            self.writable.notify_one();
        }
        payload
    }

    /// Number of packets waiting in the incoming queue.
    pub fn queued(&self) -> usize {
        lock(&self.queue).len()
    }

    /// Send one frame: length prefix plus `frame` bytes, written atomically
    /// with respect to other senders.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Closed`] once closing has begun
    /// - [`ChannelError::Framing`] if `frame` is empty or beyond the
    ///   configured maximum
    /// - [`ChannelError::Io`] on socket failure (the channel then closes)
    pub async fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if frame.is_empty() {
            return Err(ChannelError::Framing(ProtocolError::EmptyFrame));
        }
        if frame.len() > self.config.max_frame_len {
            return Err(ChannelError::Framing(ProtocolError::OversizeFrame {
                size: frame.len(),
                max: self.config.max_frame_len,
            }));
        }

        let mut buf = self.tx_buffers.rent_buffer();
        buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        buf.extend_from_slice(frame);

        let result = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(w) => w.write_all(&buf).await,
                None => {
                    self.tx_buffers.give(buf);
                    return Err(ChannelError::Closed);
                },
            }
        };
        self.tx_buffers.give(buf);

        match result {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                if let Some(hook) = lock(&self.on_post_send).as_ref() {
                    hook();
                }
                Ok(())
            },
            Err(e) => {
                let msg = e.to_string();
                self.fail(CloseReason::Network(msg.clone()));
                Err(ChannelError::Io(msg))
            },
        }
    }

    /// Fire-and-forget send from a shared handle; failures are logged.
    pub fn spawn_send(self: &std::sync::Arc<Self>, frame: Bytes) {
        let this = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.send(&frame).await {
                tracing::debug!(error = %e, "detached send failed");
            }
        });
    }

    /// Stop the channel.
    ///
    /// With `force = false` the writer is flushed and shut down so a pending
    /// outbound frame drains; with `force = true` everything is cancelled
    /// immediately.
    pub async fn close(&self, force: bool) {
        self.closed.store(true, Ordering::Release);

        if !force {
            let mut writer = self.writer.lock().await;
            if let Some(w) = writer.as_mut() {
                let _ = w.flush().await;
                let _ = w.shutdown().await;
            }
        }

        self.cancel.cancel();
    }

    /// Synchronous teardown: reject sends, cancel the receive task, release
    /// the write half if nobody is mid-send. Idempotent.
    pub fn dispose(&self) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();

        // A concurrent send holds the lock; the half is then dropped with
        // the channel instead.
        if let Ok(mut writer) = self.writer.try_lock() {
            *writer = None;
        }
    }

    /// Mark the channel failed and fire the disconnect hook (once).
    fn fail(&self, reason: CloseReason) {
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
        self.fire_disconnect(reason);
    }

    fn fire_disconnect(&self, reason: CloseReason) {
        if self.disconnect_fired.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(hook) = lock(&self.on_disconnect).as_ref() {
            hook(reason);
        }
    }

    /// Receive loop: prefix, payload, enqueue, repeat.
    async fn rx_loop(self: std::sync::Arc<Self>, mut reader: ReadHalf<BoxedStream>) {
        let reason = loop {
            let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
            let got = tokio::select! {
                () = self.cancel.cancelled() => break CloseReason::LocalClosed(None),
                r = fill(&mut reader, &mut prefix) => r,
            };

            let filled = match got {
                Ok(n) => n,
                Err(e) => break CloseReason::Network(e.to_string()),
            };
            if filled == 0 {
                // EOF between frames: clean remote close.
                break CloseReason::RemoteClosed;
            }
            if filled < LENGTH_PREFIX_SIZE {
                break CloseReason::Framing(ProtocolError::TruncatedFrame {
                    expected: LENGTH_PREFIX_SIZE,
                    actual: filled,
                });
            }

            let len = u32::from_le_bytes(prefix) as usize;
            if len == 0 {
                break CloseReason::Framing(ProtocolError::EmptyFrame);
            }
            if len > self.config.max_frame_len {
                break CloseReason::Framing(ProtocolError::OversizeFrame {
                    size: len,
                    max: self.config.max_frame_len,
                });
            }

            let mut payload = vec![0u8; len];
            let got = tokio::select! {
                () = self.cancel.cancelled() => break CloseReason::LocalClosed(None),
                r = fill(&mut reader, &mut payload) => r,
            };
            match got {
                Ok(n) if n == len => {},
                Ok(n) => {
                    break CloseReason::Framing(ProtocolError::TruncatedFrame {
                        expected: len,
                        actual: n,
                    });
                },
                Err(e) => break CloseReason::Network(e.to_string()),
            }

            let enqueued = self.enqueue(Bytes::from(payload)).await;
            self.last_ping_ms.store(self.uptime_ms(), Ordering::Relaxed);
            self.stats.received.fetch_add(1, Ordering::Relaxed);

            if enqueued {
                if let Some(hook) = lock(&self.on_packet).as_ref() {
                    hook();
                }
            }
            self.readable.notify_one();
        };

        if matches!(reason, CloseReason::Framing(_) | CloseReason::Network(_)) {
            self.closed.store(true, Ordering::Release);
        }

        self.rx_done.store(true, Ordering::Release);
        self.readable.notify_waiters();
        self.fire_disconnect(reason);
    }

    /// Apply the overflow policy and enqueue. Returns whether the new packet
    /// ended up in the queue.
    async fn enqueue(&self, payload: Bytes) -> bool {
        loop {
            let waiter = self.writable.notified();
            {
                let mut queue = lock(&self.queue);
                if queue.len() < self.config.queue_capacity {
                    queue.push_back(payload);
                    return true;
                }

                match self.config.overflow {
                    OverflowPolicy::DropNewest => {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        return false;
                    },
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        queue.push_back(payload);
                        return true;
                    },
                    OverflowPolicy::CoalesceByOpcode => {
                        let opcode = peek_opcode(&payload);
                        if let Some(slot) =
                            queue.iter_mut().find(|queued| peek_opcode(queued) == opcode)
                        {
                            *slot = payload;
                            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                            return true;
                        }
                        queue.pop_front();
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        queue.push_back(payload);
                        return true;
                    },
                    OverflowPolicy::Block => {},
                }
            }
            // Block policy: wait for the consumer to free a slot, then
            // retry. Cancellation aborts the wait.
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = waiter => {},
            }
        }
    }
}

/// Opcode of a queued frame body (first two little-endian bytes).
fn peek_opcode(frame: &Bytes) -> Option<u16> {
    PacketHeader::from_bytes(frame).ok().map(|h| h.opcode())
}

/// Read until `buf` is full or EOF. Returns bytes read.
async fn fill(
    reader: &mut ReadHalf<BoxedStream>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
