//! Tidegate runtime core.
//!
//! The four subsystems that make up the runtime:
//!
//! - [`channel`] - per-connection framed socket channel: owns the stream,
//!   produces whole packets into a bounded queue, serializes outbound writes.
//! - [`connection`] - session glue: identity, cipher state, lifecycle events,
//!   and the Open → Closing → Closed → Disposed state machine.
//! - [`hub`] - thread-safe registry of live connections with username
//!   indexing and broadcast.
//! - [`dispatch`] - opcode-routed handler table behind a pre/post middleware
//!   pipeline with rate-limit, permission, encryption, and timeout policy.
//!
//! Supporting pieces: the per-endpoint token-bucket [`rate`] limiter, the
//! [`env`] abstraction over time and randomness, and small rent/return
//! [`pool`]s used on the dispatch hot path.
//!
//! # Concurrency model
//!
//! One receive task per connection produces packets serially; the dispatch
//! task attached to a connection consumes them in arrival order, so packets
//! from one connection are handled FIFO while packets from different
//! connections dispatch concurrently. Outbound frames on a connection are
//! serialized by the channel. Hub maps are concurrent; no global lock is
//! taken on the hot path.

#![forbid(unsafe_code)]

pub mod channel;
pub mod connection;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod hub;
pub mod permission;
pub mod pool;
pub mod rate;

pub use channel::{ChannelConfig, ChannelStats, FramedChannel, OverflowPolicy};
pub use connection::{CloseReason, Connection, ConnectionConfig, ConnectionState, SessionId};
pub use dispatch::{
    DispatchContext, Dispatcher, DispatcherBuilder, HandlerDescriptor, HandlerRegistration,
    HandlerReply, Middleware, Next, PacketController, PacketHandler, handler_fn,
};
pub use env::Environment;
pub use error::{ChannelError, DispatchError, HandlerError, RegistrationError};
pub use hub::{BroadcastOutcome, ConnectionHub};
pub use permission::PermissionLevel;
pub use pool::Pool;
pub use rate::{RateLimiter, RatePolicy};
