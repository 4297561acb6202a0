//! Core error taxonomy.
//!
//! Split by blast radius: [`ChannelError`] is fatal to one connection,
//! [`HandlerError`] is converted into a wire control-fail and never escapes
//! the dispatcher, [`RegistrationError`] aborts startup, and
//! [`DispatchError`] covers internal failures on the reply path.

use thiserror::Error;
use tidegate_crypto::CryptoError;
use tidegate_proto::ProtocolError;

/// Errors on the framed channel's send/receive paths.
///
/// Any of these ends the connection; peers see a clean close or a transient
/// control-fail, never a stack trace.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Send or receive on a channel that is closing, closed, or disposed.
    #[error("channel closed")]
    Closed,

    /// RX-side framing corruption (oversize, truncated, malformed).
    #[error(transparent)]
    Framing(#[from] ProtocolError),

    /// Socket I/O failure.
    #[error("network error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Errors a packet handler may return.
///
/// The dispatcher classifies these into the wire (reason, action, flags)
/// triple - see [`crate::dispatch::classify`]. Handlers never crash the
/// dispatcher: panics are contained and classified as internal errors.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Malformed or semantically invalid request.
    #[error("request validation failed: {0}")]
    Validation(String),

    /// Caller is not allowed to perform this operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Operation is not supported by this server.
    #[error("operation not supported: {0}")]
    Unsupported(String),

    /// The handler gave up waiting on something.
    #[error("timed out")]
    Timeout,

    /// The dispatch was cancelled (connection closing).
    #[error("cancelled")]
    Cancelled,

    /// An object the handler needed was already disposed.
    #[error("object disposed")]
    Disposed,

    /// Socket or filesystem I/O failure inside the handler.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Registration-time failures. These abort startup - a half-registered
/// handler table must never serve traffic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// Two handlers claimed the same opcode.
    #[error("duplicate opcode {0:#06x}")]
    DuplicateOpcode(u16),

    /// Opcode 0 is reserved for control packets.
    #[error("opcode 0 is reserved for control packets")]
    ReservedOpcode,

    /// A controller produced no handler registrations.
    #[error("controller registered no handlers")]
    EmptyController,
}

/// Internal dispatch failures on the reply path.
///
/// These are logged, not sent: if the reply path itself is broken there is
/// nothing useful to tell the peer.
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Sending the reply or directive failed.
    #[error("send failed: {0}")]
    Send(#[from] ChannelError),

    /// Encrypting the outbound packet failed.
    #[error("reply encryption failed: {0}")]
    Crypto(#[from] CryptoError),

    /// Encoding the outbound packet failed.
    #[error("reply encoding failed: {0}")]
    Protocol(#[from] ProtocolError),
}
