//! Protocol error types.
//!
//! Framing and packet-structure failures. These are fatal to the connection
//! that produced them: the channel layer closes the socket on any framing
//! error. Dispatch-level failures (rate limits, permissions, handler errors)
//! are a different layer and never appear here.

use thiserror::Error;

/// Result alias for wire-format operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while encoding or decoding wire structures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer too short to contain a packet header.
    #[error("packet too short: need {expected} bytes, have {actual}")]
    PacketTooShort {
        /// Minimum byte count required
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Stream ended in the middle of a frame.
    #[error("truncated frame: expected {expected} payload bytes, got {actual}")]
    TruncatedFrame {
        /// Payload bytes the length prefix promised
        expected: usize,
        /// Payload bytes actually received
        actual: usize,
    },

    /// Length prefix exceeds the configured maximum.
    #[error("oversize frame: {size} bytes exceeds maximum {max}")]
    OversizeFrame {
        /// Declared frame length
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Zero-length frame (a packet is at least a header).
    #[error("framing error: zero-length frame")]
    EmptyFrame,

    /// Reserved header byte carried a non-zero value.
    #[error("framing error: reserved header byte is {0:#04x}, must be zero")]
    ReservedByteSet(u8),

    /// Payload exceeds the absolute protocol cap.
    #[error("payload too large: {size} bytes exceeds maximum {max}")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Protocol cap
        max: usize,
    },

    /// Opcode-0 payload carried an unknown control-type discriminant.
    #[error("unknown control type {0:#04x}")]
    InvalidControlType(u8),

    /// Control directive payload shorter than its fixed layout.
    #[error("directive too short: need {expected} bytes, have {actual}")]
    DirectiveTooShort {
        /// Fixed directive size
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Text packet payload was not valid UTF-8.
    #[error("text packet payload is not valid UTF-8")]
    InvalidUtf8,

    /// Compression or decompression of a payload failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// Transformer applied in an invalid order (e.g. compressing an
    /// already-compressed packet).
    #[error("invalid transform: {0}")]
    InvalidTransform(&'static str),
}
