//! Handler error → wire directive classification.
//!
//! The single place where handler failures become (reason, action, flags)
//! triples. Handlers never crash the dispatcher and peers never see a stack
//! trace; they see one of these directives.

use std::io;

use crate::error::HandlerError;
use tidegate_proto::{DirectiveFlags, ProtocolAction, ProtocolReason};

/// Map a handler error to the directive sent on the wire.
///
/// The mapping is authoritative:
///
/// | error family            | reason                  | action          | flags          |
/// |-------------------------|-------------------------|-----------------|----------------|
/// | timeout / cancellation  | `Timeout`               | `Retry`         | `IS_TRANSIENT` |
/// | validation              | `RequestInvalid`        | `FixAndRetry`   | none           |
/// | unauthorized            | `AccountLocked`         | `None`          | none           |
/// | unsupported             | `OperationUnsupported`  | `None`          | none           |
/// | disposed                | `NetworkError`          | `Retry`         | `IS_TRANSIENT` |
/// | I/O (transient kinds)   | `NetworkError`          | `Retry`         | `IS_TRANSIENT` |
/// | I/O (other kinds)       | `NetworkError`          | `Retry`         | none           |
/// | anything else           | `InternalError`         | `None`          | none           |
#[must_use]
pub fn classify(err: &HandlerError) -> (ProtocolReason, ProtocolAction, DirectiveFlags) {
    match err {
        HandlerError::Timeout | HandlerError::Cancelled => {
            (ProtocolReason::Timeout, ProtocolAction::Retry, DirectiveFlags::IS_TRANSIENT)
        },
        HandlerError::Validation(_) => {
            (ProtocolReason::RequestInvalid, ProtocolAction::FixAndRetry, DirectiveFlags::NONE)
        },
        HandlerError::Unauthorized(_) => {
            (ProtocolReason::AccountLocked, ProtocolAction::None, DirectiveFlags::NONE)
        },
        HandlerError::Unsupported(_) => {
            (ProtocolReason::OperationUnsupported, ProtocolAction::None, DirectiveFlags::NONE)
        },
        HandlerError::Disposed => {
            (ProtocolReason::NetworkError, ProtocolAction::Retry, DirectiveFlags::IS_TRANSIENT)
        },
        HandlerError::Io(io_err) => {
            let flags = if is_transient_io(io_err.kind()) {
                DirectiveFlags::IS_TRANSIENT
            } else {
                DirectiveFlags::NONE
            };
            (ProtocolReason::NetworkError, ProtocolAction::Retry, flags)
        },
        HandlerError::Internal(_) => {
            (ProtocolReason::InternalError, ProtocolAction::None, DirectiveFlags::NONE)
        },
    }
}

/// Socket error kinds that indicate a transient condition worth an
/// identical retry. Everything else is still a network error, just not
/// flagged transient.
fn is_transient_io(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::NetworkDown
            | io::ErrorKind::Interrupted
    )
}
