//! Server error types.

use thiserror::Error;

/// Errors from the server runtime.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid configuration (bad bind address, zero bounds). Fatal at
    /// startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket-level failure binding or accepting.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Handler table construction failed. Fatal at startup.
    #[error("registration error: {0}")]
    Registration(#[from] tidegate_core::RegistrationError),
}
