//! Error types for Streamnet

use thiserror::Error;

use crate::endpoint::Mode;
use crate::transport::SocketId;

/// Main error type for Streamnet
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection rejected by peer")]
    ConnectionRejected,

    #[error("Timeout")]
    Timeout,

    #[error("Socket closed")]
    Closed,

    #[error("Invalid socket: {0}")]
    InvalidSocket(SocketId),

    #[error("Not connected")]
    NotConnected,

    #[error("A target socket is required in server mode")]
    MissingTarget,

    #[error("Endpoint is already running in {0:?} mode")]
    AlreadyRunning(Mode),

    #[error("Missing callback: {0}")]
    MissingCallback(&'static str),

    #[error("Payload of {size} bytes exceeds the transport maximum of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Operation would block")]
    WouldBlock,
}

impl Error {
    /// True for errors that fail a client start regardless of the
    /// `fail_on_connection_error` setting: the configuration itself is
    /// unusable, so retrying in the background cannot succeed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Config(_)
                | Error::InvalidAddress(_)
                | Error::AlreadyRunning(_)
                | Error::MissingCallback(_)
        )
    }
}

/// Result type alias for Streamnet
pub type Result<T> = std::result::Result<T, Error>;
