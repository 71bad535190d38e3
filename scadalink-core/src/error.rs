use thiserror::Error;

/// Main error type for scadalink operations
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Address lookup failed: {0}")]
    Lookup(String),

    #[error("Timeout")]
    Timeout,

    #[error("Session handshake failed: {0}")]
    Handshake(String),

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias for scadalink operations
pub type LinkResult<T> = Result<T, LinkError>;
