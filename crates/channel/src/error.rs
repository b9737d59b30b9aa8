use thiserror::Error;

/// Errors produced by peer connections and sub-channels.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out: {0}")]
    Timeout(&'static str),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("channel \"{0}\" is already open")]
    AlreadyOpen(String),

    #[error("connection failed")]
    ConnectionFailed,

    #[error("connection closed")]
    Closed,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("cancelled")]
    Cancelled,
}
