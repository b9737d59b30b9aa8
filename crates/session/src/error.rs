use thiserror::Error;

/// Errors surfaced by the relay client and room session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("relay connection closed")]
    Closed,

    #[error("a join request is already in flight")]
    AlreadyConnecting,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("cipher error: {0}")]
    Cipher(String),
}
