use thiserror::Error;

/// Errors produced by an upload transport.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload cancelled")]
    Cancelled,

    #[error("upload cancelled by receiver")]
    PeerCancelled,

    #[error("transport error: {0}")]
    Transport(String),
}

impl UploadError {
    /// True for deliberate aborts, which settle as cancelled instead of
    /// entering the retry path.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Cancelled | Self::PeerCancelled)
    }
}
