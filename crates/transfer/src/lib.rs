//! File transfer over peer sub-channels.
//!
//! Each file travels on its own sub-channel, labeled by the upload task
//! id. The sender declares the file with a `META` control message,
//! streams raw binary chunks under backpressure, closes the stream with
//! `EOF` and waits for the receiver's `ACK`. Either side can abort with
//! `CANCEL` at any point; a peer abort is reported distinctly from a
//! local one so the queue never retries a deliberate cancellation.

mod progress;
mod receiver;
mod sender;
mod uploader;

pub use progress::SpeedMeter;
pub use receiver::{ReceiveEvent, ReceiveItem, ReceiveStatus, ReceivedFile, Receiver};
pub use sender::{send_file, send_file_chunked};
pub use uploader::ChannelUploader;

/// Default chunk size: 64 KiB.
///
/// Small enough to keep per-chunk progress granular, large enough that
/// frame overhead stays negligible against the socket buffer.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Errors from receiver-side file handling.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file name: {0}")]
    InvalidName(String),
}
