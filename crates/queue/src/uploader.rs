use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::UploadError;

/// Progress callback: percentage (0..=100) and an optional rolling
/// throughput sample in Mbit/s.
pub type ProgressFn = Arc<dyn Fn(u8, Option<f64>) + Send + Sync>;

/// Everything a transport needs to move one file.
#[derive(Clone)]
pub struct UploadRequest {
    /// Task id; chunked transports also use it as the sub-channel label.
    pub id: String,
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mime: String,
    /// Fires on local cancel and on session teardown.
    pub cancel: CancellationToken,
    pub progress: ProgressFn,
}

/// An upload transport.
///
/// Returns a boxed future so implementations can live behind `dyn`.
pub trait Uploader: Send + Sync {
    fn upload(
        &self,
        request: UploadRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), UploadError>> + Send + '_>>;
}
