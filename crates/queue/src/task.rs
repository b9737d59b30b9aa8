use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Lifecycle of an upload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Waiting,
    Uploading,
    Done,
    Error,
    Cancelled,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Uploading => "uploading",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling options for a batch of added files.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskOptions {
    /// Higher runs first; ties keep submission order. Defaults to 0.
    pub priority: Option<i32>,
    /// Overrides the policy's retry budget for these tasks.
    pub max_retries: Option<u32>,
}

/// A scheduled upload. Clones share the cancellation token.
#[derive(Debug, Clone)]
pub struct UploadTask {
    pub id: String,
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub priority: i32,
    pub retries: u32,
    pub max_retries: u32,
    pub cancel: CancellationToken,
}

/// View model of a task, published to presentation code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadItem {
    pub id: String,
    pub name: String,
    pub size: u64,
    /// 0..=100.
    pub progress: u8,
    pub speed_mbps: f64,
    pub status: UploadStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Guesses a MIME type from the file extension. Empty when unknown;
/// receivers treat it as opaque metadata either way.
pub fn mime_for_path(path: &Path) -> String {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("json") => "application/json",
        Some("txt" | "log") => "text/plain",
        Some("html") => "text/html",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        _ => "",
    }
    .to_string()
}
