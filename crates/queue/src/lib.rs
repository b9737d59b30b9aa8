//! Upload task scheduler.
//!
//! A FIFO-with-priority queue bounded by a concurrency limit. The
//! transport is injected through the [`Uploader`] trait, so the
//! scheduler never touches sockets itself. Failed uploads retry on the
//! capped exponential schedule of [`RetryPolicy`]; cancelled ones
//! settle without retrying.

pub mod error;
pub mod policy;
pub mod queue;
pub mod task;
pub mod uploader;

pub use error::UploadError;
pub use policy::RetryPolicy;
pub use queue::{QueueConfig, QueueEvent, UploadQueue};
pub use task::{TaskOptions, UploadItem, UploadStatus, UploadTask};
pub use uploader::{ProgressFn, UploadRequest, Uploader};
