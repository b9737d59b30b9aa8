pub mod constants;
pub mod control;
pub mod events;
pub mod ids;
pub mod types;

// Re-export primary types for convenience.
pub use control::ControlMessage;
pub use events::{ClientEvent, ServerEvent};
pub use types::{FileMeta, NetworkClient, RejectReason};
