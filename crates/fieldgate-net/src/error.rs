//! Error types for the network crate.

use thiserror::Error;

/// Result type for network operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Network supervision faults.
#[derive(Debug, Error)]
pub enum NetError {
    /// No interface can carry traffic.
    #[error("network unavailable: {0}")]
    Unavailable(String),

    /// A switch attempt did not complete.
    #[error("interface switch failed: {0}")]
    SwitchFailed(String),

    /// The active-mode lock could not be taken in time.
    #[error("lock timed out after {0} ms")]
    LockTimeout(u64),

    /// A socket operation exceeded its deadline.
    #[error("operation timed out after {0} ms")]
    Timeout(u64),
}
