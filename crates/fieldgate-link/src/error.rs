//! Error types for the configuration link.

use thiserror::Error;

/// Result type for link operations.
pub type Result<T> = std::result::Result<T, LinkError>;

/// Faults on the configuration link.
#[derive(Debug, Error)]
pub enum LinkError {
    /// Outbound response exceeds the transport cap.
    #[error("response of {0} bytes exceeds the {1} byte cap")]
    FragOversize(usize, usize),

    /// MTU negotiation did not complete.
    #[error("MTU negotiation timed out")]
    MtuTimeout,

    /// The link is gone.
    #[error("link closed")]
    Closed,

    /// Inbound reassembly buffer overran its cap.
    #[error("inbound message exceeds {0} bytes")]
    InboundOverflow(usize),

    /// Malformed command payload.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// Outbound send failed at the transport layer.
    #[error("send failed: {0}")]
    Send(String),

    #[error("lock timed out after {0} ms")]
    LockTimeout(u64),
}
