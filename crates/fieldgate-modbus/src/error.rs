//! Error type for polling operations.

use thiserror::Error;

/// Result type for Modbus operations.
pub type Result<T> = std::result::Result<T, ModbusError>;

/// Faults raised by the polling drivers.
#[derive(Debug, Error)]
pub enum ModbusError {
    #[error("connection failed: {0}")]
    Connection(String),

    /// The device did not answer within its configured timeout.
    #[error("read timed out after {0} ms")]
    Timeout(u64),

    /// Protocol-level failure (framing, CRC, unexpected length).
    #[error("read failed: {0}")]
    Read(String),

    /// The device answered with a Modbus exception.
    #[error("modbus exception: {0}")]
    Exception(String),

    /// Write rejected or failed.
    #[error("write failed: {0}")]
    Write(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ModbusError {
    /// Whether this failure counts against the consecutive-timeout ladder
    /// rather than the retry ladder.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ModbusError::Timeout(_))
    }
}
