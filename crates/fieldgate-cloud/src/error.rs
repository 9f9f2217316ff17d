//! Error types for the cloud egress pipeline.

use thiserror::Error;

/// Result type for publisher operations.
pub type Result<T> = std::result::Result<T, CloudError>;

/// Faults raised by the MQTT and HTTP publishers.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("MQTT connection failed: {0}")]
    MqttConnection(String),

    #[error("MQTT publish failed: {0}")]
    MqttPublish(String),

    /// The endpoint answered with a client error.
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("HTTP request failed: {0}")]
    HttpNetwork(String),

    #[error("invalid publisher configuration: {0}")]
    Config(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<fieldgate_core::CoreError> for CloudError {
    fn from(e: fieldgate_core::CoreError) -> Self {
        CloudError::Queue(e.to_string())
    }
}

impl From<fieldgate_storage::Error> for CloudError {
    fn from(e: fieldgate_storage::Error) -> Self {
        CloudError::Storage(e.to_string())
    }
}
