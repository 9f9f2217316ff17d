//! Fieldgate core types.
//!
//! Shared foundation for the gateway: the device/register data model, the
//! persisted configuration documents, the bounded measurement queues, the
//! configuration-change event bus, the unified error taxonomy, and the
//! two-pool memory accounting.
//!
//! This crate is dependency-light by design; protocol and transport crates
//! build on top of it.

pub mod config;
pub mod error;
pub mod events;
pub mod memory;
pub mod model;
pub mod queue;

pub use config::{
    CloudProtocol, CommunicationConfig, CustomTopic, CustomizeMode, DefaultMode, EthernetConfig,
    HttpMethod, HttpSettings, IntervalUnit, LoggingConfig, MqttSettings, NetworkMode, OtaConfig,
    PublishMode, ServerConfig, WifiConfig,
};
pub use error::{
    CoreError, ErrorDomain, ErrorKind, ErrorMonitor, ErrorRecord, Result, Severity,
};
pub use events::{EventBus, EventReceiver, GatewayEvent};
pub use memory::{MemoryLevel, MemoryPools, MemoryThresholds, PoolKind, SharedPools};
pub use model::{
    generate_device_id, DataType, DeviceConfig, DeviceId, DeviceRuntime, DisableReason,
    FunctionCode, HealthMetrics, MeasurementPoint, Protocol, RegisterConfig, WordOrder,
    MAX_REGISTER_ADDRESS, SUPPORTED_BAUD_RATES,
};
pub use queue::{
    DataQueue, QueueStats, StreamGate, DATA_QUEUE_CAPACITY, LOCK_TIMEOUT_MS, STREAM_QUEUE_CAPACITY,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
