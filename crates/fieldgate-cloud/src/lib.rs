//! Cloud egress pipeline.
//!
//! Two publishers drain the measurement queue toward the configured
//! backend: an MQTT publisher with default/customize publish modes, a
//! persistent fallback queue and a subscribe-to-write bridge, and an HTTP
//! publisher with bounded retry. Which one runs is selected by the server
//! configuration's `protocol` field.

pub mod cycle;
pub mod error;
pub mod http;
pub mod mqtt;
pub mod write_bridge;

pub use cycle::{compute_buffer_size, CadenceGate, HTTP_CYCLE_CAP, MQTT_CYCLE_CAP};
pub use error::{CloudError, Result};
pub use http::HttpPublisher;
pub use mqtt::{MqttPublisher, SessionState};
pub use write_bridge::{parse_write_payload, DriverWriter, ValueWriter, WriteBridge, WriteOutcome};
