//! Persisted scalar configuration documents.
//!
//! Three documents accompany the per-device map in the config store: the
//! server configuration (network, protocol selection, MQTT/HTTP egress),
//! the logging configuration, and the OTA configuration. Field names are
//! the stable wire schema consumed by provisioning clients.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_interval() -> u64 {
    30
}

fn default_keep_alive() -> u64 {
    120
}

fn default_http_timeout_ms() -> u64 {
    10_000
}

fn default_http_retry() -> u32 {
    3
}

fn default_qos() -> u8 {
    0
}

fn default_mqtt_port() -> u16 {
    1883
}

/// Cadence unit for publish intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalUnit {
    Ms,
    #[default]
    S,
    M,
}

impl IntervalUnit {
    /// Convert an interval in this unit to a duration.
    pub fn to_duration(&self, interval: u64) -> Duration {
        match self {
            IntervalUnit::Ms => Duration::from_millis(interval),
            IntervalUnit::S => Duration::from_secs(interval),
            IntervalUnit::M => Duration::from_secs(interval * 60),
        }
    }
}

/// Which interface is preferred when healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkMode {
    #[default]
    Eth,
    Wifi,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkMode::Eth => "ETH",
            NetworkMode::Wifi => "WIFI",
        }
    }
}

/// Wireless interface settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WifiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ssid: String,
    #[serde(default)]
    pub password: String,
}

/// Wired interface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthernetConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub use_dhcp: bool,
    #[serde(default)]
    pub static_ip: String,
    #[serde(default)]
    pub gateway: String,
    #[serde(default)]
    pub subnet: String,
}

impl Default for EthernetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_dhcp: true,
            static_ip: String::new(),
            gateway: String::new(),
            subnet: String::new(),
        }
    }
}

/// Interface selection and credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommunicationConfig {
    #[serde(default)]
    pub primary_network_mode: NetworkMode,
    #[serde(default)]
    pub wifi: WifiConfig,
    #[serde(default)]
    pub ethernet: EthernetConfig,
}

/// Which cloud publisher is started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProtocol {
    #[default]
    Mqtt,
    Http,
}

/// MQTT publishing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    #[default]
    Default,
    Customize,
}

/// Single-topic batched publishing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultMode {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub topic_publish: String,
    #[serde(default)]
    pub topic_subscribe: String,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub interval_unit: IntervalUnit,
}

impl Default for DefaultMode {
    fn default() -> Self {
        Self {
            enabled: true,
            topic_publish: "fieldgate/data".to_string(),
            topic_subscribe: String::new(),
            interval: default_interval(),
            interval_unit: IntervalUnit::S,
        }
    }
}

/// One per-topic subscription in customize mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomTopic {
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Topic where write outcomes are published.
    #[serde(default)]
    pub response_topic: String,
    /// Register ids selected from the dedup map.
    #[serde(default)]
    pub registers: Vec<String>,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub interval_unit: IntervalUnit,
}

impl CustomTopic {
    /// Response topic, defaulting to `<topic>/response`.
    pub fn response_topic(&self) -> String {
        if self.response_topic.is_empty() {
            format!("{}/response", self.topic)
        } else {
            self.response_topic.clone()
        }
    }
}

/// Per-topic publishing with individual cadences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomizeMode {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub custom_topics: Vec<CustomTopic>,
}

/// MQTT broker session and publishing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub publish_mode: PublishMode,
    #[serde(default)]
    pub default_mode: DefaultMode,
    #[serde(default)]
    pub customize_mode: CustomizeMode,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: String::new(),
            port: default_mqtt_port(),
            client_id: String::new(),
            username: String::new(),
            password: String::new(),
            keep_alive_secs: default_keep_alive(),
            clean_session: true,
            use_tls: false,
            publish_mode: PublishMode::Default,
            default_mode: DefaultMode::default(),
            customize_mode: CustomizeMode::default(),
        }
    }
}

/// HTTP request method for the egress endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Post,
    Put,
    Patch,
}

/// HTTP egress settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint_url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub body_format: String,
    #[serde(default = "default_http_timeout_ms", alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_http_retry")]
    pub retry: u32,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default)]
    pub interval_unit: IntervalUnit,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint_url: String::new(),
            method: HttpMethod::Post,
            body_format: "json".to_string(),
            timeout_ms: default_http_timeout_ms(),
            retry: default_http_retry(),
            headers: HashMap::new(),
            interval: default_interval(),
            interval_unit: IntervalUnit::S,
        }
    }
}

/// The server configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub communication: CommunicationConfig,
    #[serde(default)]
    pub protocol: CloudProtocol,
    #[serde(default)]
    pub mqtt_config: MqttSettings,
    #[serde(default)]
    pub http_config: HttpSettings,
}

fn default_level() -> String {
    "info".to_string()
}

/// The logging configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// Per-module overrides, e.g. `{"fieldgate_modbus": "debug"}`.
    #[serde(default)]
    pub modules: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            modules: HashMap::new(),
        }
    }
}

impl LoggingConfig {
    /// Render as a tracing-subscriber env-filter directive string.
    pub fn to_filter_string(&self) -> String {
        let mut parts = vec![self.level.clone()];
        let mut modules: Vec<_> = self.modules.iter().collect();
        modules.sort();
        for (module, level) in modules {
            parts.push(format!("{}={}", module, level));
        }
        parts.join(",")
    }
}

/// The OTA configuration document. The update subsystem itself lives
/// outside the core; only its settings document is managed here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OtaConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub source_url: String,
    #[serde(default = "default_interval")]
    pub check_interval_hours: u64,
    #[serde(default = "default_true")]
    pub verify_signature: bool,
    #[serde(default)]
    pub auto_apply: bool,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source_url: String::new(),
            check_interval_hours: default_interval(),
            verify_signature: true,
            auto_apply: false,
        }
    }
}
