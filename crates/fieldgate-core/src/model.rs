//! Gateway data model.
//!
//! Device and register configuration documents as persisted by the config
//! store, the measurement point record produced by the polling drivers, and
//! the in-memory per-device runtime state.
//!
//! Field naming follows the current wire schema. Legacy spellings that older
//! provisioning clients still send (`device_name`, `register_name`, `ip`,
//! `timeout`, `retry_count`) are accepted on deserialization via serde
//! aliases and never emitted.

use std::collections::HashSet;

use rand::Rng;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Unique device identifier: six uppercase hex digits.
pub type DeviceId = String;

/// Baud rates the RTU buses can be programmed to.
pub const SUPPORTED_BAUD_RATES: [u32; 8] = [1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];

/// Highest addressable Modbus register.
pub const MAX_REGISTER_ADDRESS: u32 = 65535;

/// Generate a new 6-hex-digit device identifier.
pub fn generate_device_id() -> DeviceId {
    let mut rng = rand::thread_rng();
    format!("{:06X}", rng.gen_range(0u32..=0xFF_FFFF))
}

/// Field protocol a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "RTU")]
    Rtu,
    #[serde(rename = "TCP")]
    Tcp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rtu => "RTU",
            Protocol::Tcp => "TCP",
        }
    }
}

/// Modbus read function codes supported by the polling engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "u8")]
pub enum FunctionCode {
    /// FC 01
    ReadCoils,
    /// FC 02
    ReadDiscreteInputs,
    /// FC 03
    ReadHoldingRegisters,
    /// FC 04
    ReadInputRegisters,
}

impl FunctionCode {
    pub fn code(&self) -> u8 {
        match self {
            FunctionCode::ReadCoils => 1,
            FunctionCode::ReadDiscreteInputs => 2,
            FunctionCode::ReadHoldingRegisters => 3,
            FunctionCode::ReadInputRegisters => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(FunctionCode::ReadCoils),
            2 => Some(FunctionCode::ReadDiscreteInputs),
            3 => Some(FunctionCode::ReadHoldingRegisters),
            4 => Some(FunctionCode::ReadInputRegisters),
            _ => None,
        }
    }

    /// Whether this function reads single-bit values.
    pub fn is_bit_function(&self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs
        )
    }
}

impl From<FunctionCode> for u8 {
    fn from(fc: FunctionCode) -> u8 {
        fc.code()
    }
}

// Older provisioning clients send the function code as a string ("3");
// current ones send an integer. Accept both.
impl<'de> Deserialize<'de> for FunctionCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u8),
            Text(String),
        }

        let code = match Raw::deserialize(deserializer)? {
            Raw::Num(n) => n,
            Raw::Text(s) => s
                .trim()
                .parse::<u8>()
                .map_err(|_| de::Error::custom(format!("invalid function code '{}'", s)))?,
        };
        FunctionCode::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unsupported function code {}", code)))
    }
}

/// Word order of a multi-register value.
///
/// `BeBs` swaps the bytes inside each word before big-endian assembly;
/// `LeBs` reverses word order and swaps bytes inside each word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordOrder {
    Be,
    Le,
    BeBs,
    LeBs,
}

/// Register value encoding.
///
/// The tag determines how many 16-bit registers the value spans and how the
/// raw words are assembled and interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Int16,
    Uint16,
    Bool,
    Binary,
    Int32Be,
    Int32Le,
    Int32BeBs,
    Int32LeBs,
    Uint32Be,
    Uint32Le,
    Uint32BeBs,
    Uint32LeBs,
    Float32Be,
    Float32Le,
    Float32BeBs,
    Float32LeBs,
    Int64Be,
    Int64Le,
    Int64BeBs,
    Int64LeBs,
    Uint64Be,
    Uint64Le,
    Uint64BeBs,
    Uint64LeBs,
    Double64Be,
    Double64Le,
    Double64BeBs,
    Double64LeBs,
}

impl DataType {
    /// Number of 16-bit registers the value occupies.
    pub fn span(&self) -> u16 {
        use DataType::*;
        match self {
            Int16 | Uint16 | Bool | Binary => 1,
            Int32Be | Int32Le | Int32BeBs | Int32LeBs | Uint32Be | Uint32Le | Uint32BeBs
            | Uint32LeBs | Float32Be | Float32Le | Float32BeBs | Float32LeBs => 2,
            _ => 4,
        }
    }

    /// Word order for multi-register types; `None` for single-word types.
    pub fn word_order(&self) -> Option<WordOrder> {
        use DataType::*;
        match self {
            Int16 | Uint16 | Bool | Binary => None,
            Int32Be | Uint32Be | Float32Be | Int64Be | Uint64Be | Double64Be => Some(WordOrder::Be),
            Int32Le | Uint32Le | Float32Le | Int64Le | Uint64Le | Double64Le => Some(WordOrder::Le),
            Int32BeBs | Uint32BeBs | Float32BeBs | Int64BeBs | Uint64BeBs | Double64BeBs => {
                Some(WordOrder::BeBs)
            }
            Int32LeBs | Uint32LeBs | Float32LeBs | Int64LeBs | Uint64LeBs | Double64LeBs => {
                Some(WordOrder::LeBs)
            }
        }
    }

    /// Whether the assembled bits are reinterpreted as IEEE-754.
    pub fn is_float(&self) -> bool {
        use DataType::*;
        matches!(
            self,
            Float32Be
                | Float32Le
                | Float32BeBs
                | Float32LeBs
                | Double64Be
                | Double64Le
                | Double64BeBs
                | Double64LeBs
        )
    }

    /// Whether the assembled integer is sign-extended.
    pub fn is_signed(&self) -> bool {
        use DataType::*;
        matches!(
            self,
            Int16 | Int32Be
                | Int32Le
                | Int32BeBs
                | Int32LeBs
                | Int64Be
                | Int64Le
                | Int64BeBs
                | Int64LeBs
        )
    }
}

fn default_scale() -> f64 {
    1.0
}

fn default_offset() -> f64 {
    0.0
}

fn default_true() -> bool {
    true
}

fn default_tcp_port() -> u16 {
    502
}

/// One named data point within a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    /// Unique within the owning device. Generated when omitted at creation.
    #[serde(default)]
    pub register_id: String,
    #[serde(alias = "register_name")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Display unit, e.g. "°C" or "V".
    #[serde(default)]
    pub unit: String,
    pub address: u16,
    pub function_code: FunctionCode,
    pub data_type: DataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_offset")]
    pub offset: f64,
}

impl RegisterConfig {
    /// Calibrated value from a raw decoded value.
    pub fn calibrate(&self, raw: f64) -> f64 {
        raw * self.scale + self.offset
    }

    /// Validate address span and basic shape.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.register_id.is_empty() {
            return Err(CoreError::ConfigInvalid("register_id is empty".into()));
        }
        let span = self.data_type.span() as u32;
        if self.address as u32 + span - 1 > MAX_REGISTER_ADDRESS {
            return Err(CoreError::ConfigInvalid(format!(
                "register '{}' spans past address {}: address={} span={}",
                self.register_id, MAX_REGISTER_ADDRESS, self.address, span
            )));
        }
        Ok(())
    }
}

/// A Modbus slave (RTU or TCP) addressable as a single unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Generated by the store when omitted at creation.
    #[serde(default)]
    pub device_id: DeviceId,
    #[serde(alias = "device_name")]
    pub name: String,
    pub protocol: Protocol,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Device-level polling interval.
    pub refresh_rate_ms: u64,
    #[serde(alias = "timeout")]
    pub timeout_ms: u64,
    #[serde(alias = "retry_count")]
    pub max_retries: u32,

    // RTU transport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slave_id: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<u32>,

    // TCP transport
    #[serde(default, alias = "ip", skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default)]
    pub registers: Vec<RegisterConfig>,
}

impl DeviceConfig {
    /// TCP port, defaulting to the standard Modbus port.
    pub fn tcp_port(&self) -> u16 {
        self.port.unwrap_or_else(default_tcp_port)
    }

    /// Slave/unit identifier, defaulting to 1.
    pub fn unit_id(&self) -> u8 {
        self.slave_id.unwrap_or(1)
    }

    /// Validate transport fields and register set.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.is_empty() {
            return Err(CoreError::ConfigInvalid("device name is empty".into()));
        }
        if self.refresh_rate_ms == 0 {
            return Err(CoreError::ConfigInvalid("refresh_rate_ms must be > 0".into()));
        }
        match self.protocol {
            Protocol::Rtu => {
                let slave = self
                    .slave_id
                    .ok_or_else(|| CoreError::ConfigInvalid("RTU device missing slave_id".into()))?;
                if !(1..=247).contains(&slave) {
                    return Err(CoreError::ConfigInvalid(format!(
                        "slave_id {} outside 1..247",
                        slave
                    )));
                }
                let port = self.serial_port.ok_or_else(|| {
                    CoreError::ConfigInvalid("RTU device missing serial_port".into())
                })?;
                if !(1..=2).contains(&port) {
                    return Err(CoreError::ConfigInvalid(format!(
                        "serial_port {} outside 1..2",
                        port
                    )));
                }
                let baud = self.baud_rate.ok_or_else(|| {
                    CoreError::ConfigInvalid("RTU device missing baud_rate".into())
                })?;
                if !SUPPORTED_BAUD_RATES.contains(&baud) {
                    return Err(CoreError::ConfigInvalid(format!(
                        "unsupported baud rate {}",
                        baud
                    )));
                }
            }
            Protocol::Tcp => {
                let ip = self.ip_address.as_deref().ok_or_else(|| {
                    CoreError::ConfigInvalid("TCP device missing ip_address".into())
                })?;
                if ip.parse::<std::net::Ipv4Addr>().is_err() {
                    return Err(CoreError::ConfigInvalid(format!(
                        "invalid IPv4 address '{}'",
                        ip
                    )));
                }
            }
        }

        let mut seen = HashSet::new();
        for register in &self.registers {
            register.validate()?;
            if !seen.insert(register.register_id.as_str()) {
                return Err(CoreError::ConfigInvalid(format!(
                    "duplicate register_id '{}'",
                    register.register_id
                )));
            }
        }
        Ok(())
    }

    /// Find a register by id.
    pub fn register(&self, register_id: &str) -> Option<&RegisterConfig> {
        self.registers
            .iter()
            .find(|r| r.register_id == register_id)
    }
}

/// A single calibrated sample from one register.
///
/// Self-describing: carries everything a publisher needs to serialize it
/// without a config lookup. `register_id` doubles as the deduplication key
/// within one publish cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPoint {
    /// Seconds since epoch.
    pub timestamp: i64,
    pub device_id: DeviceId,
    pub device_name: String,
    pub register_id: String,
    pub register_name: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub description: String,
}

/// Why a device is not being polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisableReason {
    #[default]
    None,
    /// Operator action over the configuration link. Never auto-cleared.
    Manual,
    /// Retry budget exhausted.
    AutoRetry,
    /// Too many consecutive timeouts.
    AutoTimeout,
}

impl DisableReason {
    /// Whether the auto-recovery sweep may re-enable this device.
    pub fn is_auto(&self) -> bool {
        matches!(self, DisableReason::AutoRetry | DisableReason::AutoTimeout)
    }
}

/// Per-device read statistics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub total_reads: u64,
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub total_response_time_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub last_ms: u64,
}

impl HealthMetrics {
    /// Record one successful read with its elapsed time.
    pub fn record_success(&mut self, elapsed_ms: u64) {
        self.total_reads += 1;
        self.successful_reads += 1;
        self.total_response_time_ms += elapsed_ms;
        self.last_ms = elapsed_ms;
        if self.min_ms == 0 || elapsed_ms < self.min_ms {
            self.min_ms = elapsed_ms;
        }
        if elapsed_ms > self.max_ms {
            self.max_ms = elapsed_ms;
        }
    }

    /// Record one failed read.
    pub fn record_failure(&mut self) {
        self.total_reads += 1;
        self.failed_reads += 1;
    }

    /// Success percentage; 100 when nothing has been read yet.
    pub fn success_rate(&self) -> f64 {
        if self.total_reads == 0 {
            100.0
        } else {
            self.successful_reads as f64 / self.total_reads as f64 * 100.0
        }
    }

    /// Average response time over successful reads; 0 when none succeeded.
    pub fn average_response_ms(&self) -> f64 {
        if self.successful_reads == 0 {
            0.0
        } else {
            self.total_response_time_ms as f64 / self.successful_reads as f64
        }
    }
}

/// In-memory runtime state for one device. Not persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceRuntime {
    /// Millisecond tick of the last completed polling pass.
    pub last_poll_time: u64,
    /// Millisecond tick before which the device stays in backoff.
    pub next_retry_time: u64,
    pub consecutive_failures: u32,
    pub consecutive_timeouts: u32,
    pub retry_count: u32,
    pub disable_reason: DisableReason,
    #[serde(default)]
    pub disable_detail: String,
    /// Millisecond tick at which the device was disabled.
    pub disabled_at: u64,
    /// Millisecond tick of the last successful register read.
    pub last_successful_read: u64,
    pub health: HealthMetrics,
}

impl DeviceRuntime {
    /// Reset the failure ladder after a successful read.
    pub fn clear_failures(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_timeouts = 0;
        self.retry_count = 0;
    }

    /// Whether the device is currently held out of the schedule.
    pub fn is_disabled(&self) -> bool {
        self.disable_reason != DisableReason::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rtu_device() -> DeviceConfig {
        DeviceConfig {
            device_id: "A3F2C1".to_string(),
            name: "M1".to_string(),
            protocol: Protocol::Rtu,
            enabled: true,
            refresh_rate_ms: 5000,
            timeout_ms: 3000,
            max_retries: 3,
            slave_id: Some(1),
            serial_port: Some(1),
            baud_rate: Some(9600),
            ip_address: None,
            port: None,
            registers: Vec::new(),
        }
    }

    #[test]
    fn test_device_id_format() {
        let id = generate_device_id();
        assert_eq!(id.len(), 6);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_function_code_from_int_or_string() {
        let fc: FunctionCode = serde_json::from_str("3").unwrap();
        assert_eq!(fc, FunctionCode::ReadHoldingRegisters);
        let fc: FunctionCode = serde_json::from_str("\"4\"").unwrap();
        assert_eq!(fc, FunctionCode::ReadInputRegisters);
        assert!(serde_json::from_str::<FunctionCode>("7").is_err());
    }

    #[test]
    fn test_data_type_span() {
        assert_eq!(DataType::Int16.span(), 1);
        assert_eq!(DataType::Float32Be.span(), 2);
        assert_eq!(DataType::Double64LeBs.span(), 4);
    }

    #[test]
    fn test_data_type_wire_names() {
        let dt: DataType = serde_json::from_str("\"FLOAT32_BE\"").unwrap();
        assert_eq!(dt, DataType::Float32Be);
        assert_eq!(serde_json::to_string(&DataType::Int32LeBs).unwrap(), "\"INT32_LE_BS\"");
    }

    #[test]
    fn test_register_span_overflow_rejected() {
        let reg = RegisterConfig {
            register_id: "r1".to_string(),
            name: "V".to_string(),
            description: String::new(),
            unit: String::new(),
            address: 65534,
            function_code: FunctionCode::ReadHoldingRegisters,
            data_type: DataType::Double64Be,
            scale: 1.0,
            offset: 0.0,
        };
        assert!(reg.validate().is_err());
    }

    #[test]
    fn test_register_span_boundary_ok() {
        let reg = RegisterConfig {
            register_id: "r1".to_string(),
            name: "V".to_string(),
            description: String::new(),
            unit: String::new(),
            address: 65532,
            function_code: FunctionCode::ReadHoldingRegisters,
            data_type: DataType::Double64Be,
            scale: 1.0,
            offset: 0.0,
        };
        assert!(reg.validate().is_ok());
    }

    #[test]
    fn test_device_validation() {
        let device = rtu_device();
        assert!(device.validate().is_ok());

        let mut bad = rtu_device();
        bad.slave_id = Some(0);
        assert!(bad.validate().is_err());

        let mut bad = rtu_device();
        bad.baud_rate = Some(14400);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_duplicate_register_ids_rejected() {
        let mut device = rtu_device();
        let reg = RegisterConfig {
            register_id: "r1".to_string(),
            name: "V".to_string(),
            description: String::new(),
            unit: String::new(),
            address: 0,
            function_code: FunctionCode::ReadInputRegisters,
            data_type: DataType::Int16,
            scale: 1.0,
            offset: 0.0,
        };
        device.registers.push(reg.clone());
        device.registers.push(reg);
        assert!(device.validate().is_err());
    }

    #[test]
    fn test_legacy_aliases_accepted() {
        let json = r#"{
            "device_id": "A3F2C1",
            "device_name": "M1",
            "protocol": "RTU",
            "refresh_rate_ms": 5000,
            "timeout": 3000,
            "retry_count": 3,
            "slave_id": 1,
            "serial_port": 1,
            "baud_rate": 9600
        }"#;
        let device: DeviceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(device.name, "M1");
        assert_eq!(device.timeout_ms, 3000);
        assert_eq!(device.max_retries, 3);

        // New names are emitted on write.
        let out = serde_json::to_value(&device).unwrap();
        assert!(out.get("name").is_some());
        assert!(out.get("device_name").is_none());
        assert!(out.get("timeout_ms").is_some());
    }

    #[test]
    fn test_calibration_identity() {
        let reg = RegisterConfig {
            register_id: "r1".to_string(),
            name: "V".to_string(),
            description: String::new(),
            unit: String::new(),
            address: 0,
            function_code: FunctionCode::ReadInputRegisters,
            data_type: DataType::Int16,
            scale: 1.0,
            offset: 0.0,
        };
        assert_eq!(reg.calibrate(512.0), 512.0);
        assert_eq!(reg.calibrate(-17.25), -17.25);
    }

    #[test]
    fn test_health_metrics_derived() {
        let mut health = HealthMetrics::default();
        assert_eq!(health.success_rate(), 100.0);
        assert_eq!(health.average_response_ms(), 0.0);

        health.record_success(10);
        health.record_success(30);
        health.record_failure();
        assert_eq!(health.total_reads, 3);
        assert!((health.success_rate() - 66.666).abs() < 0.01);
        assert_eq!(health.average_response_ms(), 20.0);
        assert_eq!(health.min_ms, 10);
        assert_eq!(health.max_ms, 30);
    }
}
