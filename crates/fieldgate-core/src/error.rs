//! Unified error taxonomy.
//!
//! Every recoverable fault in the gateway maps onto an [`ErrorKind`] with a
//! stable three-digit code, a domain, a severity, and a recovery suggestion.
//! Components convert their crate-local errors into [`ErrorRecord`]s at the
//! boundary and push them into the shared [`ErrorMonitor`], which keeps a
//! bounded history ring and fans records out to subscribers.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type used by the data model and queue.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration document failed validation.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A bounded lock acquisition timed out.
    #[error("lock timed out after {0} ms")]
    LockTimeout(u64),

    /// Queue rejected the operation.
    #[error("queue error: {0}")]
    Queue(String),
}

/// Fault domain grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorDomain {
    Config,
    Modbus,
    Network,
    Mqtt,
    Http,
    Link,
    Storage,
    Memory,
    Ota,
    Internal,
}

/// Severity attached to a taxonomy kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// Enumerated error kinds with stable codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ConfigInvalid,
    ConfigNotFound,
    ModbusCrc,
    ModbusTimeout,
    ModbusException,
    NetUnavailable,
    NetSwitchFailed,
    MqttConnRefused,
    MqttPublishFailed,
    HttpStatus4xx,
    HttpStatus5xx,
    HttpNetwork,
    LinkMtuTimeout,
    LinkFragOversize,
    QueueFull,
    StoreIo,
    MemLow,
    MemCritical,
    OtaFailed,
    Internal,
}

impl ErrorKind {
    /// Stable three-digit code. The hundreds digit identifies the domain.
    pub fn code(&self) -> u16 {
        use ErrorKind::*;
        match self {
            ConfigInvalid => 101,
            ConfigNotFound => 102,
            ModbusCrc => 201,
            ModbusTimeout => 202,
            ModbusException => 203,
            NetUnavailable => 301,
            NetSwitchFailed => 302,
            MqttConnRefused => 401,
            MqttPublishFailed => 402,
            HttpStatus4xx => 501,
            HttpStatus5xx => 502,
            HttpNetwork => 503,
            LinkMtuTimeout => 601,
            LinkFragOversize => 602,
            StoreIo => 701,
            QueueFull => 702,
            MemLow => 801,
            MemCritical => 802,
            OtaFailed => 901,
            Internal => 999,
        }
    }

    pub fn domain(&self) -> ErrorDomain {
        use ErrorKind::*;
        match self {
            ConfigInvalid | ConfigNotFound => ErrorDomain::Config,
            ModbusCrc | ModbusTimeout | ModbusException => ErrorDomain::Modbus,
            NetUnavailable | NetSwitchFailed => ErrorDomain::Network,
            MqttConnRefused | MqttPublishFailed => ErrorDomain::Mqtt,
            HttpStatus4xx | HttpStatus5xx | HttpNetwork => ErrorDomain::Http,
            LinkMtuTimeout | LinkFragOversize => ErrorDomain::Link,
            StoreIo | QueueFull => ErrorDomain::Storage,
            MemLow | MemCritical => ErrorDomain::Memory,
            OtaFailed => ErrorDomain::Ota,
            Internal => ErrorDomain::Internal,
        }
    }

    pub fn severity(&self) -> Severity {
        use ErrorKind::*;
        match self {
            ConfigInvalid | ConfigNotFound => Severity::Warning,
            ModbusCrc | ModbusTimeout | ModbusException => Severity::Warning,
            NetUnavailable => Severity::Error,
            NetSwitchFailed => Severity::Error,
            MqttConnRefused | MqttPublishFailed => Severity::Warning,
            HttpStatus4xx => Severity::Warning,
            HttpStatus5xx | HttpNetwork => Severity::Warning,
            LinkMtuTimeout => Severity::Info,
            LinkFragOversize => Severity::Error,
            QueueFull => Severity::Warning,
            StoreIo => Severity::Error,
            MemLow => Severity::Warning,
            MemCritical => Severity::Critical,
            OtaFailed => Severity::Error,
            Internal => Severity::Error,
        }
    }

    /// Operator-facing recovery hint.
    pub fn recovery(&self) -> &'static str {
        use ErrorKind::*;
        match self {
            ConfigInvalid => "fix the rejected field and resubmit",
            ConfigNotFound => "verify the device or register id",
            ModbusCrc => "check bus wiring, termination and baud rate",
            ModbusTimeout => "check device power and slave id",
            ModbusException => "check register address and function code",
            NetUnavailable => "waiting for failover to a healthy interface",
            NetSwitchFailed => "both interfaces down; check cabling and AP",
            MqttConnRefused => "check broker address and credentials",
            MqttPublishFailed => "message diverted to the fallback queue",
            HttpStatus4xx => "check endpoint path, auth headers and body format",
            HttpStatus5xx => "server-side fault; delivery will be retried",
            HttpNetwork => "check endpoint reachability",
            LinkMtuTimeout => "client ignored MTU exchange; using fallback MTU",
            LinkFragOversize => "response exceeds the transport cap; narrow the query",
            QueueFull => "oldest records are being evicted; raise cadence or capacity",
            StoreIo => "check flash health and free space",
            MemLow => "memory guard is flushing caches",
            MemCritical => "restart imminent if pressure persists",
            OtaFailed => "verify update source and signature settings",
            Internal => "unexpected fault; see preceding log output",
        }
    }
}

/// One recorded fault.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub code: u16,
    pub severity: Severity,
    pub message: String,
    /// Seconds since epoch.
    pub timestamp: i64,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code(),
            severity: kind.severity(),
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Default capacity of the error history ring.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Shared fault monitor: bounded history plus broadcast fan-out.
#[derive(Clone)]
pub struct ErrorMonitor {
    history: Arc<Mutex<VecDeque<ErrorRecord>>>,
    capacity: usize,
    tx: broadcast::Sender<ErrorRecord>,
}

impl ErrorMonitor {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            history: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            tx,
        }
    }

    /// Record a fault: append to the ring (evicting the oldest) and notify
    /// subscribers. Lost subscribers are ignored.
    pub async fn record(&self, kind: ErrorKind, message: impl Into<String>) -> ErrorRecord {
        let record = ErrorRecord::new(kind, message);
        {
            let mut history = self.history.lock().await;
            if history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
        let _ = self.tx.send(record.clone());
        record
    }

    /// Snapshot of the history ring, oldest first.
    pub async fn history(&self) -> Vec<ErrorRecord> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Subscribe to future records.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorRecord> {
        self.tx.subscribe()
    }
}

impl Default for ErrorMonitor {
    fn default() -> Self {
        Self::new()
    }
}
