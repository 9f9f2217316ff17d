//! Subscribe-to-write bridge.
//!
//! Custom-topic subscriptions can carry inbound messages that write device
//! holding registers or coils. Payload rules: a topic configured with
//! exactly one register accepts `{"value": X}`; a topic with several
//! registers takes a `{"<register_id>": X, ...}` map. Every write produces
//! a per-register outcome, published on the topic's response topic.

use std::sync::Arc;

use async_trait::async_trait;
use fieldgate_core::{CustomTopic, DeviceConfig, Protocol, RegisterConfig};
use fieldgate_modbus::{RtuDriver, TcpDriver};
use fieldgate_storage::ConfigStore;
use serde::Serialize;
use tracing::{debug, warn};

/// Executes a register write on whichever transport owns the device.
#[async_trait]
pub trait ValueWriter: Send + Sync {
    async fn write_value(
        &self,
        device: &DeviceConfig,
        register: &RegisterConfig,
        value: f64,
    ) -> fieldgate_modbus::Result<Vec<u16>>;
}

/// Production writer dispatching to the RTU/TCP drivers by protocol.
pub struct DriverWriter {
    pub rtu: Arc<RtuDriver>,
    pub tcp: Arc<TcpDriver>,
}

#[async_trait]
impl ValueWriter for DriverWriter {
    async fn write_value(
        &self,
        device: &DeviceConfig,
        register: &RegisterConfig,
        value: f64,
    ) -> fieldgate_modbus::Result<Vec<u16>> {
        match device.protocol {
            Protocol::Rtu => self.rtu.write_value(device, register, value).await,
            Protocol::Tcp => self.tcp.write_value(device, register, value).await,
        }
    }
}

/// Outcome of one register write.
#[derive(Debug, Clone, Serialize)]
pub struct WriteOutcome {
    pub device_id: String,
    pub register_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub written_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_value: Option<Vec<u16>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Parse an inbound write payload into (register id, value) pairs.
///
/// Returns an error string for malformed payloads; unknown register ids
/// inside a map payload surface as per-register outcomes instead.
pub fn parse_write_payload(
    payload: &[u8],
    registers: &[String],
) -> std::result::Result<Vec<(String, f64)>, String> {
    let value: serde_json::Value =
        serde_json::from_slice(payload).map_err(|e| format!("invalid JSON: {}", e))?;
    let object = value
        .as_object()
        .ok_or_else(|| "payload must be a JSON object".to_string())?;

    if object.len() == 1 && object.contains_key("value") {
        if registers.len() != 1 {
            return Err(format!(
                "topic has {} registers; a bare value needs exactly one",
                registers.len()
            ));
        }
        let value = object["value"]
            .as_f64()
            .ok_or_else(|| "\"value\" must be numeric".to_string())?;
        return Ok(vec![(registers[0].clone(), value)]);
    }

    if object.is_empty() {
        return Err("empty write payload".to_string());
    }
    let mut writes = Vec::with_capacity(object.len());
    for (key, raw) in object {
        let value = raw
            .as_f64()
            .ok_or_else(|| format!("value for '{}' must be numeric", key))?;
        writes.push((key.clone(), value));
    }
    Ok(writes)
}

/// The write bridge: resolves registers to devices and runs the writes.
pub struct WriteBridge {
    store: Arc<ConfigStore>,
    writer: Arc<dyn ValueWriter>,
}

impl WriteBridge {
    pub fn new(store: Arc<ConfigStore>, writer: Arc<dyn ValueWriter>) -> Self {
        Self { store, writer }
    }

    /// Find the device owning a register id.
    fn resolve(&self, register_id: &str) -> Option<(DeviceConfig, RegisterConfig)> {
        let devices = self.store.list_devices().ok()?;
        for device in devices {
            if let Some(register) = device.register(register_id) {
                let register = register.clone();
                return Some((device, register));
            }
        }
        None
    }

    /// Handle one inbound message for a custom topic. Returns the response
    /// document to publish on the topic's response topic.
    pub async fn handle(&self, topic: &CustomTopic, payload: &[u8]) -> serde_json::Value {
        let writes = match parse_write_payload(payload, &topic.registers) {
            Ok(writes) => writes,
            Err(e) => {
                warn!(topic = %topic.topic, "rejected write payload: {}", e);
                return serde_json::json!({
                    "status": "error",
                    "topic": topic.topic,
                    "error": e,
                    "timestamp": chrono::Utc::now().timestamp(),
                });
            }
        };

        let mut results = Vec::with_capacity(writes.len());
        for (register_id, value) in writes {
            if !topic.registers.contains(&register_id) {
                results.push(WriteOutcome {
                    device_id: String::new(),
                    register_id,
                    status: "error".to_string(),
                    written_value: None,
                    raw_value: None,
                    error: Some("register not configured on this topic".to_string()),
                });
                continue;
            }
            match self.resolve(&register_id) {
                Some((device, register)) => {
                    match self.writer.write_value(&device, &register, value).await {
                        Ok(raw) => {
                            debug!(register_id = %register_id, value, "register written");
                            results.push(WriteOutcome {
                                device_id: device.device_id,
                                register_id,
                                status: "ok".to_string(),
                                written_value: Some(value),
                                raw_value: Some(raw),
                                error: None,
                            });
                        }
                        Err(e) => {
                            warn!(register_id = %register_id, "register write failed: {}", e);
                            results.push(WriteOutcome {
                                device_id: device.device_id,
                                register_id,
                                status: "error".to_string(),
                                written_value: None,
                                raw_value: None,
                                error: Some(e.to_string()),
                            });
                        }
                    }
                }
                None => {
                    results.push(WriteOutcome {
                        device_id: String::new(),
                        register_id,
                        status: "error".to_string(),
                        written_value: None,
                        raw_value: None,
                        error: Some("no device owns this register".to_string()),
                    });
                }
            }
        }

        let ok = results.iter().filter(|r| r.status == "ok").count();
        let status = if ok == results.len() {
            "ok"
        } else if ok > 0 {
            "partial"
        } else {
            "error"
        };

        serde_json::json!({
            "status": status,
            "topic": topic.topic,
            "results": results,
            "timestamp": chrono::Utc::now().timestamp(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::{DataType, FunctionCode, IntervalUnit};
    use fieldgate_modbus::ModbusError;
    use tokio::sync::Mutex;

    fn topic(registers: Vec<&str>) -> CustomTopic {
        CustomTopic {
            topic: "gw/write/v".to_string(),
            qos: 1,
            response_topic: String::new(),
            registers: registers.into_iter().map(String::from).collect(),
            interval: 1,
            interval_unit: IntervalUnit::S,
        }
    }

    #[test]
    fn test_parse_single_register_bare_value() {
        let writes =
            parse_write_payload(br#"{"value": 25.5}"#, &["r1".to_string()]).unwrap();
        assert_eq!(writes, vec![("r1".to_string(), 25.5)]);
    }

    #[test]
    fn test_parse_bare_value_with_many_registers_rejected() {
        let registers = vec!["r1".to_string(), "r2".to_string()];
        assert!(parse_write_payload(br#"{"value": 1.0}"#, &registers).is_err());
    }

    #[test]
    fn test_parse_register_map() {
        let registers = vec!["r1".to_string(), "r2".to_string()];
        let writes =
            parse_write_payload(br#"{"r1": 1.0, "r2": 2.0}"#, &registers).unwrap();
        assert_eq!(writes.len(), 2);
    }

    #[test]
    fn test_parse_rejects_non_numeric() {
        assert!(parse_write_payload(br#"{"value": "hot"}"#, &["r1".to_string()]).is_err());
        assert!(parse_write_payload(b"[1,2]", &["r1".to_string()]).is_err());
    }

    struct MockWriter {
        calls: Mutex<Vec<(String, f64)>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl ValueWriter for MockWriter {
        async fn write_value(
            &self,
            _device: &DeviceConfig,
            register: &RegisterConfig,
            value: f64,
        ) -> fieldgate_modbus::Result<Vec<u16>> {
            if self.fail_on.as_deref() == Some(register.register_id.as_str()) {
                return Err(ModbusError::Write("scripted failure".to_string()));
            }
            self.calls
                .lock()
                .await
                .push((register.register_id.clone(), value));
            Ok(vec![2550])
        }
    }

    fn store_with_register(register_id: &str) -> Arc<ConfigStore> {
        let store = ConfigStore::ephemeral().unwrap();
        store
            .create_device(DeviceConfig {
                device_id: String::new(),
                name: "M1".to_string(),
                protocol: Protocol::Rtu,
                enabled: true,
                refresh_rate_ms: 1000,
                timeout_ms: 1000,
                max_retries: 3,
                slave_id: Some(1),
                serial_port: Some(1),
                baud_rate: Some(9600),
                ip_address: None,
                port: None,
                registers: vec![RegisterConfig {
                    register_id: register_id.to_string(),
                    name: register_id.to_string(),
                    description: String::new(),
                    unit: String::new(),
                    address: 40,
                    function_code: FunctionCode::ReadHoldingRegisters,
                    data_type: DataType::Uint16,
                    scale: 0.01,
                    offset: 0.0,
                }],
            })
            .unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_write_ok_response() {
        let store = store_with_register("r_holding");
        let writer = Arc::new(MockWriter {
            calls: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let bridge = WriteBridge::new(store, writer.clone());

        let response = bridge
            .handle(&topic(vec!["r_holding"]), br#"{"value": 25.5}"#)
            .await;
        assert_eq!(response["status"], "ok");
        assert_eq!(response["results"][0]["written_value"], 25.5);
        assert_eq!(response["results"][0]["raw_value"][0], 2550);
        assert_eq!(writer.calls.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_partial_status_on_mixed_outcomes() {
        let store = ConfigStore::ephemeral().unwrap();
        store
            .create_device(DeviceConfig {
                device_id: String::new(),
                name: "M1".to_string(),
                protocol: Protocol::Rtu,
                enabled: true,
                refresh_rate_ms: 1000,
                timeout_ms: 1000,
                max_retries: 3,
                slave_id: Some(1),
                serial_port: Some(1),
                baud_rate: Some(9600),
                ip_address: None,
                port: None,
                registers: vec![
                    RegisterConfig {
                        register_id: "r1".to_string(),
                        name: "r1".to_string(),
                        description: String::new(),
                        unit: String::new(),
                        address: 40,
                        function_code: FunctionCode::ReadHoldingRegisters,
                        data_type: DataType::Uint16,
                        scale: 1.0,
                        offset: 0.0,
                    },
                    RegisterConfig {
                        register_id: "r2".to_string(),
                        name: "r2".to_string(),
                        description: String::new(),
                        unit: String::new(),
                        address: 41,
                        function_code: FunctionCode::ReadHoldingRegisters,
                        data_type: DataType::Uint16,
                        scale: 1.0,
                        offset: 0.0,
                    },
                ],
            })
            .unwrap();
        let writer = Arc::new(MockWriter {
            calls: Mutex::new(Vec::new()),
            fail_on: Some("r2".to_string()),
        });
        let bridge = WriteBridge::new(Arc::new(store), writer);

        let response = bridge
            .handle(&topic(vec!["r1", "r2"]), br#"{"r1": 1.0, "r2": 2.0}"#)
            .await;
        assert_eq!(response["status"], "partial");
    }

    #[tokio::test]
    async fn test_unknown_register_is_error() {
        let store = store_with_register("r1");
        let writer = Arc::new(MockWriter {
            calls: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let bridge = WriteBridge::new(store, writer);

        let response = bridge
            .handle(&topic(vec!["ghost"]), br#"{"value": 1.0}"#)
            .await;
        assert_eq!(response["status"], "error");
    }
}
