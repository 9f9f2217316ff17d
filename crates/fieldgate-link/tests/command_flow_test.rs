//! End-to-end command flow over the in-memory link binding: fragments in,
//! reassembled commands through the priority worker, fragmented responses
//! out.

use std::sync::Arc;
use std::time::Duration;

use fieldgate_core::{DataQueue, EventBus, StreamGate};
use fieldgate_link::{
    CommandHandler, ConfigTransport, LinkEvent, LinkMetrics, MemoryClient, MemoryLink,
};
use fieldgate_storage::ConfigStore;

struct Harness {
    client: MemoryClient,
    store: Arc<ConfigStore>,
    transport: Arc<ConfigTransport>,
    handler: Arc<CommandHandler>,
    inbound: Option<tokio::sync::mpsc::Receiver<Vec<u8>>>,
}

impl Harness {
    async fn start_handler(&mut self) {
        let inbound = self.inbound.take().expect("handler started once");
        self.handler.start(inbound).await;
    }
}

async fn harness() -> Harness {
    let store = Arc::new(ConfigStore::ephemeral().unwrap());
    let gate = StreamGate::new();
    let metrics = Arc::new(LinkMetrics::new());
    let (link, client) = MemoryLink::pair();
    let (transport, inbound) = ConfigTransport::new(link, gate.clone(), metrics.clone());
    let handler = CommandHandler::new(
        store.clone(),
        EventBus::new(),
        transport.clone(),
        Arc::new(DataQueue::new()),
        Arc::new(DataQueue::with_capacity(50)),
        gate,
        metrics,
    );
    transport.start().await;
    Harness {
        client,
        store,
        transport,
        handler,
        inbound: Some(inbound),
    }
}

/// Send one newline-terminated command over the link.
fn send_line(client: &MemoryClient, line: &str) {
    let mut bytes = line.as_bytes().to_vec();
    bytes.push(b'\n');
    client.event_tx.send(LinkEvent::Chunk(bytes)).unwrap();
}

/// Collect outbound fragments until one full message line arrived.
async fn read_response(client: &mut MemoryClient) -> serde_json::Value {
    let mut collected: Vec<u8> = Vec::new();
    loop {
        if let Some(pos) = collected.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = collected.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            return serde_json::from_slice(line).expect("valid JSON response");
        }
        let chunk = tokio::time::timeout(Duration::from_secs(10), client.out_rx.recv())
            .await
            .expect("response within deadline")
            .expect("link open");
        collected.extend_from_slice(&chunk);
    }
}

#[tokio::test(start_paused = true)]
async fn test_create_then_read_device_over_link() {
    let mut h = harness().await;
    h.start_handler().await;

    send_line(
        &h.client,
        r#"{"op":"create","type":"device","config":{"device_name":"M1","protocol":"RTU","slave_id":1,"serial_port":1,"baud_rate":9600,"refresh_rate_ms":5000,"timeout":3000,"retry_count":3}}"#,
    );
    let response = read_response(&mut h.client).await;
    assert_eq!(response["status"], "ok");
    let device_id = response["data"]["device_id"].as_str().unwrap().to_string();
    assert_eq!(device_id.len(), 6);

    send_line(
        &h.client,
        &format!(r#"{{"op":"read","type":"device","device_id":"{}"}}"#, device_id),
    );
    let response = read_response(&mut h.client).await;
    assert_eq!(response["status"], "ok");
    assert_eq!(response["data"]["name"], "M1");

    h.handler.stop().await;
    h.transport.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_error_response_carries_code() {
    let mut h = harness().await;
    h.start_handler().await;

    send_line(
        &h.client,
        r#"{"op":"read","type":"device","device_id":"FFFFFF"}"#,
    );
    let response = read_response(&mut h.client).await;
    assert_eq!(response["status"], "error");
    assert_eq!(response["error_code"], 102);
    assert!(response["error"].as_str().unwrap().contains("FFFFFF"));

    h.handler.stop().await;
    h.transport.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_large_backup_survives_fragmentation() {
    let mut h = harness().await;
    h.start_handler().await;

    // Seed a configuration big enough to trip adaptive chunking.
    for i in 0..50 {
        let mut registers = Vec::new();
        for r in 0..8 {
            registers.push(serde_json::json!({
                "register_id": format!("reg_{:02}_{:02}", i, r),
                "name": format!("Voltage phase {}", r),
                "description": "Measured line voltage with factory calibration applied",
                "unit": "V",
                "address": 100 + r * 2,
                "function_code": 3,
                "data_type": "FLOAT32_BE",
                "scale": 0.01,
                "offset": 0.0,
            }));
        }
        let device = serde_json::json!({
            "device_id": format!("{:06X}", i),
            "name": format!("feeder-{:02}", i),
            "protocol": "RTU",
            "enabled": true,
            "refresh_rate_ms": 5000,
            "timeout_ms": 3000,
            "max_retries": 3,
            "slave_id": (i % 240) + 1,
            "serial_port": 1,
            "baud_rate": 9600,
            "registers": registers,
        });
        let config: fieldgate_core::DeviceConfig = serde_json::from_value(device).unwrap();
        h.store.create_device(config).unwrap();
    }

    send_line(&h.client, r#"{"op":"read","type":"full_config"}"#);
    let response = read_response(&mut h.client).await;
    assert_eq!(response["status"], "ok");

    let devices = response["data"]["devices"].as_array().unwrap();
    assert_eq!(devices.len(), 50);
    // No truncation: the parsed object graph matches the store.
    let exported = h.store.export().unwrap();
    assert_eq!(
        serde_json::to_value(&exported.devices).unwrap(),
        response["data"]["devices"]
    );

    h.handler.stop().await;
    h.transport.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_parallel_batch_aggregates_by_batch_id() {
    let mut h = harness().await;
    h.start_handler().await;

    send_line(
        &h.client,
        r#"{"op":"create","type":"device","config":{"device_name":"M1","protocol":"RTU","slave_id":1,"serial_port":1,"baud_rate":9600,"refresh_rate_ms":5000,"timeout":3000,"retry_count":3}}"#,
    );
    let created = read_response(&mut h.client).await;
    let device_id = created["data"]["device_id"].as_str().unwrap().to_string();

    // One element succeeds, one fails; the single aggregated reply keeps
    // the original element order.
    send_line(
        &h.client,
        &format!(
            r#"{{"op":"batch","mode":"parallel","commands":[{{"op":"read","type":"device","device_id":"{}"}},{{"op":"read","type":"device","device_id":"FFFFFF"}}]}}"#,
            device_id
        ),
    );
    let response = read_response(&mut h.client).await;
    assert_eq!(response["status"], "partial");
    let results = response["results"].as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["status"], "ok");
    assert_eq!(results[0]["data"]["name"], "M1");
    assert_eq!(results[1]["status"], "error");

    h.handler.stop().await;
    h.transport.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_high_priority_command_overtakes_backlog() {
    let mut h = harness().await;

    // Whole backlog arrives before the worker starts, so the heap orders
    // it: the high-priority read must answer first despite arriving last.
    send_line(&h.client, r#"{"op":"read","type":"server_config","priority":2}"#);
    send_line(&h.client, r#"{"op":"read","type":"logging_config","priority":2}"#);
    send_line(&h.client, r#"{"op":"read","type":"ble_metrics","priority":0}"#);
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.start_handler().await;

    let first = read_response(&mut h.client).await;
    assert!(
        first["data"].get("health_score").is_some(),
        "high priority first, got {}",
        first
    );

    // The two low-priority commands keep their arrival order.
    let second = read_response(&mut h.client).await;
    let third = read_response(&mut h.client).await;
    assert!(second["id"].as_u64().unwrap() < third["id"].as_u64().unwrap());

    h.handler.stop().await;
    h.transport.stop().await;
}
