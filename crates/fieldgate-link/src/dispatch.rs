//! Command dispatch.
//!
//! A dedicated worker pops commands off the priority queue and executes
//! them sequentially: CRUD into the config store, streaming control, batch
//! execution (sequential, parallel, atomic with rollback), and the
//! read-only surfaces (hierarchical snapshots, full-config export, status,
//! link metrics). Successful mutations publish config-change events so
//! drivers and publishers reload without a restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use fieldgate_core::{
    generate_device_id, DataQueue, ErrorKind, EventBus, GatewayEvent, LoggingConfig, OtaConfig,
    ServerConfig, StreamGate,
};
use fieldgate_storage::{ConfigStore, FullConfig};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::commands::{BatchMode, BatchTag, CommandMessage, CommandQueue, Op, PendingCommand};
use crate::metrics::LinkMetrics;
use crate::transport::ConfigTransport;

/// Completion state of one fanned-out parallel batch.
struct BatchState {
    /// Command id of the enclosing batch message; the reply carries it.
    respond_id: u64,
    /// Per-element results, indexed by the element's batch position.
    results: Vec<Option<Value>>,
    completed: usize,
}

/// Provider of the live status document (wired by the orchestrator, which
/// can see the drivers, publishers and supervisor).
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn snapshot(&self) -> Value;
}

/// Deep-merge `patch` into `base`: objects merge recursively, everything
/// else (arrays included) is replaced.
pub fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(slot) if slot.is_object() && patch_value.is_object() => {
                        merge_json(slot, patch_value);
                    }
                    _ => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value.clone(),
    }
}

/// Remove every "description" field, recursively (minimal snapshots).
fn strip_descriptions(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("description");
            for child in map.values_mut() {
                strip_descriptions(child);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip_descriptions(item);
            }
        }
        _ => {}
    }
}

/// A batch that must be fanned out rather than executed in one piece.
fn is_parallel_batch(message: &CommandMessage) -> bool {
    message.op == Op::Batch && message.mode.unwrap_or_default() == BatchMode::Parallel
}

fn ok(data: Value) -> Value {
    json!({"status": "ok", "data": data})
}

fn ok_unit() -> Value {
    json!({"status": "ok"})
}

fn fail(kind: ErrorKind, message: impl Into<String>) -> Value {
    json!({
        "status": "error",
        "error_code": kind.code(),
        "error": message.into(),
    })
}

fn store_fail(error: fieldgate_storage::Error) -> Value {
    use fieldgate_storage::Error;
    match &error {
        Error::Missing(_) => fail(ErrorKind::ConfigNotFound, error.to_string()),
        Error::Rejected(_) => fail(ErrorKind::ConfigInvalid, error.to_string()),
        Error::Codec(_) | Error::Database { .. } | Error::Io(_) => {
            fail(ErrorKind::StoreIo, error.to_string())
        }
    }
}

/// The command handler.
pub struct CommandHandler {
    store: Arc<ConfigStore>,
    events: EventBus,
    transport: Arc<ConfigTransport>,
    data_queue: Arc<DataQueue>,
    stream_queue: Arc<DataQueue>,
    stream_gate: StreamGate,
    metrics: Arc<LinkMetrics>,
    status_source: RwLock<Option<Arc<dyn StatusSource>>>,
    next_command_id: AtomicU64,
    next_batch_id: AtomicU64,
    batches: Mutex<std::collections::HashMap<u64, BatchState>>,
    running: Arc<RwLock<bool>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl CommandHandler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<ConfigStore>,
        events: EventBus,
        transport: Arc<ConfigTransport>,
        data_queue: Arc<DataQueue>,
        stream_queue: Arc<DataQueue>,
        stream_gate: StreamGate,
        metrics: Arc<LinkMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            events,
            transport,
            data_queue,
            stream_queue,
            stream_gate,
            metrics,
            status_source: RwLock::new(None),
            next_command_id: AtomicU64::new(1),
            next_batch_id: AtomicU64::new(1),
            batches: Mutex::new(std::collections::HashMap::new()),
            running: Arc::new(RwLock::new(false)),
            task: RwLock::new(None),
        })
    }

    pub async fn set_status_source(&self, source: Arc<dyn StatusSource>) {
        *self.status_source.write().await = Some(source);
    }

    /// Start the dispatch worker consuming reassembled messages.
    pub async fn start(self: &Arc<Self>, mut inbound: mpsc::Receiver<Vec<u8>>) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let handler = self.clone();
        let running_flag = self.running.clone();

        let handle = tokio::spawn(async move {
            let mut queue = CommandQueue::new();
            loop {
                if !*running_flag.read().await {
                    break;
                }

                // Pull everything already waiting so priorities can sort.
                while let Ok(raw) = inbound.try_recv() {
                    handler.enqueue_raw(&mut queue, raw).await;
                }

                if let Some(pending) = queue.pop() {
                    if let Some(tag) = pending.batch {
                        let result = handler.execute(&pending.message).await;
                        handler.complete_batch_element(tag, result).await;
                    } else if is_parallel_batch(&pending.message) {
                        handler.fan_out_parallel(&mut queue, pending).await;
                    } else {
                        let response = handler.execute(&pending.message).await;
                        handler.respond(pending.id, response).await;
                    }
                    continue;
                }

                match tokio::time::timeout(Duration::from_millis(50), inbound.recv()).await {
                    Ok(Some(raw)) => handler.enqueue_raw(&mut queue, raw).await,
                    Ok(None) => break,
                    Err(_) => continue,
                }
            }
            debug!("command worker exited");
        });

        let mut task = self.task.write().await;
        *task = Some(handle);
        info!("command handler started");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);
        let handle = self.task.write().await.take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
        info!("command handler stopped");
    }

    async fn enqueue_raw(&self, queue: &mut CommandQueue, raw: Vec<u8>) {
        match CommandMessage::parse(&raw) {
            Ok(message) => {
                let id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
                debug!(id, op = ?message.op, entity = %message.entity, "command queued");
                queue.push(PendingCommand {
                    id,
                    priority: message.priority(),
                    message,
                    batch: None,
                });
            }
            Err(e) => {
                warn!("unparseable command: {}", e);
                self.respond(0, fail(ErrorKind::ConfigInvalid, e)).await;
            }
        }
    }

    async fn respond(&self, id: u64, mut response: Value) {
        if let Value::Object(map) = &mut response {
            map.insert("id".to_string(), json!(id));
        }
        if let Err(e) = self.transport.send_json(&response).await {
            warn!(id, "response send failed: {}", e);
        }
    }

    /// Fan a parallel batch out into the queue: every sub-command becomes
    /// an independent entry with its own id and priority, tagged with the
    /// batch id, so other traffic interleaves by (priority, arrival). The
    /// client is answered once the last element completes.
    async fn fan_out_parallel(&self, queue: &mut CommandQueue, pending: PendingCommand) {
        let commands = pending.message.commands.unwrap_or_default();
        if commands.is_empty() {
            self.respond(pending.id, fail(ErrorKind::ConfigInvalid, "empty batch"))
                .await;
            return;
        }
        let batch_id = self.next_batch_id.fetch_add(1, Ordering::Relaxed);
        self.batches.lock().await.insert(
            batch_id,
            BatchState {
                respond_id: pending.id,
                results: vec![None; commands.len()],
                completed: 0,
            },
        );
        debug!(batch_id, count = commands.len(), "parallel batch fanned out");
        for (index, message) in commands.into_iter().enumerate() {
            let id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
            queue.push(PendingCommand {
                id,
                priority: message.priority(),
                message,
                batch: Some(BatchTag { batch_id, index }),
            });
        }
    }

    /// Record one finished batch element; reply when the batch is whole.
    async fn complete_batch_element(&self, tag: BatchTag, result: Value) {
        let finished = {
            let mut batches = self.batches.lock().await;
            let Some(state) = batches.get_mut(&tag.batch_id) else {
                warn!(batch_id = tag.batch_id, "completion for unknown batch");
                return;
            };
            if state.results[tag.index].is_none() {
                state.completed += 1;
            }
            state.results[tag.index] = Some(result);
            if state.completed == state.results.len() {
                batches.remove(&tag.batch_id)
            } else {
                None
            }
        };
        if let Some(state) = finished {
            let results: Vec<Value> = state.results.into_iter().flatten().collect();
            debug!(batch_id = tag.batch_id, "parallel batch complete");
            self.respond(state.respond_id, batch_response(results)).await;
        }
    }

    /// Execute one command and produce its response document.
    pub fn execute<'a>(&'a self, message: &'a CommandMessage) -> BoxFuture<'a, Value> {
        async move {
            match message.op {
                Op::Read => self.handle_read(message).await,
                Op::Create => self.handle_create(message).await,
                Op::Update => self.handle_update(message).await,
                Op::Delete => self.handle_delete(message).await,
                Op::Batch => self.handle_batch(message).await,
            }
        }
        .boxed()
    }

    // ---- read ----

    async fn handle_read(&self, message: &CommandMessage) -> Value {
        match message.entity.as_str() {
            "device" => {
                let Some(device_id) = message.device_id.as_deref() else {
                    return fail(ErrorKind::ConfigInvalid, "device_id required");
                };
                match self.store.get_device(device_id) {
                    Ok(device) => ok(json!(device)),
                    Err(e) => store_fail(e),
                }
            }
            "devices_with_registers" => match self.store.list_devices() {
                Ok(devices) => {
                    let mut data = json!(devices);
                    if message.minimal.unwrap_or(false) {
                        strip_descriptions(&mut data);
                    }
                    ok(data)
                }
                Err(e) => store_fail(e),
            },
            "server_config" => match self.store.server_config() {
                Ok(config) => ok(json!(config)),
                Err(e) => store_fail(e),
            },
            "logging_config" => match self.store.logging_config() {
                Ok(config) => ok(json!(config)),
                Err(e) => store_fail(e),
            },
            "ota_config" => match self.store.ota_config() {
                Ok(config) => ok(json!(config)),
                Err(e) => store_fail(e),
            },
            "full_config" => match self.store.export() {
                Ok(snapshot) => ok(json!(snapshot)),
                Err(e) => store_fail(e),
            },
            "status" => self.build_status().await,
            "ble_metrics" => ok(json!(self.metrics.report())),
            other => fail(
                ErrorKind::ConfigInvalid,
                format!("unknown read type '{}'", other),
            ),
        }
    }

    async fn build_status(&self) -> Value {
        let mut status = json!({
            "stream_device": self.stream_gate.active(),
            "mtu": self.transport.negotiated_mtu().await,
        });
        if let Ok(stats) = self.data_queue.stats().await {
            status["data_queue"] = json!(stats);
        }
        if let Ok(stats) = self.stream_queue.stats().await {
            status["stream_queue"] = json!(stats);
        }
        if let Some(source) = self.status_source.read().await.as_ref() {
            let extra = source.snapshot().await;
            merge_json(&mut status, &extra);
        }
        ok(status)
    }

    // ---- create ----

    async fn handle_create(&self, message: &CommandMessage) -> Value {
        match message.entity.as_str() {
            "device" => {
                let Some(config) = message.config.as_ref() else {
                    return fail(ErrorKind::ConfigInvalid, "config required");
                };
                let device = match serde_json::from_value(config.clone()) {
                    Ok(device) => device,
                    Err(e) => return fail(ErrorKind::ConfigInvalid, e.to_string()),
                };
                match self.store.create_device(device) {
                    Ok(created) => {
                        self.events.publish(GatewayEvent::DeviceCreated {
                            device_id: created.device_id.clone(),
                        });
                        ok(json!(created))
                    }
                    Err(e) => store_fail(e),
                }
            }
            "register" => self.create_register(message).await,
            "stream_start" => {
                let Some(device_id) = message.device_id.as_deref() else {
                    return fail(ErrorKind::ConfigInvalid, "device_id required");
                };
                match self.store.device_exists(device_id) {
                    Ok(true) => {
                        self.stream_gate.start(device_id);
                        self.events.publish(GatewayEvent::StreamStarted {
                            device_id: device_id.to_string(),
                        });
                        info!(device_id, "streaming started");
                        ok_unit()
                    }
                    Ok(false) => fail(
                        ErrorKind::ConfigNotFound,
                        format!("device '{}'", device_id),
                    ),
                    Err(e) => store_fail(e),
                }
            }
            "restore_config" => {
                let Some(config) = message.config.as_ref() else {
                    return fail(ErrorKind::ConfigInvalid, "config required");
                };
                let snapshot: FullConfig = match serde_json::from_value(config.clone()) {
                    Ok(snapshot) => snapshot,
                    Err(e) => return fail(ErrorKind::ConfigInvalid, e.to_string()),
                };
                match self.store.restore(&snapshot) {
                    Ok(()) => {
                        self.events.publish(GatewayEvent::ConfigRestored);
                        ok(json!({"devices": snapshot.devices.len()}))
                    }
                    Err(e) => store_fail(e),
                }
            }
            other => fail(
                ErrorKind::ConfigInvalid,
                format!("unknown create type '{}'", other),
            ),
        }
    }

    async fn create_register(&self, message: &CommandMessage) -> Value {
        let Some(device_id) = message.device_id.as_deref() else {
            return fail(ErrorKind::ConfigInvalid, "device_id required");
        };
        let Some(config) = message.config.as_ref() else {
            return fail(ErrorKind::ConfigInvalid, "config required");
        };
        let mut register: fieldgate_core::RegisterConfig =
            match serde_json::from_value(config.clone()) {
                Ok(register) => register,
                Err(e) => return fail(ErrorKind::ConfigInvalid, e.to_string()),
            };
        if register.register_id.is_empty() {
            register.register_id = generate_device_id();
        }
        if let Err(e) = register.validate() {
            return fail(ErrorKind::ConfigInvalid, e.to_string());
        }

        let mut device = match self.store.get_device(device_id) {
            Ok(device) => device,
            Err(e) => return store_fail(e),
        };
        if device.register(&register.register_id).is_some() {
            return fail(
                ErrorKind::ConfigInvalid,
                format!("register '{}' already exists", register.register_id),
            );
        }
        device.registers.push(register.clone());
        match self.store.update_device(device) {
            Ok(_) => {
                self.events.publish(GatewayEvent::DeviceUpdated {
                    device_id: device_id.to_string(),
                });
                ok(json!(register))
            }
            Err(e) => store_fail(e),
        }
    }

    // ---- update ----

    async fn handle_update(&self, message: &CommandMessage) -> Value {
        match message.entity.as_str() {
            "device" => self.update_device(message).await,
            "register" => self.update_register(message).await,
            "server_config" => {
                let response = self
                    .update_document(message, |store| store.server_config(), |store, config: &ServerConfig| store.set_server_config(config))
                    .await;
                if response["status"] == "ok" {
                    self.events.publish(GatewayEvent::ServerConfigUpdated);
                }
                response
            }
            "logging_config" => {
                let response = self
                    .update_document(message, |store| store.logging_config(), |store, config: &LoggingConfig| store.set_logging_config(config))
                    .await;
                if response["status"] == "ok" {
                    self.events.publish(GatewayEvent::LoggingConfigUpdated);
                }
                response
            }
            "ota_config" => {
                let response = self
                    .update_document(message, |store| store.ota_config(), |store, config: &OtaConfig| store.set_ota_config(config))
                    .await;
                if response["status"] == "ok" {
                    self.events.publish(GatewayEvent::OtaConfigUpdated);
                }
                response
            }
            "device_control" => self.device_control(message).await,
            other => fail(
                ErrorKind::ConfigInvalid,
                format!("unknown update type '{}'", other),
            ),
        }
    }

    /// Merge-and-store for the scalar documents.
    async fn update_document<T, R, W>(&self, message: &CommandMessage, read: R, write: W) -> Value
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        R: Fn(&ConfigStore) -> fieldgate_storage::Result<T>,
        W: Fn(&ConfigStore, &T) -> fieldgate_storage::Result<()>,
    {
        let Some(patch) = message.config.as_ref() else {
            return fail(ErrorKind::ConfigInvalid, "config required");
        };
        let current = match read(&self.store) {
            Ok(current) => current,
            Err(e) => return store_fail(e),
        };
        let mut merged = match serde_json::to_value(&current) {
            Ok(value) => value,
            Err(e) => return fail(ErrorKind::Internal, e.to_string()),
        };
        merge_json(&mut merged, patch);
        let updated: T = match serde_json::from_value(merged.clone()) {
            Ok(updated) => updated,
            Err(e) => return fail(ErrorKind::ConfigInvalid, e.to_string()),
        };
        match write(&self.store, &updated) {
            Ok(()) => ok(merged),
            Err(e) => store_fail(e),
        }
    }

    async fn update_device(&self, message: &CommandMessage) -> Value {
        let Some(device_id) = message.device_id.as_deref() else {
            return fail(ErrorKind::ConfigInvalid, "device_id required");
        };
        let Some(patch) = message.config.as_ref() else {
            return fail(ErrorKind::ConfigInvalid, "config required");
        };
        let current = match self.store.get_device(device_id) {
            Ok(device) => device,
            Err(e) => return store_fail(e),
        };
        let mut merged = match serde_json::to_value(&current) {
            Ok(value) => value,
            Err(e) => return fail(ErrorKind::Internal, e.to_string()),
        };
        merge_json(&mut merged, patch);
        let mut updated: fieldgate_core::DeviceConfig = match serde_json::from_value(merged) {
            Ok(updated) => updated,
            Err(e) => return fail(ErrorKind::ConfigInvalid, e.to_string()),
        };
        // The identifier is not patchable.
        updated.device_id = device_id.to_string();
        match self.store.update_device(updated) {
            Ok(stored) => {
                self.events.publish(GatewayEvent::DeviceUpdated {
                    device_id: device_id.to_string(),
                });
                ok(json!(stored))
            }
            Err(e) => store_fail(e),
        }
    }

    async fn update_register(&self, message: &CommandMessage) -> Value {
        let Some(device_id) = message.device_id.as_deref() else {
            return fail(ErrorKind::ConfigInvalid, "device_id required");
        };
        let Some(register_id) = message.register_id.as_deref() else {
            return fail(ErrorKind::ConfigInvalid, "register_id required");
        };
        let Some(patch) = message.config.as_ref() else {
            return fail(ErrorKind::ConfigInvalid, "config required");
        };
        let mut device = match self.store.get_device(device_id) {
            Ok(device) => device,
            Err(e) => return store_fail(e),
        };
        let Some(index) = device
            .registers
            .iter()
            .position(|r| r.register_id == register_id)
        else {
            return fail(
                ErrorKind::ConfigNotFound,
                format!("register '{}'", register_id),
            );
        };
        let mut merged = match serde_json::to_value(&device.registers[index]) {
            Ok(value) => value,
            Err(e) => return fail(ErrorKind::Internal, e.to_string()),
        };
        merge_json(&mut merged, patch);
        let mut updated: fieldgate_core::RegisterConfig = match serde_json::from_value(merged) {
            Ok(updated) => updated,
            Err(e) => return fail(ErrorKind::ConfigInvalid, e.to_string()),
        };
        updated.register_id = register_id.to_string();
        if let Err(e) = updated.validate() {
            return fail(ErrorKind::ConfigInvalid, e.to_string());
        }
        device.registers[index] = updated.clone();
        match self.store.update_device(device) {
            Ok(_) => {
                self.events.publish(GatewayEvent::DeviceUpdated {
                    device_id: device_id.to_string(),
                });
                ok(json!(updated))
            }
            Err(e) => store_fail(e),
        }
    }

    async fn device_control(&self, message: &CommandMessage) -> Value {
        let Some(device_id) = message.device_id.as_deref() else {
            return fail(ErrorKind::ConfigInvalid, "device_id required");
        };
        let Some(action) = message.action.as_deref() else {
            return fail(ErrorKind::ConfigInvalid, "action required");
        };
        let enabled = match action {
            "enable" => true,
            "disable" => false,
            other => {
                return fail(
                    ErrorKind::ConfigInvalid,
                    format!("unknown action '{}'", other),
                )
            }
        };
        let mut device = match self.store.get_device(device_id) {
            Ok(device) => device,
            Err(e) => return store_fail(e),
        };
        device.enabled = enabled;
        match self.store.update_device(device) {
            Ok(stored) => {
                info!(
                    device_id,
                    action,
                    detail = message.reason_detail.as_deref().unwrap_or(""),
                    "device control applied"
                );
                self.events.publish(GatewayEvent::DeviceUpdated {
                    device_id: device_id.to_string(),
                });
                ok(json!({"device_id": stored.device_id, "enabled": stored.enabled}))
            }
            Err(e) => store_fail(e),
        }
    }

    // ---- delete ----

    async fn handle_delete(&self, message: &CommandMessage) -> Value {
        match message.entity.as_str() {
            "device" => {
                let Some(device_id) = message.device_id.as_deref() else {
                    return fail(ErrorKind::ConfigInvalid, "device_id required");
                };
                match self.store.delete_device(device_id) {
                    Ok(removed) => {
                        // Flush the dead device's measurements before
                        // confirming, so nothing of it is published later.
                        if let Err(e) = self.data_queue.flush_by_device(device_id).await {
                            warn!(device_id, "data queue flush failed: {}", e);
                        }
                        if let Err(e) = self.stream_queue.flush_by_device(device_id).await {
                            warn!(device_id, "stream queue flush failed: {}", e);
                        }
                        if self.stream_gate.is_streaming(device_id) {
                            self.stream_gate.stop();
                        }
                        self.events.publish(GatewayEvent::DeviceDeleted {
                            device_id: device_id.to_string(),
                        });
                        ok(json!(removed))
                    }
                    Err(e) => store_fail(e),
                }
            }
            "register" => {
                let Some(device_id) = message.device_id.as_deref() else {
                    return fail(ErrorKind::ConfigInvalid, "device_id required");
                };
                let Some(register_id) = message.register_id.as_deref() else {
                    return fail(ErrorKind::ConfigInvalid, "register_id required");
                };
                let mut device = match self.store.get_device(device_id) {
                    Ok(device) => device,
                    Err(e) => return store_fail(e),
                };
                let Some(index) = device
                    .registers
                    .iter()
                    .position(|r| r.register_id == register_id)
                else {
                    return fail(
                        ErrorKind::ConfigNotFound,
                        format!("register '{}'", register_id),
                    );
                };
                let removed = device.registers.remove(index);
                match self.store.update_device(device) {
                    Ok(_) => {
                        self.events.publish(GatewayEvent::DeviceUpdated {
                            device_id: device_id.to_string(),
                        });
                        ok(json!(removed))
                    }
                    Err(e) => store_fail(e),
                }
            }
            "stream_stop" => {
                self.stream_gate.stop();
                self.events.publish(GatewayEvent::StreamStopped);
                info!("streaming stopped");
                ok_unit()
            }
            "factory_reset" => match self.store.factory_reset() {
                Ok(()) => {
                    self.events.publish(GatewayEvent::FactoryReset);
                    self.events.publish(GatewayEvent::RestartRequested {
                        reason: message
                            .reason
                            .clone()
                            .unwrap_or_else(|| "factory reset".to_string()),
                    });
                    ok_unit()
                }
                Err(e) => store_fail(e),
            },
            other => fail(
                ErrorKind::ConfigInvalid,
                format!("unknown delete type '{}'", other),
            ),
        }
    }

    // ---- batch ----

    async fn handle_batch(&self, message: &CommandMessage) -> Value {
        let Some(commands) = message.commands.as_ref() else {
            return fail(ErrorKind::ConfigInvalid, "commands required");
        };
        if commands.is_empty() {
            return fail(ErrorKind::ConfigInvalid, "empty batch");
        }
        let mode = message.mode.unwrap_or_default();
        debug!(?mode, count = commands.len(), "batch started");

        match mode {
            BatchMode::Sequential => {
                let mut results = Vec::with_capacity(commands.len());
                for command in commands {
                    results.push(self.execute(command).await);
                }
                batch_response(results)
            }
            BatchMode::Parallel => {
                // Top-level parallel batches are fanned out into the
                // command queue by the worker and never reach this arm. A
                // parallel batch nested inside another batch executes its
                // elements in place.
                let mut results = Vec::with_capacity(commands.len());
                for command in commands {
                    results.push(self.execute(command).await);
                }
                batch_response(results)
            }
            BatchMode::Atomic => {
                let snapshot = match self.store.export() {
                    Ok(snapshot) => snapshot,
                    Err(e) => return store_fail(e),
                };
                let mut results = Vec::with_capacity(commands.len());
                for (index, command) in commands.iter().enumerate() {
                    let result = self.execute(command).await;
                    let failed = result["status"] != "ok";
                    results.push(result);
                    if failed {
                        if let Err(e) = self.store.restore(&snapshot) {
                            warn!("atomic rollback failed: {}", e);
                            return fail(
                                ErrorKind::StoreIo,
                                format!("rollback after element {} failed: {}", index, e),
                            );
                        }
                        self.events.publish(GatewayEvent::ConfigRestored);
                        return json!({
                            "status": "error",
                            "error_code": ErrorKind::ConfigInvalid.code(),
                            "error": format!("atomic batch failed at element {}", index),
                            "results": results,
                        });
                    }
                }
                batch_response(results)
            }
        }
    }
}

fn batch_response(results: Vec<Value>) -> Value {
    let ok_count = results.iter().filter(|r| r["status"] == "ok").count();
    let status = if ok_count == results.len() {
        "ok"
    } else if ok_count > 0 {
        "partial"
    } else {
        "error"
    };
    json!({"status": status, "results": results})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryLink;
    use fieldgate_core::{DataQueue, MeasurementPoint};

    struct Fixture {
        handler: Arc<CommandHandler>,
        store: Arc<ConfigStore>,
        data_queue: Arc<DataQueue>,
        gate: StreamGate,
        events: EventBus,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(ConfigStore::ephemeral().unwrap());
        let events = EventBus::new();
        let gate = StreamGate::new();
        let metrics = Arc::new(LinkMetrics::new());
        let (link, _client) = MemoryLink::pair();
        let (transport, _inbound) = ConfigTransport::new(link, gate.clone(), metrics.clone());
        let data_queue = Arc::new(DataQueue::new());
        let stream_queue = Arc::new(DataQueue::with_capacity(50));
        let handler = CommandHandler::new(
            store.clone(),
            events.clone(),
            transport,
            data_queue.clone(),
            stream_queue,
            gate.clone(),
            metrics,
        );
        Fixture {
            handler,
            store,
            data_queue,
            gate,
            events,
        }
    }

    fn create_device_message(name: &str) -> CommandMessage {
        CommandMessage::parse(
            format!(
                r#"{{"op":"create","type":"device","config":{{"device_name":"{}","protocol":"RTU","slave_id":1,"serial_port":1,"baud_rate":9600,"refresh_rate_ms":5000,"timeout":3000,"retry_count":3}}}}"#,
                name
            )
            .as_bytes(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_device_returns_generated_id() {
        let f = fixture();
        let response = f.handler.execute(&create_device_message("M1")).await;
        assert_eq!(response["status"], "ok");
        let device_id = response["data"]["device_id"].as_str().unwrap();
        assert_eq!(device_id.len(), 6);
        assert!(f.store.get_device(device_id).is_ok());
    }

    #[tokio::test]
    async fn test_create_register_and_span_boundary() {
        let f = fixture();
        let created = f.handler.execute(&create_device_message("M1")).await;
        let device_id = created["data"]["device_id"].as_str().unwrap();

        let message = CommandMessage::parse(
            format!(
                r#"{{"op":"create","type":"register","device_id":"{}","config":{{"register_name":"V1","address":40001,"function_code":3,"data_type":"FLOAT32_BE","scale":0.01,"unit":"V"}}}}"#,
                device_id
            )
            .as_bytes(),
        )
        .unwrap();
        let response = f.handler.execute(&message).await;
        assert_eq!(response["status"], "ok");

        // address + span - 1 past 65535 is CONFIG_INVALID.
        let message = CommandMessage::parse(
            format!(
                r#"{{"op":"create","type":"register","device_id":"{}","config":{{"register_name":"bad","address":65535,"function_code":3,"data_type":"FLOAT32_BE"}}}}"#,
                device_id
            )
            .as_bytes(),
        )
        .unwrap();
        let response = f.handler.execute(&message).await;
        assert_eq!(response["status"], "error");
        assert_eq!(response["error_code"], 101);
    }

    #[tokio::test]
    async fn test_read_unknown_device_is_not_found() {
        let f = fixture();
        let message =
            CommandMessage::parse(br#"{"op":"read","type":"device","device_id":"FFFFFF"}"#)
                .unwrap();
        let response = f.handler.execute(&message).await;
        assert_eq!(response["status"], "error");
        assert_eq!(response["error_code"], 102);
    }

    #[tokio::test]
    async fn test_update_device_is_idempotent() {
        let f = fixture();
        let created = f.handler.execute(&create_device_message("M1")).await;
        let device_id = created["data"]["device_id"].as_str().unwrap().to_string();

        let message = CommandMessage::parse(
            format!(
                r#"{{"op":"update","type":"device","device_id":"{}","config":{{"refresh_rate_ms":1000}}}}"#,
                device_id
            )
            .as_bytes(),
        )
        .unwrap();
        let first = f.handler.execute(&message).await;
        let second = f.handler.execute(&message).await;
        assert_eq!(first, second);
        assert_eq!(f.store.get_device(&device_id).unwrap().refresh_rate_ms, 1000);
    }

    #[tokio::test]
    async fn test_delete_device_flushes_only_its_points() {
        let f = fixture();
        let created = f.handler.execute(&create_device_message("M1")).await;
        let device_id = created["data"]["device_id"].as_str().unwrap().to_string();

        let mine = MeasurementPoint {
            timestamp: 0,
            device_id: device_id.clone(),
            device_name: "M1".to_string(),
            register_id: "r1".to_string(),
            register_name: "r1".to_string(),
            value: 1.0,
            unit: String::new(),
            description: String::new(),
        };
        let other = MeasurementPoint {
            device_id: "0B0B0B".to_string(),
            ..mine.clone()
        };
        f.data_queue.enqueue(mine).await.unwrap();
        f.data_queue.enqueue(other).await.unwrap();

        let message = CommandMessage::parse(
            format!(r#"{{"op":"delete","type":"device","device_id":"{}"}}"#, device_id).as_bytes(),
        )
        .unwrap();
        let response = f.handler.execute(&message).await;
        assert_eq!(response["status"], "ok");
        assert_eq!(response["data"]["name"], "M1");

        assert_eq!(f.data_queue.len().await.unwrap(), 1);
        assert_eq!(
            f.data_queue.peek().await.unwrap().unwrap().device_id,
            "0B0B0B"
        );
    }

    #[tokio::test]
    async fn test_stream_lifecycle() {
        let f = fixture();
        let created = f.handler.execute(&create_device_message("M1")).await;
        let device_id = created["data"]["device_id"].as_str().unwrap().to_string();

        let start = CommandMessage::parse(
            format!(
                r#"{{"op":"create","type":"stream_start","device_id":"{}"}}"#,
                device_id
            )
            .as_bytes(),
        )
        .unwrap();
        assert_eq!(f.handler.execute(&start).await["status"], "ok");
        assert!(f.gate.is_streaming(&device_id));

        let stop =
            CommandMessage::parse(br#"{"op":"delete","type":"stream_stop"}"#).unwrap();
        assert_eq!(f.handler.execute(&stop).await["status"], "ok");
        assert!(f.gate.active().is_none());
    }

    #[tokio::test]
    async fn test_batch_sequential_partial() {
        let f = fixture();
        let batch = CommandMessage::parse(
            br#"{"op":"batch","mode":"sequential","commands":[
                {"op":"create","type":"device","config":{"device_name":"A","protocol":"RTU","slave_id":1,"serial_port":1,"baud_rate":9600,"refresh_rate_ms":1000,"timeout":1000,"retry_count":3}},
                {"op":"read","type":"device","device_id":"FFFFFF"}
            ]}"#,
        )
        .unwrap();
        let response = f.handler.execute(&batch).await;
        assert_eq!(response["status"], "partial");
        assert_eq!(response["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_parallel_batch_fans_out_through_queue() {
        let f = fixture();
        let batch = CommandMessage::parse(
            br#"{"op":"batch","mode":"parallel","commands":[
                {"op":"read","type":"server_config"},
                {"op":"read","type":"device","device_id":"FFFFFF","priority":0}
            ]}"#,
        )
        .unwrap();
        assert!(is_parallel_batch(&batch));
        let pending = PendingCommand {
            id: 77,
            priority: batch.priority(),
            message: batch,
            batch: None,
        };

        let mut queue = CommandQueue::new();
        f.handler.fan_out_parallel(&mut queue, pending).await;
        assert_eq!(queue.len(), 2);

        // Sub-commands are independent queue entries: the high-priority
        // element pops ahead of the normal one it arrived after.
        let first = queue.pop().unwrap();
        assert_eq!(first.message.entity, "device");
        let first_tag = first.batch.unwrap();
        assert_eq!(first_tag.index, 1);

        let result = f.handler.execute(&first.message).await;
        f.handler.complete_batch_element(first_tag, result).await;
        assert!(!f.handler.batches.lock().await.is_empty());

        let second = queue.pop().unwrap();
        let second_tag = second.batch.unwrap();
        let result = f.handler.execute(&second.message).await;
        f.handler.complete_batch_element(second_tag, result).await;

        // Last completion drains the tracking table (and answers the
        // client through the transport).
        assert!(f.handler.batches.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_batch_atomic_rolls_back() {
        let f = fixture();
        let before = f.store.device_count().unwrap();

        let batch = CommandMessage::parse(
            br#"{"op":"batch","mode":"atomic","commands":[
                {"op":"create","type":"device","config":{"device_name":"A","protocol":"RTU","slave_id":1,"serial_port":1,"baud_rate":9600,"refresh_rate_ms":1000,"timeout":1000,"retry_count":3}},
                {"op":"create","type":"device","config":{"device_name":"bad","protocol":"RTU","slave_id":0,"serial_port":1,"baud_rate":9600,"refresh_rate_ms":1000,"timeout":1000,"retry_count":3}}
            ]}"#,
        )
        .unwrap();
        let response = f.handler.execute(&batch).await;
        assert_eq!(response["status"], "error");

        // Persisted state is identical to the pre-batch state.
        assert_eq!(f.store.device_count().unwrap(), before);
    }

    #[tokio::test]
    async fn test_full_config_roundtrip_via_commands() {
        let f = fixture();
        f.handler.execute(&create_device_message("M1")).await;
        f.handler.execute(&create_device_message("M2")).await;

        let export =
            CommandMessage::parse(br#"{"op":"read","type":"full_config"}"#).unwrap();
        let exported = f.handler.execute(&export).await;
        assert_eq!(exported["status"], "ok");

        let reset =
            CommandMessage::parse(br#"{"op":"delete","type":"factory_reset","reason":"test"}"#)
                .unwrap();
        assert_eq!(f.handler.execute(&reset).await["status"], "ok");
        assert_eq!(f.store.device_count().unwrap(), 0);

        let restore = CommandMessage {
            op: Op::Create,
            entity: "restore_config".to_string(),
            device_id: None,
            register_id: None,
            config: Some(exported["data"].clone()),
            priority: None,
            minimal: None,
            action: None,
            reason: None,
            reason_detail: None,
            mode: None,
            commands: None,
        };
        assert_eq!(f.handler.execute(&restore).await["status"], "ok");

        let after = f.store.export().unwrap();
        assert_eq!(after.devices.len(), 2);
        assert_eq!(
            serde_json::to_value(&after.devices).unwrap(),
            exported["data"]["devices"]
        );
    }

    #[tokio::test]
    async fn test_device_control_disable() {
        let f = fixture();
        let created = f.handler.execute(&create_device_message("M1")).await;
        let device_id = created["data"]["device_id"].as_str().unwrap().to_string();
        let mut events = f.events.subscribe();

        let message = CommandMessage::parse(
            format!(
                r#"{{"op":"update","type":"device_control","device_id":"{}","action":"disable","reason_detail":"maintenance"}}"#,
                device_id
            )
            .as_bytes(),
        )
        .unwrap();
        let response = f.handler.execute(&message).await;
        assert_eq!(response["status"], "ok");
        assert_eq!(response["data"]["enabled"], false);
        assert!(!f.store.get_device(&device_id).unwrap().enabled);
        assert_eq!(
            events.recv().await,
            Some(GatewayEvent::DeviceUpdated {
                device_id: device_id.clone()
            })
        );
    }

    #[tokio::test]
    async fn test_minimal_snapshot_strips_descriptions() {
        let f = fixture();
        f.handler.execute(&create_device_message("M1")).await;
        let message = CommandMessage::parse(
            br#"{"op":"read","type":"devices_with_registers","minimal":true}"#,
        )
        .unwrap();
        let response = f.handler.execute(&message).await;
        assert_eq!(response["status"], "ok");
        assert!(response["data"][0].get("description").is_none());
    }

    #[test]
    fn test_merge_json_deep() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "keep": true, "arr": [1, 2]});
        merge_json(
            &mut base,
            &json!({"a": {"b": 9}, "arr": [3], "new": "x"}),
        );
        assert_eq!(base["a"]["b"], 9);
        assert_eq!(base["a"]["c"], 2);
        assert_eq!(base["keep"], true);
        assert_eq!(base["arr"], json!([3]));
        assert_eq!(base["new"], "x");
    }
}
