//! Modbus TCP driver.
//!
//! Mirrors the RTU driver with a TCP transport: a pool of persistent
//! sockets keyed by `ip:port`, an atomic transaction sequence shared across
//! devices, and a slower backoff (connection setup is expensive). Pool
//! entries idle for a minute or older than five minutes are closed by the
//! maintenance sweep.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fieldgate_core::{DataQueue, DeviceConfig, DeviceRuntime, Protocol, RegisterConfig, StreamGate};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_modbus::client;
use tokio_modbus::prelude::*;
use tracing::{debug, info, warn};

use crate::engine::{PollEngine, AUTO_RECOVERY_SWEEP_MS, TCP_POLICY};
use crate::error::{ModbusError, Result};
use crate::pass::{polling_pass, PassReport, PassSinks};
use crate::write;

/// Poll loop tick.
const POLL_TICK_MS: u64 = 50;

/// Maximum concurrent persistent sockets.
pub const MAX_POOL_SIZE: usize = 10;

/// Idle sockets are closed after this long.
pub const POOL_IDLE_MS: u64 = 60_000;

/// Sockets are recycled after this age regardless of use.
pub const POOL_MAX_AGE_MS: u64 = 5 * 60 * 1000;

struct PoolEntry {
    ctx: client::Context,
    created_at_ms: u64,
    last_used_ms: u64,
    use_count: u64,
}

struct TcpShared {
    engine: Mutex<PollEngine>,
    pool: Mutex<HashMap<String, PoolEntry>>,
    transaction_seq: AtomicU16,
    data_queue: Arc<DataQueue>,
    stream_queue: Arc<DataQueue>,
    stream_gate: StreamGate,
    epoch: Instant,
}

impl TcpShared {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn sinks(&self) -> PassSinks<'_> {
        PassSinks {
            data_queue: &self.data_queue,
            stream_queue: &self.stream_queue,
            stream_gate: &self.stream_gate,
        }
    }

    fn next_transaction(&self) -> u16 {
        self.transaction_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Drop pool entries that are idle or past their maximum age.
    async fn maintain_pool(&self) {
        let now = self.now_ms();
        let mut pool = self.pool.lock().await;
        pool.retain(|key, entry| {
            let idle = now.saturating_sub(entry.last_used_ms);
            let age = now.saturating_sub(entry.created_at_ms);
            let keep = idle <= POOL_IDLE_MS && age <= POOL_MAX_AGE_MS;
            if !keep {
                debug!(peer = %key, idle, age, use_count = entry.use_count, "closing pooled connection");
            }
            keep
        });
    }

    /// Connect (or reuse) the pooled socket for a device, then run `f`-like
    /// pass inside the pool lock scope. Eviction on a full pool removes the
    /// least recently used entry.
    async fn connect(&self, device: &DeviceConfig) -> Result<client::Context> {
        let ip = device
            .ip_address
            .as_deref()
            .ok_or_else(|| ModbusError::Config("TCP device missing ip_address".to_string()))?;
        let addr: SocketAddr = format!("{}:{}", ip, device.tcp_port())
            .parse()
            .map_err(|e| ModbusError::Connection(format!("invalid address: {}", e)))?;
        let timeout = Duration::from_millis(device.timeout_ms.max(1));

        let ctx = tokio::time::timeout(timeout, tcp::connect_slave(addr, Slave(device.unit_id())))
            .await
            .map_err(|_| ModbusError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| ModbusError::Connection(e.to_string()))?;
        Ok(ctx)
    }
}

/// TCP polling driver with a persistent connection pool.
pub struct TcpDriver {
    shared: Arc<TcpShared>,
    running: Arc<RwLock<bool>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl TcpDriver {
    pub fn new(
        data_queue: Arc<DataQueue>,
        stream_queue: Arc<DataQueue>,
        stream_gate: StreamGate,
    ) -> Self {
        Self {
            shared: Arc::new(TcpShared {
                engine: Mutex::new(PollEngine::new(TCP_POLICY)),
                pool: Mutex::new(HashMap::new()),
                transaction_seq: AtomicU16::new(0),
                data_queue,
                stream_queue,
                stream_gate,
                epoch: Instant::now(),
            }),
            running: Arc::new(RwLock::new(false)),
            task: RwLock::new(None),
        }
    }

    /// Refresh the cached device table from a store snapshot.
    pub async fn reload(&self, devices: Vec<DeviceConfig>) {
        let tcp_devices: Vec<DeviceConfig> = devices
            .into_iter()
            .filter(|d| d.protocol == Protocol::Tcp)
            .collect();
        let now = self.shared.now_ms();
        let delta = self.shared.engine.lock().await.reload(tcp_devices, now);
        for device_id in &delta.removed {
            match self.shared.data_queue.flush_by_device(device_id).await {
                Ok(flushed) => {
                    debug!(device_id, flushed, "flushed measurements of removed device")
                }
                Err(e) => warn!(device_id, "flush after removal failed: {}", e),
            }
        }
        info!(
            added = delta.added.len(),
            removed = delta.removed.len(),
            updated = delta.updated.len(),
            "TCP device table reloaded"
        );
    }

    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let shared = self.shared.clone();
        let running_flag = self.running.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(POLL_TICK_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_recovery_ms = 0u64;

            loop {
                if !*running_flag.read().await {
                    break;
                }
                tick.tick().await;

                let now = shared.now_ms();
                if now.saturating_sub(last_recovery_ms) >= AUTO_RECOVERY_SWEEP_MS {
                    let recovered = shared.engine.lock().await.auto_recover(now);
                    if !recovered.is_empty() {
                        info!(count = recovered.len(), "TCP devices auto-recovered");
                    }
                    last_recovery_ms = now;
                }

                shared.maintain_pool().await;

                let due = shared.engine.lock().await.due_devices(now);
                for device in due {
                    Self::poll_device(&shared, &device).await;
                }
            }
            debug!("TCP scheduler task exited");
        });

        let mut task = self.task.write().await;
        *task = Some(handle);
        info!("TCP driver started");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);

        let handle = self.task.write().await.take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
        // Close every pooled socket.
        self.shared.pool.lock().await.clear();
        info!("TCP driver stopped");
    }

    fn pool_key(device: &DeviceConfig) -> String {
        format!(
            "{}:{}",
            device.ip_address.as_deref().unwrap_or_default(),
            device.tcp_port()
        )
    }

    async fn poll_device(shared: &TcpShared, device: &DeviceConfig) {
        let key = Self::pool_key(device);
        let txn = shared.next_transaction();
        debug!(device_id = %device.device_id, peer = %key, txn, "polling pass");

        let report = {
            let mut pool = shared.pool.lock().await;
            let now = shared.now_ms();

            if !pool.contains_key(&key) {
                if pool.len() >= MAX_POOL_SIZE {
                    // Evict the least recently used entry.
                    if let Some(lru) = pool
                        .iter()
                        .min_by_key(|(_, e)| e.last_used_ms)
                        .map(|(k, _)| k.clone())
                    {
                        debug!(peer = %lru, "pool full; evicting least recently used");
                        pool.remove(&lru);
                    }
                }
                match shared.connect(device).await {
                    Ok(ctx) => {
                        pool.insert(
                            key.clone(),
                            PoolEntry {
                                ctx,
                                created_at_ms: now,
                                last_used_ms: now,
                                use_count: 0,
                            },
                        );
                    }
                    Err(e) => {
                        drop(pool);
                        Self::apply_report(
                            shared,
                            &device.device_id,
                            PassReport {
                                points: 0,
                                timings: Vec::new(),
                                outcome: Err(e),
                            },
                        )
                        .await;
                        return;
                    }
                }
            }

            let entry = pool.get_mut(&key).expect("entry inserted above");
            entry.ctx.set_slave(Slave(device.unit_id()));
            entry.last_used_ms = now;
            entry.use_count += 1;
            let report = polling_pass(&mut entry.ctx, device, &shared.sinks()).await;
            if report.outcome.is_err() {
                // The socket state is unknown after a failure.
                pool.remove(&key);
            }
            report
        };
        Self::apply_report(shared, &device.device_id, report).await;
    }

    async fn apply_report(shared: &TcpShared, device_id: &str, report: PassReport) {
        let now = shared.now_ms();
        let mut engine = shared.engine.lock().await;
        for timing in &report.timings {
            engine.record_read_success(device_id, now, timing.elapsed_ms);
        }
        match report.outcome {
            Ok(()) => engine.complete_pass(device_id, now),
            Err(ref e) if e.is_timeout() => {
                engine.record_timeout(device_id, now);
            }
            Err(_) => {
                engine.record_failure(device_id, now);
            }
        }
    }

    /// Write a calibrated value to one register of a TCP device.
    pub async fn write_value(
        &self,
        device: &DeviceConfig,
        register: &RegisterConfig,
        value: f64,
    ) -> Result<Vec<u16>> {
        let key = Self::pool_key(device);
        let timeout = Duration::from_millis(device.timeout_ms.max(1));
        let mut pool = self.shared.pool.lock().await;
        let now = self.shared.now_ms();

        if !pool.contains_key(&key) {
            let ctx = self.shared.connect(device).await?;
            pool.insert(
                key.clone(),
                PoolEntry {
                    ctx,
                    created_at_ms: now,
                    last_used_ms: now,
                    use_count: 0,
                },
            );
        }
        let entry = pool.get_mut(&key).expect("entry inserted above");
        entry.ctx.set_slave(Slave(device.unit_id()));
        entry.last_used_ms = now;
        entry.use_count += 1;

        let result = tokio::time::timeout(timeout, write::write_value(&mut entry.ctx, register, value))
            .await
            .map_err(|_| ModbusError::Timeout(timeout.as_millis() as u64))?;
        if result.is_err() {
            pool.remove(&key);
        }
        result
    }

    /// Per-device runtime state for the status operation.
    pub async fn runtime_snapshot(&self) -> HashMap<String, DeviceRuntime> {
        self.shared.engine.lock().await.runtime_snapshot()
    }

    /// Current pool occupancy, for the status operation.
    pub async fn pool_size(&self) -> usize {
        self.shared.pool.lock().await.len()
    }
}
