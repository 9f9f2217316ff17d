//! Modbus RTU driver.
//!
//! Drives two RS-485 buses. Each bus keeps one serial context alive and
//! reprograms the UART only when the pending device's baud rate differs
//! from the current setting; switching slaves on the same bus is free.
//!
//! A single scheduler task owns the poll loop: it pops due devices from the
//! poll engine, runs a polling pass per device, folds the outcome back into
//! the failure ladder, and sweeps for auto-recovery once a minute.

use std::sync::Arc;
use std::time::Duration;

use fieldgate_core::{DataQueue, DeviceConfig, DeviceRuntime, Protocol, RegisterConfig, StreamGate};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_modbus::client;
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;
use tracing::{debug, info, warn};

use crate::engine::{PollEngine, AUTO_RECOVERY_SWEEP_MS, RTU_POLICY};
use crate::error::{ModbusError, Result};
use crate::pass::{polling_pass, PassReport, PassSinks};
use crate::write;

/// Poll loop tick.
const POLL_TICK_MS: u64 = 50;

/// Serial device paths for the two buses.
#[derive(Debug, Clone)]
pub struct RtuPortConfig {
    pub port1: String,
    pub port2: String,
}

impl Default for RtuPortConfig {
    fn default() -> Self {
        Self {
            port1: "/dev/ttyS1".to_string(),
            port2: "/dev/ttyS2".to_string(),
        }
    }
}

struct BusState {
    path: String,
    current_baud: Option<u32>,
    ctx: Option<client::Context>,
}

impl BusState {
    fn new(path: String) -> Self {
        Self {
            path,
            current_baud: None,
            ctx: None,
        }
    }

    /// Context for a device, reopening the port only on a baud change.
    fn context_for(&mut self, device: &DeviceConfig) -> Result<&mut client::Context> {
        let baud = device
            .baud_rate
            .ok_or_else(|| ModbusError::Config("RTU device missing baud_rate".to_string()))?;
        if self.ctx.is_none() || self.current_baud != Some(baud) {
            let builder = tokio_serial::new(&self.path, baud);
            let stream = SerialStream::open(&builder)
                .map_err(|e| ModbusError::Connection(format!("{}: {}", self.path, e)))?;
            self.ctx = Some(rtu::attach_slave(stream, Slave(device.unit_id())));
            self.current_baud = Some(baud);
            debug!(path = %self.path, baud, "bus reconfigured");
        } else if let Some(ctx) = self.ctx.as_mut() {
            ctx.set_slave(Slave(device.unit_id()));
        }
        Ok(self.ctx.as_mut().expect("context ensured above"))
    }

    fn invalidate(&mut self) {
        self.ctx = None;
        self.current_baud = None;
    }
}

struct RtuShared {
    engine: Mutex<PollEngine>,
    buses: Mutex<[BusState; 2]>,
    data_queue: Arc<DataQueue>,
    stream_queue: Arc<DataQueue>,
    stream_gate: StreamGate,
    epoch: Instant,
}

impl RtuShared {
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
}

/// Two-bus RTU polling driver.
pub struct RtuDriver {
    shared: Arc<RtuShared>,
    running: Arc<RwLock<bool>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl RtuDriver {
    pub fn new(
        ports: RtuPortConfig,
        data_queue: Arc<DataQueue>,
        stream_queue: Arc<DataQueue>,
        stream_gate: StreamGate,
    ) -> Self {
        Self {
            shared: Arc::new(RtuShared {
                engine: Mutex::new(PollEngine::new(RTU_POLICY)),
                buses: Mutex::new([BusState::new(ports.port1), BusState::new(ports.port2)]),
                data_queue,
                stream_queue,
                stream_gate,
                epoch: Instant::now(),
            }),
            running: Arc::new(RwLock::new(false)),
            task: RwLock::new(None),
        }
    }

    /// Refresh the cached device table from a store snapshot. Measurements
    /// of removed devices are flushed from the data queue.
    pub async fn reload(&self, devices: Vec<DeviceConfig>) {
        let rtu_devices: Vec<DeviceConfig> = devices
            .into_iter()
            .filter(|d| d.protocol == Protocol::Rtu)
            .collect();
        let now = self.shared.now_ms();
        let delta = self.shared.engine.lock().await.reload(rtu_devices, now);
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
            "RTU device table reloaded"
        );
    }

    /// Start the scheduler task.
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
                        info!(count = recovered.len(), "RTU devices auto-recovered");
                    }
                    last_recovery_ms = now;
                }

                let due = shared.engine.lock().await.due_devices(now);
                for device in due {
                    Self::poll_device(&shared, &device).await;
                }
            }
            debug!("RTU scheduler task exited");
        });

        let mut task = self.task.write().await;
        *task = Some(handle);
        info!("RTU driver started");
    }

    /// Stop the scheduler task and wait for it to exit.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);

        let handle = self.task.write().await.take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
        info!("RTU driver stopped");
    }

    async fn poll_device(shared: &RtuShared, device: &DeviceConfig) {
        let report = {
            let mut buses = shared.buses.lock().await;
            let bus = match device.serial_port {
                Some(1) => &mut buses[0],
                Some(2) => &mut buses[1],
                other => {
                    warn!(device_id = %device.device_id, ?other, "invalid serial port");
                    return;
                }
            };
            let report = match bus.context_for(device) {
                Ok(ctx) => polling_pass(ctx, device, &shared.sinks()).await,
                Err(e) => PassReport {
                    points: 0,
                    timings: Vec::new(),
                    outcome: Err(e),
                },
            };
            // A failed pass leaves the serial context in an unknown state.
            if report.outcome.is_err() {
                bus.invalidate();
            }
            report
        };
        Self::apply_report(shared, &device.device_id, report).await;
    }

    async fn apply_report(shared: &RtuShared, device_id: &str, report: PassReport) {
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

    /// Write a calibrated value to one register of an RTU device.
    pub async fn write_value(
        &self,
        device: &DeviceConfig,
        register: &RegisterConfig,
        value: f64,
    ) -> Result<Vec<u16>> {
        let timeout = Duration::from_millis(device.timeout_ms.max(1));
        let mut buses = self.shared.buses.lock().await;
        let bus = match device.serial_port {
            Some(1) => &mut buses[0],
            Some(2) => &mut buses[1],
            _ => return Err(ModbusError::Config("invalid serial port".to_string())),
        };
        let ctx = bus.context_for(device)?;
        let result = tokio::time::timeout(timeout, write::write_value(ctx, register, value))
            .await
            .map_err(|_| ModbusError::Timeout(timeout.as_millis() as u64))?;
        if result.is_err() {
            bus.invalidate();
        }
        result
    }

    /// Per-device runtime state for the status operation.
    pub async fn runtime_snapshot(&self) -> std::collections::HashMap<String, DeviceRuntime> {
        self.shared.engine.lock().await.runtime_snapshot()
    }
}
