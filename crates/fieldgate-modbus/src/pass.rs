//! The polling pass.
//!
//! One pass reads every register of one device in insertion order, decodes
//! and calibrates each value, and hands the resulting measurement points to
//! the data queue (and the stream queue while the device is being
//! streamed). Register timing is measured per read and reported back so the
//! driver can fold it into the device's health metrics.

use std::time::Duration;

use fieldgate_core::{DataQueue, DeviceConfig, MeasurementPoint, RegisterConfig, StreamGate};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{ModbusError, Result};
use crate::io::RegisterIo;

/// Timing of one successful register read.
#[derive(Debug, Clone)]
pub struct RegisterTiming {
    pub register_id: String,
    pub elapsed_ms: u64,
}

/// Result of one polling pass.
pub struct PassReport {
    /// Points enqueued before the pass ended.
    pub points: usize,
    /// Per-register timings for the successful reads.
    pub timings: Vec<RegisterTiming>,
    /// `Err` when the pass was aborted by a register failure.
    pub outcome: Result<()>,
}

/// Destination queues for measurement points.
pub struct PassSinks<'a> {
    pub data_queue: &'a DataQueue,
    pub stream_queue: &'a DataQueue,
    pub stream_gate: &'a StreamGate,
}

/// Read one register and decode it to a calibrated value.
async fn read_register(
    io: &mut dyn RegisterIo,
    register: &RegisterConfig,
    read_timeout: Duration,
) -> Result<f64> {
    let span = register.data_type.span();
    let raw = if register.function_code.is_bit_function() {
        let bits = timeout(
            read_timeout,
            io.read_bits(register.function_code, register.address, 1),
        )
        .await
        .map_err(|_| ModbusError::Timeout(read_timeout.as_millis() as u64))??;
        let bit = bits
            .first()
            .copied()
            .ok_or_else(|| ModbusError::Read("empty bit response".to_string()))?;
        codec::decode_bit(register.data_type, bit)
    } else {
        let words = timeout(
            read_timeout,
            io.read_words(register.function_code, register.address, span),
        )
        .await
        .map_err(|_| ModbusError::Timeout(read_timeout.as_millis() as u64))??;
        codec::decode(register.data_type, &words)?
    };
    Ok(register.calibrate(raw))
}

/// Run a full polling pass over one device.
///
/// Registers are read in insertion order. The pass stops at the first
/// failed register; points produced before the failure stay enqueued.
pub async fn polling_pass(
    io: &mut dyn RegisterIo,
    device: &DeviceConfig,
    sinks: &PassSinks<'_>,
) -> PassReport {
    let read_timeout = Duration::from_millis(device.timeout_ms.max(1));
    let mut report = PassReport {
        points: 0,
        timings: Vec::with_capacity(device.registers.len()),
        outcome: Ok(()),
    };

    for register in &device.registers {
        let started = tokio::time::Instant::now();
        match read_register(io, register, read_timeout).await {
            Ok(value) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                report.timings.push(RegisterTiming {
                    register_id: register.register_id.clone(),
                    elapsed_ms,
                });

                let point = MeasurementPoint {
                    timestamp: chrono::Utc::now().timestamp(),
                    device_id: device.device_id.clone(),
                    device_name: device.name.clone(),
                    register_id: register.register_id.clone(),
                    register_name: register.name.clone(),
                    value,
                    unit: register.unit.clone(),
                    description: register.description.clone(),
                };

                if sinks.stream_gate.is_streaming(&device.device_id) {
                    if let Err(e) = sinks.stream_queue.enqueue(point.clone()).await {
                        debug!(device_id = %device.device_id, "stream enqueue failed: {}", e);
                    }
                }
                match sinks.data_queue.enqueue(point).await {
                    Ok(()) => report.points += 1,
                    Err(e) => {
                        warn!(device_id = %device.device_id, "data enqueue failed: {}", e)
                    }
                }
            }
            Err(e) => {
                warn!(
                    device_id = %device.device_id,
                    register_id = %register.register_id,
                    address = register.address,
                    "register read failed: {}",
                    e
                );
                report.outcome = Err(e);
                break;
            }
        }
    }
    report
}
