//! Polling engine state.
//!
//! Shared by the RTU and TCP drivers: the cached device table, per-device
//! runtime state, the poll scheduler, and the failure ladder (exponential
//! backoff, auto-disable on exhausted retries or consecutive timeouts, and
//! the periodic auto-recovery sweep). Everything here is synchronous state
//! driven by millisecond ticks, so the ladder is testable without a clock.

use std::collections::HashMap;

use fieldgate_core::{DeviceConfig, DeviceRuntime, DisableReason};
use tracing::{info, warn};

use crate::scheduler::PollScheduler;

/// Backoff exponent cap: delays stop growing at 32× base.
pub const BACKOFF_EXPONENT_CAP: u32 = 5;

/// How long an auto-disabled device stays out before recovery, in ms.
pub const AUTO_RECOVERY_AGE_MS: u64 = 5 * 60 * 1000;

/// Cadence of the auto-recovery sweep, in ms.
pub const AUTO_RECOVERY_SWEEP_MS: u64 = 60 * 1000;

/// Failure-handling knobs that differ between transports.
#[derive(Debug, Clone, Copy)]
pub struct FailurePolicy {
    pub base_backoff_ms: u64,
    pub max_consecutive_timeouts: u32,
}

/// RTU reacts quickly; the bus answers in milliseconds.
pub const RTU_POLICY: FailurePolicy = FailurePolicy {
    base_backoff_ms: 100,
    max_consecutive_timeouts: 3,
};

/// TCP backs off slower; connection setup is expensive.
pub const TCP_POLICY: FailurePolicy = FailurePolicy {
    base_backoff_ms: 2000,
    max_consecutive_timeouts: 3,
};

/// Outcome of recording a pass failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Device rescheduled at its backoff deadline.
    Backoff { next_retry_ms: u64 },
    /// Device auto-disabled and unscheduled.
    Disabled(DisableReason),
}

/// Changes produced by a configuration reload.
#[derive(Debug, Default)]
pub struct ReloadDelta {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub updated: Vec<String>,
}

/// Device table, runtime state and schedule for one driver.
pub struct PollEngine {
    devices: HashMap<String, DeviceConfig>,
    runtime: HashMap<String, DeviceRuntime>,
    scheduler: PollScheduler,
    policy: FailurePolicy,
}

impl PollEngine {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            devices: HashMap::new(),
            runtime: HashMap::new(),
            scheduler: PollScheduler::new(),
            policy,
        }
    }

    /// Replace the device table with a fresh snapshot.
    ///
    /// New devices get default runtime state and an immediate schedule slot;
    /// removed devices drop out of the schedule (the caller flushes their
    /// queued measurements); modified devices keep their health metrics.
    pub fn reload(&mut self, snapshot: Vec<DeviceConfig>, now_ms: u64) -> ReloadDelta {
        let mut delta = ReloadDelta::default();
        let mut incoming: HashMap<String, DeviceConfig> = snapshot
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect();

        let known: Vec<String> = self.devices.keys().cloned().collect();
        for device_id in known {
            if !incoming.contains_key(&device_id) {
                self.devices.remove(&device_id);
                self.runtime.remove(&device_id);
                self.scheduler.remove(&device_id);
                delta.removed.push(device_id);
            }
        }

        for (device_id, config) in incoming.drain() {
            let is_new = !self.devices.contains_key(&device_id);
            let enabled = config.enabled;
            self.devices.insert(device_id.clone(), config);
            let runtime = self.runtime.entry(device_id.clone()).or_default();

            if enabled {
                if runtime.disable_reason == DisableReason::Manual {
                    runtime.disable_reason = DisableReason::None;
                    runtime.disable_detail.clear();
                    runtime.clear_failures();
                }
                if !runtime.is_disabled() && !self.scheduler.contains(&device_id) {
                    self.scheduler.schedule(&device_id, now_ms);
                }
            } else {
                if runtime.disable_reason == DisableReason::None {
                    runtime.disable_reason = DisableReason::Manual;
                    runtime.disable_detail = "disabled in configuration".to_string();
                    runtime.disabled_at = now_ms;
                }
                self.scheduler.remove(&device_id);
            }

            if is_new {
                delta.added.push(device_id);
            } else {
                delta.updated.push(device_id);
            }
        }
        delta
    }

    /// Devices whose poll deadline has arrived and that are actually
    /// pollable. Devices still in backoff are pushed back to their retry
    /// deadline instead of being returned.
    pub fn due_devices(&mut self, now_ms: u64) -> Vec<DeviceConfig> {
        let mut ready = Vec::new();
        for device_id in self.scheduler.pop_due(now_ms) {
            let Some(config) = self.devices.get(&device_id) else {
                continue;
            };
            let runtime = self.runtime.entry(device_id.clone()).or_default();
            if !config.enabled || runtime.is_disabled() {
                continue;
            }
            if runtime.next_retry_time > now_ms {
                self.scheduler.schedule(&device_id, runtime.next_retry_time);
                continue;
            }
            ready.push(config.clone());
        }
        ready
    }

    /// Record a completed polling pass and schedule the next one.
    pub fn complete_pass(&mut self, device_id: &str, now_ms: u64) {
        let Some(config) = self.devices.get(device_id) else {
            return;
        };
        let refresh = config.refresh_rate_ms;
        if let Some(runtime) = self.runtime.get_mut(device_id) {
            runtime.last_poll_time = now_ms;
            if !runtime.is_disabled() {
                self.scheduler.schedule(device_id, now_ms + refresh);
            }
        }
    }

    /// Record one successful register read.
    pub fn record_read_success(&mut self, device_id: &str, now_ms: u64, elapsed_ms: u64) {
        if let Some(runtime) = self.runtime.get_mut(device_id) {
            runtime.health.record_success(elapsed_ms);
            runtime.last_successful_read = now_ms;
            runtime.clear_failures();
            runtime.next_retry_time = 0;
        }
    }

    /// Record a failed pass (protocol error). Walks the retry ladder:
    /// the delay doubles per retry up to 32× base, and once the retry
    /// budget is spent the device is auto-disabled.
    pub fn record_failure(&mut self, device_id: &str, now_ms: u64) -> FailureOutcome {
        let max_retries = self
            .devices
            .get(device_id)
            .map(|d| d.max_retries)
            .unwrap_or(0);
        let base = self.policy.base_backoff_ms;
        let Some(runtime) = self.runtime.get_mut(device_id) else {
            return FailureOutcome::Disabled(DisableReason::AutoRetry);
        };

        runtime.health.record_failure();
        runtime.consecutive_failures += 1;

        if runtime.retry_count >= max_retries {
            runtime.disable_reason = DisableReason::AutoRetry;
            runtime.disable_detail = format!("retry budget of {} exhausted", max_retries);
            runtime.disabled_at = now_ms;
            self.scheduler.remove(device_id);
            warn!(device_id, max_retries, "device auto-disabled after exhausted retries");
            return FailureOutcome::Disabled(DisableReason::AutoRetry);
        }

        let exponent = runtime.retry_count.min(BACKOFF_EXPONENT_CAP);
        let delay = base * (1u64 << exponent);
        runtime.retry_count += 1;
        runtime.next_retry_time = now_ms + delay;
        self.scheduler.schedule(device_id, runtime.next_retry_time);
        FailureOutcome::Backoff {
            next_retry_ms: runtime.next_retry_time,
        }
    }

    /// Record a timed-out pass. Counts toward the consecutive-timeout
    /// ladder and otherwise follows the same backoff as a failure.
    pub fn record_timeout(&mut self, device_id: &str, now_ms: u64) -> FailureOutcome {
        let threshold = self.policy.max_consecutive_timeouts;
        {
            let Some(runtime) = self.runtime.get_mut(device_id) else {
                return FailureOutcome::Disabled(DisableReason::AutoTimeout);
            };
            runtime.consecutive_timeouts += 1;
            if runtime.consecutive_timeouts >= threshold {
                runtime.health.record_failure();
                runtime.disable_reason = DisableReason::AutoTimeout;
                runtime.disable_detail =
                    format!("{} consecutive timeouts", runtime.consecutive_timeouts);
                runtime.disabled_at = now_ms;
                self.scheduler.remove(device_id);
                warn!(device_id, threshold, "device auto-disabled after consecutive timeouts");
                return FailureOutcome::Disabled(DisableReason::AutoTimeout);
            }
        }
        self.record_failure(device_id, now_ms)
    }

    /// Re-enable auto-disabled devices whose quarantine has aged out.
    /// Returns the ids brought back.
    pub fn auto_recover(&mut self, now_ms: u64) -> Vec<String> {
        let mut recovered = Vec::new();
        for (device_id, runtime) in self.runtime.iter_mut() {
            if runtime.disable_reason.is_auto()
                && now_ms.saturating_sub(runtime.disabled_at) >= AUTO_RECOVERY_AGE_MS
            {
                runtime.disable_reason = DisableReason::None;
                runtime.disable_detail.clear();
                runtime.clear_failures();
                runtime.next_retry_time = 0;
                recovered.push(device_id.clone());
            }
        }
        for device_id in &recovered {
            if self.devices.get(device_id).map(|d| d.enabled).unwrap_or(false) {
                self.scheduler.schedule(device_id, now_ms);
                info!(device_id, "device auto-recovered");
            }
        }
        recovered
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.get(device_id)
    }

    pub fn runtime(&self, device_id: &str) -> Option<&DeviceRuntime> {
        self.runtime.get(device_id)
    }

    /// Runtime snapshot for the status operation.
    pub fn runtime_snapshot(&self) -> HashMap<String, DeviceRuntime> {
        self.runtime.clone()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Earliest pending deadline, for idle sleeping.
    pub fn next_deadline(&self) -> Option<u64> {
        self.scheduler.next_deadline()
    }
}
