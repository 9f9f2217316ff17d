//! Ethernet-primary / wireless-secondary failover.
//!
//! A monitor task samples both interfaces every check interval and applies
//! the failover rules: fall back to the secondary when the active interface
//! goes unhealthy, return to the primary once it is healthy again and the
//! gateway has sat on the current interface long enough. Every successful
//! switch opens a hysteresis window during which further switches are
//! blocked, so a flapping link cannot bounce the gateway between
//! interfaces.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use fieldgate_core::{EventBus, GatewayEvent, NetworkMode};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::iface::{InterfaceKind, NetClient, SharedInterface, SignalQuality};

/// Active-mode lock acquisition window.
const MODE_LOCK_TIMEOUT_MS: u64 = 100;

/// Failover tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    pub check_interval_ms: u64,
    /// Minimum gap between successful switches.
    pub hysteresis_ms: u64,
    /// Minimum dwell time on the current interface before returning to the
    /// primary.
    pub min_connection_time_ms: u64,
    /// Wireless is considered unhealthy below this RSSI.
    pub rssi_drop_threshold: i16,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 5_000,
            hysteresis_ms: 10_000,
            min_connection_time_ms: 10_000,
            rssi_drop_threshold: -85,
        }
    }
}

/// Sampled status of one interface.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct InterfaceStatus {
    pub is_active: bool,
    pub healthy: bool,
    pub rssi: Option<i16>,
    pub quality: Option<SignalQuality>,
    pub consecutive_failures: u32,
    pub state_change_ms: u64,
}

#[derive(Debug)]
struct ActiveState {
    active: InterfaceKind,
    last_switch_ms: u64,
    active_since_ms: u64,
    ethernet: InterfaceStatus,
    wireless: InterfaceStatus,
}

/// Failover decision, separated from the sampling so the rules are testable
/// without interfaces or a clock.
fn decide(
    active: InterfaceKind,
    primary: InterfaceKind,
    primary_healthy: bool,
    secondary_healthy: bool,
    active_healthy: bool,
    last_switch_ms: u64,
    active_since_ms: u64,
    now_ms: u64,
    config: &FailoverConfig,
) -> Option<InterfaceKind> {
    // Hysteresis window blocks everything.
    if now_ms.saturating_sub(last_switch_ms) < config.hysteresis_ms {
        return None;
    }
    let secondary = match primary {
        InterfaceKind::Ethernet => InterfaceKind::Wireless,
        InterfaceKind::Wireless => InterfaceKind::Ethernet,
    };
    if active != primary
        && primary_healthy
        && now_ms.saturating_sub(active_since_ms) >= config.min_connection_time_ms
    {
        return Some(primary);
    }
    if !active_healthy {
        if active == primary && secondary_healthy {
            return Some(secondary);
        }
        if active == secondary && primary_healthy {
            return Some(primary);
        }
    }
    None
}

/// Primary/secondary interface controller.
pub struct NetworkSupervisor {
    config: FailoverConfig,
    primary: InterfaceKind,
    ethernet: SharedInterface,
    wireless: SharedInterface,
    state: Arc<Mutex<ActiveState>>,
    events: EventBus,
    epoch: Instant,
    running: Arc<RwLock<bool>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl NetworkSupervisor {
    pub fn new(
        config: FailoverConfig,
        primary_mode: NetworkMode,
        ethernet: SharedInterface,
        wireless: SharedInterface,
        events: EventBus,
    ) -> Self {
        let primary = match primary_mode {
            NetworkMode::Eth => InterfaceKind::Ethernet,
            NetworkMode::Wifi => InterfaceKind::Wireless,
        };
        Self {
            config,
            primary,
            ethernet,
            wireless,
            state: Arc::new(Mutex::new(ActiveState {
                active: primary,
                last_switch_ms: 0,
                active_since_ms: 0,
                ethernet: InterfaceStatus::default(),
                wireless: InterfaceStatus::default(),
            })),
            events,
            epoch: Instant::now(),
            running: Arc::new(RwLock::new(false)),
            task: RwLock::new(None),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    async fn lock_state(&self) -> Result<tokio::sync::MutexGuard<'_, ActiveState>> {
        tokio::time::timeout(Duration::from_millis(MODE_LOCK_TIMEOUT_MS), self.state.lock())
            .await
            .map_err(|_| NetError::LockTimeout(MODE_LOCK_TIMEOUT_MS))
    }

    /// Whether the active interface currently carries traffic.
    pub async fn is_available(&self) -> bool {
        let active = match self.lock_state().await {
            Ok(state) => state.active,
            Err(_) => return false,
        };
        self.interface(active).is_connected().await
    }

    /// Local address of the active interface.
    pub async fn local_ip(&self) -> Result<Option<Ipv4Addr>> {
        let active = self.lock_state().await?.active;
        Ok(self.interface(active).local_ip().await)
    }

    /// Currently active mode.
    pub async fn active_mode(&self) -> Result<InterfaceKind> {
        Ok(self.lock_state().await?.active)
    }

    /// A raw TCP capability bound to the active interface.
    pub async fn get_active_client(&self) -> Result<NetClient> {
        let active = self.lock_state().await?.active;
        Ok(NetClient::new(active))
    }

    /// Status snapshot for the status operation.
    pub async fn status(&self) -> Result<(InterfaceStatus, InterfaceStatus)> {
        let state = self.lock_state().await?;
        Ok((state.ethernet, state.wireless))
    }

    /// Force a switch, bypassing health checks but honoring the lock.
    pub async fn switch_mode(&self, target: InterfaceKind) -> Result<()> {
        let now = self.now_ms();
        let mut state = self.lock_state().await?;
        if state.active == target {
            return Ok(());
        }
        Self::apply_switch(&mut state, target, now, &self.events);
        Ok(())
    }

    fn interface(&self, kind: InterfaceKind) -> &SharedInterface {
        match kind {
            InterfaceKind::Ethernet => &self.ethernet,
            InterfaceKind::Wireless => &self.wireless,
        }
    }

    fn apply_switch(
        state: &mut ActiveState,
        target: InterfaceKind,
        now_ms: u64,
        events: &EventBus,
    ) {
        info!(from = state.active.as_str(), to = target.as_str(), "switching active interface");
        state.active = target;
        state.last_switch_ms = now_ms;
        state.active_since_ms = now_ms;
        state.ethernet.is_active = target == InterfaceKind::Ethernet;
        state.wireless.is_active = target == InterfaceKind::Wireless;
        events.publish(GatewayEvent::NetworkSwitched {
            mode: target.as_str(),
        });
    }

    /// One monitor pass: sample both interfaces, update status, and apply
    /// the failover rules. Called by the monitor task; public so tests can
    /// drive it with explicit ticks.
    pub async fn tick(&self, now_ms: u64) {
        monitor_pass(
            &self.config,
            self.primary,
            &self.ethernet,
            &self.wireless,
            &self.state,
            &self.events,
            now_ms,
        )
        .await;
    }

    /// Start the periodic monitor task.
    pub async fn start(&self) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let running_flag = self.running.clone();
        let interval = Duration::from_millis(self.config.check_interval_ms);
        let config = self.config.clone();
        let primary = self.primary;
        let ethernet = self.ethernet.clone();
        let wireless = self.wireless.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let epoch = self.epoch;

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                if !*running_flag.read().await {
                    break;
                }
                tick.tick().await;
                let now_ms = epoch.elapsed().as_millis() as u64;
                monitor_pass(&config, primary, &ethernet, &wireless, &state, &events, now_ms)
                    .await;
            }
            debug!("failover monitor exited");
        });

        let mut task = self.task.write().await;
        *task = Some(handle);
        info!(primary = self.primary.as_str(), "network supervisor started");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);
        let handle = self.task.write().await.take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
        info!("network supervisor stopped");
    }
}

fn update_status(status: &mut InterfaceStatus, healthy: bool, rssi: Option<i16>, now_ms: u64) {
    if status.healthy != healthy {
        status.state_change_ms = now_ms;
    }
    if healthy {
        status.consecutive_failures = 0;
    } else {
        status.consecutive_failures += 1;
    }
    status.healthy = healthy;
    status.rssi = rssi;
    status.quality = rssi.map(SignalQuality::from_rssi);
}

#[allow(clippy::too_many_arguments)]
async fn monitor_pass(
    config: &FailoverConfig,
    primary: InterfaceKind,
    ethernet: &SharedInterface,
    wireless: &SharedInterface,
    state: &Mutex<ActiveState>,
    events: &EventBus,
    now_ms: u64,
) {
    let eth_healthy = ethernet.is_connected().await;
    let wifi_connected = wireless.is_connected().await;
    let wifi_rssi = wireless.rssi().await;
    let wifi_signal_ok = wifi_rssi
        .map(|r| r > config.rssi_drop_threshold)
        .unwrap_or(true);
    let wifi_healthy = wifi_connected && wifi_signal_ok;

    let mut state = match tokio::time::timeout(
        Duration::from_millis(MODE_LOCK_TIMEOUT_MS),
        state.lock(),
    )
    .await
    {
        Ok(state) => state,
        Err(_) => {
            warn!("monitor pass skipped: active-mode lock busy");
            return;
        }
    };

    update_status(&mut state.ethernet, eth_healthy, None, now_ms);
    update_status(&mut state.wireless, wifi_healthy, wifi_rssi, now_ms);

    let (primary_healthy, secondary_healthy) = match primary {
        InterfaceKind::Ethernet => (eth_healthy, wifi_healthy),
        InterfaceKind::Wireless => (wifi_healthy, eth_healthy),
    };
    let active_healthy = match state.active {
        InterfaceKind::Ethernet => eth_healthy,
        InterfaceKind::Wireless => wifi_healthy,
    };

    if let Some(target) = decide(
        state.active,
        primary,
        primary_healthy,
        secondary_healthy,
        active_healthy,
        state.last_switch_ms,
        state.active_since_ms,
        now_ms,
        config,
    ) {
        NetworkSupervisor::apply_switch(&mut state, target, now_ms, events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iface::NetworkInterface;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicI16, Ordering};

    struct FakeIface {
        kind: InterfaceKind,
        up: Arc<AtomicBool>,
        rssi: Option<Arc<AtomicI16>>,
    }

    #[async_trait]
    impl NetworkInterface for FakeIface {
        fn kind(&self) -> InterfaceKind {
            self.kind
        }
        async fn is_connected(&self) -> bool {
            self.up.load(Ordering::SeqCst)
        }
        async fn local_ip(&self) -> Option<Ipv4Addr> {
            Some(Ipv4Addr::new(192, 168, 1, 10))
        }
        async fn rssi(&self) -> Option<i16> {
            self.rssi.as_ref().map(|r| r.load(Ordering::SeqCst))
        }
        fn tear_down(&self) {}
    }

    struct Fixture {
        supervisor: NetworkSupervisor,
        eth_up: Arc<AtomicBool>,
        wifi_up: Arc<AtomicBool>,
        wifi_rssi: Arc<AtomicI16>,
    }

    fn fixture() -> Fixture {
        let eth_up = Arc::new(AtomicBool::new(true));
        let wifi_up = Arc::new(AtomicBool::new(true));
        let wifi_rssi = Arc::new(AtomicI16::new(-60));

        let ethernet = SharedInterface::new(Box::new(FakeIface {
            kind: InterfaceKind::Ethernet,
            up: eth_up.clone(),
            rssi: None,
        }));
        let wireless = SharedInterface::new(Box::new(FakeIface {
            kind: InterfaceKind::Wireless,
            up: wifi_up.clone(),
            rssi: Some(wifi_rssi.clone()),
        }));

        let supervisor = NetworkSupervisor::new(
            FailoverConfig::default(),
            NetworkMode::Eth,
            ethernet,
            wireless,
            EventBus::new(),
        );
        Fixture {
            supervisor,
            eth_up,
            wifi_up,
            wifi_rssi,
        }
    }

    #[tokio::test]
    async fn test_failover_to_secondary_on_primary_loss() {
        let f = fixture();
        // Past the initial hysteresis window.
        f.supervisor.tick(20_000).await;
        assert_eq!(
            f.supervisor.active_mode().await.unwrap(),
            InterfaceKind::Ethernet
        );

        f.eth_up.store(false, Ordering::SeqCst);
        f.supervisor.tick(25_000).await;
        assert_eq!(
            f.supervisor.active_mode().await.unwrap(),
            InterfaceKind::Wireless
        );
    }

    #[tokio::test]
    async fn test_hysteresis_blocks_rapid_switch_back() {
        let f = fixture();
        f.eth_up.store(false, Ordering::SeqCst);
        f.supervisor.tick(20_000).await;
        assert_eq!(
            f.supervisor.active_mode().await.unwrap(),
            InterfaceKind::Wireless
        );

        // Primary returns immediately, but the window (10 s) is open.
        f.eth_up.store(true, Ordering::SeqCst);
        f.supervisor.tick(24_000).await;
        assert_eq!(
            f.supervisor.active_mode().await.unwrap(),
            InterfaceKind::Wireless
        );

        // After the window and the dwell time, the primary wins back.
        f.supervisor.tick(31_000).await;
        assert_eq!(
            f.supervisor.active_mode().await.unwrap(),
            InterfaceKind::Ethernet
        );
    }

    #[tokio::test]
    async fn test_no_two_switches_within_window() {
        let f = fixture();
        f.eth_up.store(false, Ordering::SeqCst);
        f.supervisor.tick(20_000).await;

        // Secondary dies right after the switch; primary still down.
        f.wifi_up.store(false, Ordering::SeqCst);
        f.eth_up.store(true, Ordering::SeqCst);
        f.supervisor.tick(22_000).await;
        // Window open: still on wireless even though it is dead.
        assert_eq!(
            f.supervisor.active_mode().await.unwrap(),
            InterfaceKind::Wireless
        );

        f.supervisor.tick(30_100).await;
        assert_eq!(
            f.supervisor.active_mode().await.unwrap(),
            InterfaceKind::Ethernet
        );
    }

    #[tokio::test]
    async fn test_weak_wireless_counts_as_unhealthy() {
        let f = fixture();
        f.eth_up.store(false, Ordering::SeqCst);
        f.supervisor.tick(20_000).await;
        assert_eq!(
            f.supervisor.active_mode().await.unwrap(),
            InterfaceKind::Wireless
        );

        // Signal collapses below the drop threshold; primary recovers.
        f.wifi_rssi.store(-90, Ordering::SeqCst);
        f.eth_up.store(true, Ordering::SeqCst);
        f.supervisor.tick(40_000).await;
        assert_eq!(
            f.supervisor.active_mode().await.unwrap(),
            InterfaceKind::Ethernet
        );
    }

    #[tokio::test]
    async fn test_status_tracks_quality() {
        let f = fixture();
        f.supervisor.tick(20_000).await;
        let (_, wifi) = f.supervisor.status().await.unwrap();
        assert_eq!(wifi.quality, Some(SignalQuality::Good));
        assert!(wifi.healthy);
    }

    #[tokio::test]
    async fn test_manual_switch() {
        let f = fixture();
        f.supervisor.switch_mode(InterfaceKind::Wireless).await.unwrap();
        assert_eq!(
            f.supervisor.active_mode().await.unwrap(),
            InterfaceKind::Wireless
        );
    }
}
