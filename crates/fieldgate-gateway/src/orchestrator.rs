//! Boot-time wiring and lifecycle.
//!
//! The orchestrator owns every process-lifetime component, hands
//! collaborators shared handles during wiring, starts the task inventory
//! in dependency order, listens for config-change events to drive live
//! reloads, and tears everything down cleanly on shutdown (streaming
//! stopped first, outstanding transmissions awaited up to two seconds).

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{reload, EnvFilter, Registry};

use fieldgate_cloud::{DriverWriter, HttpPublisher, MqttPublisher, WriteBridge};
use fieldgate_core::{
    CloudProtocol, DataQueue, ErrorMonitor, EventBus, GatewayEvent, MemoryPools, ServerConfig,
    SharedPools, StreamGate, DATA_QUEUE_CAPACITY, STREAM_QUEUE_CAPACITY,
};
use fieldgate_link::{
    CommandHandler, ConfigTransport, LinkMetrics, StatusSource, StreamWorker, TcpLink,
};
use fieldgate_modbus::{RtuDriver, RtuPortConfig, TcpDriver};
use fieldgate_net::{
    FailoverConfig, InterfaceKind, NetworkInterface, NetworkSupervisor, SharedInterface,
};
use fieldgate_storage::{ConfigStore, FallbackQueue};

use crate::memory_guard::MemoryGuard;

/// How long shutdown waits for in-flight link transmissions.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// Handle for live log-filter updates.
pub type LogReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Launch options from the CLI.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    pub data_dir: PathBuf,
    /// Listen address of the configuration link binding.
    pub link_addr: String,
    pub rtu_port1: String,
    pub rtu_port2: String,
}

/// Host network interface adapter.
///
/// The embedded targets manage their own PHYs; on a hosted gateway the
/// interfaces are assumed up when enabled in configuration. Wireless
/// signal strength is unavailable here, which the supervisor treats as
/// "signal acceptable".
struct HostInterface {
    kind: InterfaceKind,
    enabled: bool,
}

#[async_trait]
impl NetworkInterface for HostInterface {
    fn kind(&self) -> InterfaceKind {
        self.kind
    }
    async fn is_connected(&self) -> bool {
        self.enabled
    }
    async fn local_ip(&self) -> Option<Ipv4Addr> {
        None
    }
    async fn rssi(&self) -> Option<i16> {
        None
    }
    fn tear_down(&self) {}
}

/// Status document provider wired into the command handler.
struct GatewayStatus {
    started_at: chrono::DateTime<chrono::Utc>,
    rtu: Arc<RtuDriver>,
    tcp: Arc<TcpDriver>,
    supervisor: Arc<NetworkSupervisor>,
    mqtt: Arc<MqttPublisher>,
    monitor: ErrorMonitor,
    pools: SharedPools,
}

#[async_trait]
impl StatusSource for GatewayStatus {
    async fn snapshot(&self) -> serde_json::Value {
        let mut devices = self.rtu.runtime_snapshot().await;
        devices.extend(self.tcp.runtime_snapshot().await);

        let active_mode = self
            .supervisor
            .active_mode()
            .await
            .map(|m| m.as_str())
            .unwrap_or("UNKNOWN");

        serde_json::json!({
            "uptime_secs": (chrono::Utc::now() - self.started_at).num_seconds(),
            "active_network": active_mode,
            "mqtt_session": self.mqtt.session_state().await,
            "tcp_pool_size": self.tcp.pool_size().await,
            "free_small_pool": self.pools.free_small(),
            "free_large_pool": self.pools.free_large(),
            "devices": devices,
            "recent_errors": self.monitor.history().await,
        })
    }
}

/// The assembled gateway.
pub struct Orchestrator {
    events: EventBus,
    store: Arc<ConfigStore>,
    data_queue: Arc<DataQueue>,
    stream_gate: StreamGate,
    rtu: Arc<RtuDriver>,
    tcp: Arc<TcpDriver>,
    supervisor: Arc<NetworkSupervisor>,
    mqtt: Arc<MqttPublisher>,
    http: Arc<HttpPublisher>,
    transport: Arc<ConfigTransport>,
    handler: Arc<CommandHandler>,
    stream_worker: StreamWorker,
    metrics: Arc<LinkMetrics>,
    memory_guard: Arc<MemoryGuard>,
    protocol: CloudProtocol,
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
    reload_task: Option<tokio::task::JoinHandle<()>>,
    shutdown_rx: Option<mpsc::Receiver<String>>,
    shutdown_tx: mpsc::Sender<String>,
    log_handle: Option<LogReloadHandle>,
}

impl Orchestrator {
    /// Wire every component. Nothing is started yet.
    pub async fn build(
        options: GatewayOptions,
        log_handle: Option<LogReloadHandle>,
    ) -> Result<Self> {
        let pools: SharedPools = Arc::new(MemoryPools::new());
        let events = EventBus::new();
        let monitor = ErrorMonitor::new();
        let stream_gate = StreamGate::new();

        let data_queue = Arc::new(
            DataQueue::with_capacity(DATA_QUEUE_CAPACITY).with_pools(pools.clone()),
        );
        let stream_queue = Arc::new(
            DataQueue::with_capacity(STREAM_QUEUE_CAPACITY).with_pools(pools.clone()),
        );

        let store_path = options.data_dir.join("config.redb");
        let store = Arc::new(
            ConfigStore::open(&store_path)
                .with_context(|| format!("open config store at {}", store_path.display()))?,
        );
        let fallback = Arc::new(FallbackQueue::open(&store).context("open fallback queue")?);
        let server_config: ServerConfig = store.server_config().context("read server config")?;

        // Field drivers.
        let ports = RtuPortConfig {
            port1: options.rtu_port1.clone(),
            port2: options.rtu_port2.clone(),
        };
        let rtu = Arc::new(RtuDriver::new(
            ports,
            data_queue.clone(),
            stream_queue.clone(),
            stream_gate.clone(),
        ));
        let tcp = Arc::new(TcpDriver::new(
            data_queue.clone(),
            stream_queue.clone(),
            stream_gate.clone(),
        ));
        let devices = store.list_devices().context("list devices")?;
        rtu.reload(devices.clone()).await;
        tcp.reload(devices).await;

        // Network supervision.
        let ethernet = SharedInterface::new(Box::new(HostInterface {
            kind: InterfaceKind::Ethernet,
            enabled: server_config.communication.ethernet.enabled,
        }));
        let wireless = SharedInterface::new(Box::new(HostInterface {
            kind: InterfaceKind::Wireless,
            enabled: server_config.communication.wifi.enabled,
        }));
        let supervisor = Arc::new(NetworkSupervisor::new(
            FailoverConfig::default(),
            server_config.communication.primary_network_mode,
            ethernet,
            wireless,
            events.clone(),
        ));

        // Cloud egress.
        let writer = Arc::new(DriverWriter {
            rtu: rtu.clone(),
            tcp: tcp.clone(),
        });
        let bridge = Arc::new(WriteBridge::new(store.clone(), writer));
        let mqtt = Arc::new(MqttPublisher::new(
            server_config.mqtt_config.clone(),
            data_queue.clone(),
            fallback.clone(),
            Some(bridge),
        ));
        let http = Arc::new(HttpPublisher::new(
            server_config.http_config.clone(),
            data_queue.clone(),
        ));

        // Configuration link.
        let metrics = Arc::new(LinkMetrics::new());
        let link = TcpLink::bind(&options.link_addr)
            .await
            .map_err(|e| anyhow::anyhow!("bind configuration link: {}", e))?;
        let (transport, inbound) =
            ConfigTransport::new(link, stream_gate.clone(), metrics.clone());
        let handler = CommandHandler::new(
            store.clone(),
            events.clone(),
            transport.clone(),
            data_queue.clone(),
            stream_queue.clone(),
            stream_gate.clone(),
            metrics.clone(),
        );
        let stream_worker = StreamWorker::new(stream_queue.clone(), transport.clone());

        let memory_guard = Arc::new(MemoryGuard::new(
            pools.clone(),
            data_queue.clone(),
            fallback.clone(),
            metrics.clone(),
            events.clone(),
            monitor.clone(),
        ));

        handler
            .set_status_source(Arc::new(GatewayStatus {
                started_at: chrono::Utc::now(),
                rtu: rtu.clone(),
                tcp: tcp.clone(),
                supervisor: supervisor.clone(),
                mqtt: mqtt.clone(),
                monitor: monitor.clone(),
                pools: pools.clone(),
            }))
            .await;

        let (shutdown_tx, shutdown_rx) = mpsc::channel(4);

        Ok(Self {
            events,
            store,
            data_queue,
            stream_gate,
            rtu,
            tcp,
            supervisor,
            mqtt,
            http,
            transport,
            handler,
            stream_worker,
            metrics,
            memory_guard,
            protocol: server_config.protocol,
            inbound: Some(inbound),
            reload_task: None,
            shutdown_rx: Some(shutdown_rx),
            shutdown_tx,
            log_handle,
        })
    }

    /// Start the full task inventory.
    pub async fn start(&mut self) -> Result<()> {
        self.supervisor.start().await;
        self.rtu.start().await;
        self.tcp.start().await;

        match self.protocol {
            CloudProtocol::Mqtt => self.mqtt.start().await,
            CloudProtocol::Http => self.http.start().await,
        }

        self.transport.start().await;
        let inbound = self
            .inbound
            .take()
            .context("orchestrator started twice")?;
        self.handler.start(inbound).await;
        self.stream_worker.start().await;
        self.metrics.start_pruning().await;
        self.memory_guard.start().await;

        self.spawn_reload_listener();
        info!("gateway running");
        Ok(())
    }

    /// React to config-change and restart events.
    fn spawn_reload_listener(&mut self) {
        let mut rx = self.events.subscribe();
        let store = self.store.clone();
        let rtu = self.rtu.clone();
        let tcp = self.tcp.clone();
        let mqtt = self.mqtt.clone();
        let http = self.http.clone();
        let data_queue = self.data_queue.clone();
        let shutdown_tx = self.shutdown_tx.clone();
        let log_handle = self.log_handle.clone();

        self.reload_task = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    GatewayEvent::DeviceCreated { .. }
                    | GatewayEvent::DeviceUpdated { .. }
                    | GatewayEvent::DeviceDeleted { .. }
                    | GatewayEvent::ConfigRestored => {
                        match store.list_devices() {
                            Ok(devices) => {
                                rtu.reload(devices.clone()).await;
                                tcp.reload(devices).await;
                            }
                            Err(e) => warn!("device reload failed: {}", e),
                        }
                    }
                    GatewayEvent::ServerConfigUpdated => match store.server_config() {
                        Ok(config) => {
                            mqtt.reload(config.mqtt_config).await;
                            http.reload(config.http_config).await;
                            info!("publishers reloaded");
                        }
                        Err(e) => warn!("server config reload failed: {}", e),
                    },
                    GatewayEvent::LoggingConfigUpdated => {
                        if let Some(handle) = &log_handle {
                            match store.logging_config() {
                                Ok(config) => {
                                    let directives = config.to_filter_string();
                                    match EnvFilter::try_new(&directives) {
                                        Ok(filter) => {
                                            if handle.reload(filter).is_ok() {
                                                info!(filter = %directives, "log filter updated");
                                            }
                                        }
                                        Err(e) => {
                                            warn!("invalid logging configuration: {}", e)
                                        }
                                    }
                                }
                                Err(e) => warn!("logging config read failed: {}", e),
                            }
                        }
                    }
                    GatewayEvent::FactoryReset => {
                        match store.list_devices() {
                            Ok(devices) => {
                                rtu.reload(devices.clone()).await;
                                tcp.reload(devices).await;
                            }
                            Err(e) => warn!("post-reset reload failed: {}", e),
                        }
                        data_queue.clear().await.ok();
                    }
                    GatewayEvent::RestartRequested { reason } => {
                        warn!(reason = %reason, "restart requested");
                        shutdown_tx.send(reason).await.ok();
                    }
                    GatewayEvent::OtaConfigUpdated
                    | GatewayEvent::StreamStarted { .. }
                    | GatewayEvent::StreamStopped
                    | GatewayEvent::NetworkSwitched { .. } => {}
                }
            }
        }));
    }

    /// Run until Ctrl-C or a restart request, then shut down. Returns the
    /// restart reason if one was requested.
    pub async fn run(&mut self) -> Result<Option<String>> {
        let mut shutdown_rx = self
            .shutdown_rx
            .take()
            .context("orchestrator run twice")?;

        let reason = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received");
                None
            }
            reason = shutdown_rx.recv() => reason,
        };

        self.shutdown().await;
        Ok(reason)
    }

    /// Graceful teardown, reverse of start order.
    pub async fn shutdown(&mut self) {
        info!("shutting down");

        // No more stream notifications, then let the wire drain.
        self.stream_gate.stop();
        self.stream_worker.stop().await;
        self.handler.stop().await;
        if !self.transport.wait_idle(SHUTDOWN_DRAIN).await {
            warn!("transmissions still in flight after drain window");
        }
        self.transport.stop().await;

        self.mqtt.stop().await;
        self.http.stop().await;
        self.rtu.stop().await;
        self.tcp.stop().await;
        self.supervisor.stop().await;
        self.memory_guard.stop().await;
        self.metrics.stop_pruning().await;

        if let Some(task) = self.reload_task.take() {
            task.abort();
        }
        info!("shutdown complete");
    }
}
