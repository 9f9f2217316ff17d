//! MQTT publisher.
//!
//! One broker session with a four-state lifecycle (OFF, CONNECTING, OK,
//! ERR) and bounded reconnect backoff. Two publish modes:
//!
//! - *default*: one topic, one cadence; each cycle drains the data queue
//!   (up to a cap), deduplicates by register id and publishes one batch.
//! - *customize*: several topics, each with its own register selection and
//!   cadence, fed from a cumulative last-value map.
//!
//! Failed publishes are appended to the persistent fallback queue, which is
//! drained ahead of normal traffic once the session is healthy again.
//! Custom topics with registers also accept inbound write messages, routed
//! through the subscribe-to-write bridge.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fieldgate_core::{DataQueue, MqttSettings, PublishMode};
use fieldgate_storage::{FallbackEntry, FallbackQueue};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cycle::{
    batch_payload, compute_buffer_size, dedup_into, drain, select_registers, CadenceGate,
    MQTT_CYCLE_CAP,
};
use crate::error::{CloudError, Result};
use crate::write_bridge::WriteBridge;

/// Publisher task tick.
const PUBLISH_TICK_MS: u64 = 100;

/// Reconnect backoff window.
const RECONNECT_MIN_MS: u64 = 1_000;
const RECONNECT_MAX_MS: u64 = 30_000;

/// Broker session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Off,
    Connecting,
    Ok,
    Err,
}

fn qos_from(level: u8) -> QoS {
    match level {
        2 => QoS::ExactlyOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::AtMostOnce,
    }
}

/// MQTT egress publisher.
pub struct MqttPublisher {
    settings: Arc<RwLock<MqttSettings>>,
    state: Arc<RwLock<SessionState>>,
    client: Arc<RwLock<Option<AsyncClient>>>,
    data_queue: Arc<DataQueue>,
    fallback: Arc<FallbackQueue>,
    bridge: Option<Arc<WriteBridge>>,
    running: Arc<RwLock<bool>>,
    tasks: RwLock<Vec<JoinHandle<()>>>,
}

impl MqttPublisher {
    pub fn new(
        settings: MqttSettings,
        data_queue: Arc<DataQueue>,
        fallback: Arc<FallbackQueue>,
        bridge: Option<Arc<WriteBridge>>,
    ) -> Self {
        Self {
            settings: Arc::new(RwLock::new(settings)),
            state: Arc::new(RwLock::new(SessionState::Off)),
            client: Arc::new(RwLock::new(None)),
            data_queue,
            fallback,
            bridge,
            running: Arc::new(RwLock::new(false)),
            tasks: RwLock::new(Vec::new()),
        }
    }

    pub async fn session_state(&self) -> SessionState {
        *self.state.read().await
    }

    /// Replace the settings and restart the session if it was running.
    pub async fn reload(&self, settings: MqttSettings) {
        let was_running = *self.running.read().await;
        if was_running {
            self.stop().await;
        }
        *self.settings.write().await = settings;
        if was_running {
            self.start().await;
        }
    }

    /// Bring the session up and start both worker tasks.
    pub async fn start(&self) {
        {
            let mut running = self.running.write().await;
            if *running {
                return;
            }
            *running = true;
        }

        let settings = self.settings.read().await.clone();
        if !settings.enabled || settings.host.is_empty() {
            info!("MQTT publisher disabled by configuration");
            *self.state.write().await = SessionState::Off;
            *self.running.write().await = false;
            return;
        }

        let client_id = if settings.client_id.is_empty() {
            format!("fieldgate-{}", fieldgate_core::generate_device_id())
        } else {
            settings.client_id.clone()
        };
        let mut options = MqttOptions::new(&client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        options.set_clean_session(settings.clean_session);
        if !settings.username.is_empty() {
            options.set_credentials(&settings.username, &settings.password);
        }
        let buffer = compute_buffer_size(MQTT_CYCLE_CAP);
        options.set_max_packet_size(buffer, buffer);

        let (client, eventloop) = AsyncClient::new(options, 10);
        *self.client.write().await = Some(client.clone());
        *self.state.write().await = SessionState::Connecting;
        info!(host = %settings.host, port = settings.port, client_id = %client_id, "MQTT session starting");

        let mut tasks = self.tasks.write().await;
        tasks.push(self.spawn_session_task(eventloop, client.clone(), settings.clone()));
        tasks.push(self.spawn_publish_task(client, settings));
    }

    /// Stop the tasks and disconnect.
    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            if !*running {
                return;
            }
            *running = false;
        }
        let handles: Vec<JoinHandle<()>> = self.tasks.write().await.drain(..).collect();
        for handle in handles {
            handle.await.ok();
        }
        if let Some(client) = self.client.write().await.take() {
            client.disconnect().await.ok();
        }
        *self.state.write().await = SessionState::Off;
        info!("MQTT publisher stopped");
    }

    fn spawn_session_task(
        &self,
        mut eventloop: rumqttc::EventLoop,
        client: AsyncClient,
        settings: MqttSettings,
    ) -> JoinHandle<()> {
        let running = self.running.clone();
        let state = self.state.clone();
        let bridge = self.bridge.clone();

        tokio::spawn(async move {
            let mut backoff_ms = RECONNECT_MIN_MS;
            loop {
                if !*running.read().await {
                    break;
                }
                match tokio::time::timeout(Duration::from_secs(1), eventloop.poll()).await {
                    Err(_) => continue, // idle; re-check the running flag
                    Ok(Ok(Event::Incoming(Packet::ConnAck(_)))) => {
                        info!("MQTT session established");
                        *state.write().await = SessionState::Ok;
                        backoff_ms = RECONNECT_MIN_MS;
                        Self::subscribe_all(&client, &settings).await;
                    }
                    Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                        Self::handle_inbound(&client, &settings, bridge.as_deref(), &publish)
                            .await;
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        warn!("MQTT session error: {}", e);
                        *state.write().await = SessionState::Err;
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = (backoff_ms * 2).min(RECONNECT_MAX_MS);
                    }
                }
            }
            debug!("MQTT session task exited");
        })
    }

    async fn subscribe_all(client: &AsyncClient, settings: &MqttSettings) {
        let mut topics: Vec<(String, QoS)> = Vec::new();
        if settings.publish_mode == PublishMode::Default
            && settings.default_mode.enabled
            && !settings.default_mode.topic_subscribe.is_empty()
        {
            topics.push((settings.default_mode.topic_subscribe.clone(), QoS::AtLeastOnce));
        }
        if settings.customize_mode.enabled {
            for custom in &settings.customize_mode.custom_topics {
                if !custom.registers.is_empty() {
                    topics.push((custom.topic.clone(), qos_from(custom.qos)));
                }
            }
        }
        for (topic, qos) in topics {
            if let Err(e) = client.subscribe(topic.as_str(), qos).await {
                warn!(topic = %topic, "subscribe failed: {}", e);
            } else {
                debug!(topic = %topic, "subscribed");
            }
        }
    }

    async fn handle_inbound(
        client: &AsyncClient,
        settings: &MqttSettings,
        bridge: Option<&WriteBridge>,
        publish: &rumqttc::Publish,
    ) {
        let Some(bridge) = bridge else {
            debug!(topic = %publish.topic, "inbound message ignored: no write bridge");
            return;
        };
        let Some(custom) = settings
            .customize_mode
            .custom_topics
            .iter()
            .find(|t| t.topic == publish.topic)
        else {
            debug!(topic = %publish.topic, "inbound message on unmapped topic");
            return;
        };

        let response = bridge.handle(custom, &publish.payload).await;
        let response_topic = custom.response_topic();
        let payload = response.to_string();
        if let Err(e) = client
            .publish(response_topic.as_str(), qos_from(custom.qos), false, payload)
            .await
        {
            warn!(topic = %response_topic, "write response publish failed: {}", e);
        }
    }

    fn spawn_publish_task(&self, client: AsyncClient, settings: MqttSettings) -> JoinHandle<()> {
        let running = self.running.clone();
        let state = self.state.clone();
        let data_queue = self.data_queue.clone();
        let fallback = self.fallback.clone();

        tokio::spawn(async move {
            let epoch = Instant::now();
            let mut tick = tokio::time::interval(Duration::from_millis(PUBLISH_TICK_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            let mut default_gate = CadenceGate::new(
                settings
                    .default_mode
                    .interval_unit
                    .to_duration(settings.default_mode.interval.max(1)),
            );
            let mut custom_gates: Vec<CadenceGate> = settings
                .customize_mode
                .custom_topics
                .iter()
                .map(|t| CadenceGate::new(t.interval_unit.to_duration(t.interval.max(1))))
                .collect();
            let mut latest = HashMap::new();

            loop {
                if !*running.read().await {
                    break;
                }
                tick.tick().await;
                if *state.read().await != SessionState::Ok {
                    continue;
                }
                let now_ms = epoch.elapsed().as_millis() as u64;

                // Undelivered backlog goes out first.
                Self::drain_fallback(&client, &fallback).await;

                match settings.publish_mode {
                    PublishMode::Default => {
                        if settings.default_mode.enabled && default_gate.due(now_ms) {
                            let drained = drain(&data_queue, MQTT_CYCLE_CAP).await;
                            if drained.is_empty() {
                                continue;
                            }
                            let mut cycle = HashMap::new();
                            dedup_into(&mut cycle, drained);
                            let mut points: Vec<_> = cycle.into_values().collect();
                            points.sort_by(|a, b| a.register_id.cmp(&b.register_id));
                            let payload = batch_payload(&points).to_string();
                            Self::publish_or_fallback(
                                &client,
                                &fallback,
                                &settings.default_mode.topic_publish,
                                QoS::AtLeastOnce,
                                payload,
                            )
                            .await;
                        }
                    }
                    PublishMode::Customize => {
                        if !settings.customize_mode.enabled {
                            continue;
                        }
                        // Keep the last-value map fresh between cadences.
                        let drained = drain(&data_queue, MQTT_CYCLE_CAP).await;
                        dedup_into(&mut latest, drained);

                        for (custom, gate) in settings
                            .customize_mode
                            .custom_topics
                            .iter()
                            .zip(custom_gates.iter_mut())
                        {
                            if !gate.due(now_ms) {
                                continue;
                            }
                            let points = select_registers(&latest, &custom.registers);
                            if points.is_empty() {
                                continue;
                            }
                            let payload = batch_payload(&points).to_string();
                            Self::publish_or_fallback(
                                &client,
                                &fallback,
                                &custom.topic,
                                qos_from(custom.qos),
                                payload,
                            )
                            .await;
                        }
                    }
                }
            }
            debug!("MQTT publish task exited");
        })
    }

    async fn publish_or_fallback(
        client: &AsyncClient,
        fallback: &FallbackQueue,
        topic: &str,
        qos: QoS,
        payload: String,
    ) {
        match client.publish(topic, qos, false, payload.clone()).await {
            Ok(()) => debug!(topic = %topic, bytes = payload.len(), "batch published"),
            Err(e) => {
                warn!(topic = %topic, "publish failed, diverting to fallback: {}", e);
                let entry = FallbackEntry {
                    topic: topic.to_string(),
                    payload: payload.into_bytes(),
                    qos: match qos {
                        QoS::AtMostOnce => 0,
                        QoS::AtLeastOnce => 1,
                        QoS::ExactlyOnce => 2,
                    },
                    timestamp: chrono::Utc::now().timestamp(),
                };
                if let Err(e) = fallback.append(&entry) {
                    warn!("fallback append failed: {}", e);
                }
            }
        }
    }

    async fn drain_fallback(client: &AsyncClient, fallback: &FallbackQueue) {
        loop {
            let entry = match fallback.pop_front() {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("fallback read failed: {}", e);
                    break;
                }
            };
            match client
                .publish(entry.topic.as_str(), qos_from(entry.qos), false, entry.payload.clone())
                .await
            {
                Ok(()) => debug!(topic = %entry.topic, "fallback entry delivered"),
                Err(e) => {
                    // Put it back and try again next tick.
                    warn!(topic = %entry.topic, "fallback delivery failed: {}", e);
                    if let Err(e) = fallback.append(&entry) {
                        warn!("fallback re-append failed: {}", e);
                    }
                    break;
                }
            }
        }
    }

    /// Publish an arbitrary document immediately (used by tests and the
    /// status surface). Falls back like batch traffic.
    pub async fn publish_json(&self, topic: &str, value: &serde_json::Value) -> Result<()> {
        let client = self.client.read().await;
        let client = client
            .as_ref()
            .ok_or_else(|| CloudError::MqttConnection("session not started".to_string()))?;
        client
            .publish(topic, QoS::AtLeastOnce, false, value.to_string())
            .await
            .map_err(|e| CloudError::MqttPublish(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_storage::ConfigStore;

    fn publisher(settings: MqttSettings) -> (MqttPublisher, Arc<ConfigStore>) {
        let store = Arc::new(ConfigStore::ephemeral().unwrap());
        let fallback = Arc::new(FallbackQueue::open(&store).unwrap());
        let queue = Arc::new(DataQueue::new());
        (MqttPublisher::new(settings, queue, fallback, None), store)
    }

    #[tokio::test]
    async fn test_disabled_settings_stay_off() {
        let settings = MqttSettings {
            enabled: false,
            ..MqttSettings::default()
        };
        let (publisher, _store) = publisher(settings);
        publisher.start().await;
        assert_eq!(publisher.session_state().await, SessionState::Off);
    }

    #[tokio::test]
    async fn test_empty_host_stays_off() {
        let (publisher, _store) = publisher(MqttSettings::default());
        publisher.start().await;
        assert_eq!(publisher.session_state().await, SessionState::Off);
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from(0), QoS::AtMostOnce);
        assert_eq!(qos_from(1), QoS::AtLeastOnce);
        assert_eq!(qos_from(2), QoS::ExactlyOnce);
        assert_eq!(qos_from(9), QoS::AtMostOnce);
    }
}
