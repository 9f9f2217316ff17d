//! Event bus for configuration-change notifications.
//!
//! Drivers and publishers subscribe during wiring and reload their cached
//! configuration when a matching event arrives, so cadences, topics and
//! device lists change without a restart. The bus is a broadcast channel:
//! slow subscribers may drop events and must treat any reload signal as
//! "re-read everything you care about".

use tokio::sync::broadcast;

/// Default buffered events per subscriber.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Configuration and lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// A device document was created.
    DeviceCreated { device_id: String },
    /// A device document was updated (registers included).
    DeviceUpdated { device_id: String },
    /// A device document was deleted; queues have been flushed.
    DeviceDeleted { device_id: String },
    /// The server configuration document changed.
    ServerConfigUpdated,
    /// The logging configuration document changed.
    LoggingConfigUpdated,
    /// The OTA configuration document changed.
    OtaConfigUpdated,
    /// The store was wiped.
    FactoryReset,
    /// A configuration snapshot was restored; reload everything.
    ConfigRestored,
    /// Live streaming was started for a device.
    StreamStarted { device_id: String },
    /// Live streaming was stopped.
    StreamStopped,
    /// The active network interface changed.
    NetworkSwitched { mode: &'static str },
    /// A component requests a process restart.
    RestartRequested { reason: String },
}

/// Broadcast-based event bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns `true` if at least one subscriber saw it.
    pub fn publish(&self, event: GatewayEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver half of the event bus.
pub struct EventReceiver {
    rx: broadcast::Receiver<GatewayEvent>,
}

impl EventReceiver {
    /// Receive the next event. Returns `None` when the bus is closed.
    /// A lagged receiver skips to the oldest retained event.
    pub async fn recv(&mut self) -> Option<GatewayEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged; continuing");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<GatewayEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert!(bus.publish(GatewayEvent::ServerConfigUpdated));
        assert_eq!(rx.recv().await, Some(GatewayEvent::ServerConfigUpdated));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert!(!bus.publish(GatewayEvent::FactoryReset));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.publish(GatewayEvent::DeviceCreated {
            device_id: "A3F2C1".to_string(),
        });
        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
    }
}
