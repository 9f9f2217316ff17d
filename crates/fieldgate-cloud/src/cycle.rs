//! Publish-cycle plumbing shared by both publishers.
//!
//! Draining, per-cycle deduplication (last value wins per register id),
//! cadence gating, batch serialization, and the outbound buffer sizing
//! formula.

use std::collections::HashMap;
use std::time::Duration;

use fieldgate_core::{DataQueue, MeasurementPoint};

/// Per-cycle drain cap for the MQTT default mode.
pub const MQTT_CYCLE_CAP: usize = 100;

/// Per-cycle drain cap for the HTTP publisher.
pub const HTTP_CYCLE_CAP: usize = 5;

/// Outbound buffer sizing: bytes per register plus fixed overhead, clamped
/// to the configured window.
pub const BUFFER_BYTES_PER_REGISTER: usize = 120;
pub const BUFFER_OVERHEAD: usize = 1024;
pub const MIN_BUFFER_BYTES: usize = 4 * 1024;
pub const MAX_BUFFER_BYTES: usize = 256 * 1024;

/// Optimal outbound buffer for a register count.
pub fn compute_buffer_size(register_count: usize) -> usize {
    (register_count * BUFFER_BYTES_PER_REGISTER + BUFFER_OVERHEAD)
        .clamp(MIN_BUFFER_BYTES, MAX_BUFFER_BYTES)
}

/// Drain up to `cap` points from the queue.
pub async fn drain(queue: &DataQueue, cap: usize) -> Vec<MeasurementPoint> {
    let mut points = Vec::new();
    while points.len() < cap {
        match queue.dequeue().await {
            Ok(Some(point)) => points.push(point),
            _ => break,
        }
    }
    points
}

/// Fold drained points into a last-value-wins map keyed by register id.
pub fn dedup_into(latest: &mut HashMap<String, MeasurementPoint>, points: Vec<MeasurementPoint>) {
    for point in points {
        latest.insert(point.register_id.clone(), point);
    }
}

/// Points for the registers a custom topic selects, in the topic's order.
pub fn select_registers(
    latest: &HashMap<String, MeasurementPoint>,
    registers: &[String],
) -> Vec<MeasurementPoint> {
    registers
        .iter()
        .filter_map(|id| latest.get(id).cloned())
        .collect()
}

/// Self-describing batch payload.
pub fn batch_payload(points: &[MeasurementPoint]) -> serde_json::Value {
    serde_json::json!({
        "timestamp": chrono::Utc::now().timestamp(),
        "count": points.len(),
        "points": points,
    })
}

/// Fixed-interval publish gate.
#[derive(Debug)]
pub struct CadenceGate {
    interval: Duration,
    next_fire_ms: u64,
}

impl CadenceGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_fire_ms: 0,
        }
    }

    /// True when the cadence has elapsed; arms the next deadline.
    pub fn due(&mut self, now_ms: u64) -> bool {
        if now_ms >= self.next_fire_ms {
            self.next_fire_ms = now_ms + self.interval.as_millis() as u64;
            true
        } else {
            false
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(register_id: &str, value: f64) -> MeasurementPoint {
        MeasurementPoint {
            timestamp: 1_700_000_000,
            device_id: "A3F2C1".to_string(),
            device_name: "M1".to_string(),
            register_id: register_id.to_string(),
            register_name: register_id.to_string(),
            value,
            unit: String::new(),
            description: String::new(),
        }
    }

    #[test]
    fn test_buffer_sizing() {
        assert_eq!(compute_buffer_size(0), MIN_BUFFER_BYTES);
        assert_eq!(compute_buffer_size(100), 100 * 120 + 1024);
        assert_eq!(compute_buffer_size(100_000), MAX_BUFFER_BYTES);
    }

    #[test]
    fn test_dedup_last_value_wins() {
        let mut latest = HashMap::new();
        dedup_into(
            &mut latest,
            vec![point("r1", 1.0), point("r2", 5.0), point("r1", 2.0), point("r1", 3.0)],
        );
        assert_eq!(latest.len(), 2);
        assert_eq!(latest["r1"].value, 3.0);
        assert_eq!(latest["r2"].value, 5.0);
    }

    #[test]
    fn test_select_registers_filters_and_orders() {
        let mut latest = HashMap::new();
        dedup_into(&mut latest, vec![point("r1", 1.0), point("r2", 2.0)]);
        let selected = select_registers(&latest, &["r2".to_string(), "missing".to_string(), "r1".to_string()]);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].register_id, "r2");
        assert_eq!(selected[1].register_id, "r1");
    }

    #[test]
    fn test_cadence_gate() {
        let mut gate = CadenceGate::new(Duration::from_secs(1));
        assert!(gate.due(0));
        assert!(!gate.due(999));
        assert!(gate.due(1000));
        assert!(!gate.due(1500));
        assert!(gate.due(2100));
    }

    #[tokio::test]
    async fn test_drain_respects_cap() {
        let queue = DataQueue::with_capacity(50);
        for i in 0..10 {
            queue.enqueue(point("r", i as f64)).await.unwrap();
        }
        let drained = drain(&queue, 4).await;
        assert_eq!(drained.len(), 4);
        assert_eq!(queue.len().await.unwrap(), 6);
    }

    #[test]
    fn test_batch_payload_shape() {
        let payload = batch_payload(&[point("r1", 1.0)]);
        assert_eq!(payload["count"], 1);
        assert_eq!(payload["points"][0]["register_id"], "r1");
        assert_eq!(payload["points"][0]["device_id"], "A3F2C1");
    }
}
