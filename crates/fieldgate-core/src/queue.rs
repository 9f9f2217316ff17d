//! Bounded measurement queues.
//!
//! [`DataQueue`] is the hand-off point between the polling drivers and the
//! cloud publishers: a bounded FIFO that evicts its oldest record on
//! overflow and counts the drops. A second, smaller instance (the stream
//! queue) carries live samples for the provisioning link's streaming
//! notifications.
//!
//! Every operation takes the inner lock with a bounded timeout and returns
//! an error instead of blocking indefinitely.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::CoreError;
use crate::memory::{PoolKind, SharedPools};
use crate::model::MeasurementPoint;

/// Default capacity of the main data queue.
pub const DATA_QUEUE_CAPACITY: usize = 100;

/// Default capacity of the stream queue.
pub const STREAM_QUEUE_CAPACITY: usize = 50;

/// Bounded lock acquisition window.
pub const LOCK_TIMEOUT_MS: u64 = 100;

/// Queue counters exposed over the status operation.
#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
pub struct QueueStats {
    pub size: usize,
    pub capacity: usize,
    /// Records evicted by overflow since boot.
    pub dropped: u64,
    pub enqueued_total: u64,
}

struct QueueInner {
    items: VecDeque<(MeasurementPoint, PoolKind, usize)>,
    capacity: usize,
    dropped: u64,
    enqueued_total: u64,
}

/// Bounded FIFO of measurement points with head eviction on overflow.
pub struct DataQueue {
    inner: Arc<Mutex<QueueInner>>,
    pools: Option<SharedPools>,
    lock_timeout: Duration,
}

impl DataQueue {
    pub fn new() -> Self {
        Self::with_capacity(DATA_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                dropped: 0,
                enqueued_total: 0,
            })),
            pools: None,
            lock_timeout: Duration::from_millis(LOCK_TIMEOUT_MS),
        }
    }

    /// Charge queue payloads against the shared pools.
    pub fn with_pools(mut self, pools: SharedPools) -> Self {
        self.pools = Some(pools);
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, QueueInner>, CoreError> {
        timeout(self.lock_timeout, self.inner.lock())
            .await
            .map_err(|_| CoreError::LockTimeout(self.lock_timeout.as_millis() as u64))
    }

    fn point_bytes(point: &MeasurementPoint) -> usize {
        std::mem::size_of::<MeasurementPoint>()
            + point.device_id.len()
            + point.device_name.len()
            + point.register_id.len()
            + point.register_name.len()
            + point.unit.len()
            + point.description.len()
    }

    fn charge(&self, point: &MeasurementPoint) -> (PoolKind, usize) {
        let bytes = Self::point_bytes(point);
        let kind = match &self.pools {
            Some(pools) => pools
                .reserve(bytes, chrono::Utc::now().timestamp_millis() as u64)
                .unwrap_or(PoolKind::Large),
            None => PoolKind::Large,
        };
        (kind, bytes)
    }

    fn refund(&self, kind: PoolKind, bytes: usize) {
        if let Some(pools) = &self.pools {
            pools.release(kind, bytes);
        }
    }

    /// Enqueue a point. On overflow the oldest record is evicted and the
    /// drop counter incremented; the enqueue itself always succeeds once the
    /// lock is held.
    pub async fn enqueue(&self, point: MeasurementPoint) -> Result<(), CoreError> {
        let (kind, bytes) = self.charge(&point);
        let mut inner = match self.lock().await {
            Ok(guard) => guard,
            Err(e) => {
                self.refund(kind, bytes);
                return Err(e);
            }
        };
        if inner.items.len() >= inner.capacity {
            if let Some((_, old_kind, old_bytes)) = inner.items.pop_front() {
                inner.dropped += 1;
                self.refund(old_kind, old_bytes);
            }
        }
        inner.items.push_back((point, kind, bytes));
        inner.enqueued_total += 1;
        Ok(())
    }

    /// Dequeue the oldest point.
    pub async fn dequeue(&self) -> Result<Option<MeasurementPoint>, CoreError> {
        let mut inner = self.lock().await?;
        match inner.items.pop_front() {
            Some((point, kind, bytes)) => {
                drop(inner);
                self.refund(kind, bytes);
                Ok(Some(point))
            }
            None => Ok(None),
        }
    }

    /// Re-insert a point at the head (failed-delivery requeue).
    pub async fn requeue_front(&self, point: MeasurementPoint) -> Result<(), CoreError> {
        let (kind, bytes) = self.charge(&point);
        let mut inner = match self.lock().await {
            Ok(guard) => guard,
            Err(e) => {
                self.refund(kind, bytes);
                return Err(e);
            }
        };
        if inner.items.len() >= inner.capacity {
            // Head insertion on a full queue evicts from the tail instead,
            // keeping the requeued record first in line.
            if let Some((_, old_kind, old_bytes)) = inner.items.pop_back() {
                inner.dropped += 1;
                self.refund(old_kind, old_bytes);
            }
        }
        inner.items.push_front((point, kind, bytes));
        Ok(())
    }

    /// Copy of the oldest point without removing it.
    pub async fn peek(&self) -> Result<Option<MeasurementPoint>, CoreError> {
        let inner = self.lock().await?;
        Ok(inner.items.front().map(|(p, _, _)| p.clone()))
    }

    pub async fn len(&self) -> Result<usize, CoreError> {
        Ok(self.lock().await?.items.len())
    }

    pub async fn is_empty(&self) -> Result<bool, CoreError> {
        Ok(self.lock().await?.items.is_empty())
    }

    /// Remove everything.
    pub async fn clear(&self) -> Result<(), CoreError> {
        let mut inner = self.lock().await?;
        let drained: Vec<(PoolKind, usize)> = inner
            .items
            .drain(..)
            .map(|(_, kind, bytes)| (kind, bytes))
            .collect();
        drop(inner);
        for (kind, bytes) in drained {
            self.refund(kind, bytes);
        }
        Ok(())
    }

    /// Remove the oldest `count` records (memory-guard relief valve).
    /// Returns how many were removed.
    pub async fn flush_oldest(&self, count: usize) -> Result<usize, CoreError> {
        let mut inner = self.lock().await?;
        let n = count.min(inner.items.len());
        let drained: Vec<(PoolKind, usize)> = inner
            .items
            .drain(..n)
            .map(|(_, kind, bytes)| (kind, bytes))
            .collect();
        drop(inner);
        for (kind, bytes) in &drained {
            self.refund(*kind, *bytes);
        }
        Ok(drained.len())
    }

    /// Remove every record belonging to a device (cascaded deletion).
    /// Records of other devices keep their relative order. Returns how many
    /// were removed.
    pub async fn flush_by_device(&self, device_id: &str) -> Result<usize, CoreError> {
        let mut inner = self.lock().await?;
        let before = inner.items.len();
        let mut removed = Vec::new();
        inner.items.retain(|(point, kind, bytes)| {
            if point.device_id == device_id {
                removed.push((*kind, *bytes));
                false
            } else {
                true
            }
        });
        let count = before - inner.items.len();
        drop(inner);
        for (kind, bytes) in removed {
            self.refund(kind, bytes);
        }
        Ok(count)
    }

    pub async fn stats(&self) -> Result<QueueStats, CoreError> {
        let inner = self.lock().await?;
        Ok(QueueStats {
            size: inner.items.len(),
            capacity: inner.capacity,
            dropped: inner.dropped,
            enqueued_total: inner.enqueued_total,
        })
    }
}

impl Default for DataQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared "live stream" gate.
///
/// The command handler sets the device being streamed; the polling drivers
/// consult it on every successful read to decide whether a point is also
/// pushed into the stream queue. At most one device streams at a time.
#[derive(Clone, Default)]
pub struct StreamGate {
    active: Arc<std::sync::RwLock<Option<String>>>,
}

impl StreamGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start streaming a device, replacing any previous selection.
    pub fn start(&self, device_id: impl Into<String>) {
        *self.active.write().expect("stream gate poisoned") = Some(device_id.into());
    }

    /// Stop streaming.
    pub fn stop(&self) {
        *self.active.write().expect("stream gate poisoned") = None;
    }

    /// Whether the given device is currently being streamed.
    pub fn is_streaming(&self, device_id: &str) -> bool {
        self.active
            .read()
            .expect("stream gate poisoned")
            .as_deref()
            == Some(device_id)
    }

    /// Currently streamed device, if any.
    pub fn active(&self) -> Option<String> {
        self.active.read().expect("stream gate poisoned").clone()
    }
}
