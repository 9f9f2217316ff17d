//! Memory guard.
//!
//! Checks pool headroom every five seconds and walks a tiered recovery
//! ladder, lightest action first: flush the oldest queue entries, clear
//! expired fallback messages, purge caches, and finally request a restart
//! when the small pool sits at EMERGENCY for several consecutive checks.

use std::sync::Arc;
use std::time::Duration;

use fieldgate_core::{
    DataQueue, ErrorKind, ErrorMonitor, EventBus, GatewayEvent, MemoryLevel, SharedPools,
};
use fieldgate_link::LinkMetrics;
use fieldgate_storage::FallbackQueue;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Check cadence.
pub const CHECK_INTERVAL_MS: u64 = 5_000;

/// Oldest queue entries flushed per WARNING check.
pub const FLUSH_BATCH: usize = 20;

/// Fallback entries older than this are expendable under pressure.
pub const FALLBACK_EXPIRY_SECS: i64 = 60 * 60;

/// Consecutive EMERGENCY checks before a restart is requested.
pub const EMERGENCY_RESTART_AFTER: u32 = 3;

/// Periodic memory watchdog.
pub struct MemoryGuard {
    pools: SharedPools,
    data_queue: Arc<DataQueue>,
    fallback: Arc<FallbackQueue>,
    metrics: Arc<LinkMetrics>,
    events: EventBus,
    monitor: ErrorMonitor,
    running: Arc<RwLock<bool>>,
    task: RwLock<Option<JoinHandle<()>>>,
}

impl MemoryGuard {
    pub fn new(
        pools: SharedPools,
        data_queue: Arc<DataQueue>,
        fallback: Arc<FallbackQueue>,
        metrics: Arc<LinkMetrics>,
        events: EventBus,
        monitor: ErrorMonitor,
    ) -> Self {
        Self {
            pools,
            data_queue,
            fallback,
            metrics,
            events,
            monitor,
            running: Arc::new(RwLock::new(false)),
            task: RwLock::new(None),
        }
    }

    /// One guard check. Returns the observed level. Public so tests can
    /// drive the ladder without the timer.
    pub async fn check(&self, emergency_streak: &mut u32) -> MemoryLevel {
        let level = self.pools.level();
        match level {
            MemoryLevel::Healthy => {
                *emergency_streak = 0;
            }
            MemoryLevel::Warning => {
                *emergency_streak = 0;
                match self.data_queue.flush_oldest(FLUSH_BATCH).await {
                    Ok(flushed) if flushed > 0 => {
                        info!(flushed, "memory warning: oldest queue entries flushed")
                    }
                    Ok(_) => {}
                    Err(e) => debug!("queue flush skipped: {}", e),
                }
                self.monitor
                    .record(ErrorKind::MemLow, "small pool below warning threshold")
                    .await;
            }
            MemoryLevel::Critical => {
                *emergency_streak = 0;
                self.data_queue.flush_oldest(FLUSH_BATCH).await.ok();
                let now = chrono::Utc::now().timestamp();
                match self.fallback.clear_expired(now, FALLBACK_EXPIRY_SECS) {
                    Ok(removed) if removed > 0 => {
                        info!(removed, "memory critical: expired fallback entries cleared")
                    }
                    Ok(_) => {}
                    Err(e) => warn!("fallback cleanup failed: {}", e),
                }
                self.monitor
                    .record(ErrorKind::MemLow, "small pool below critical threshold")
                    .await;
            }
            MemoryLevel::Emergency => {
                *emergency_streak += 1;
                warn!(streak = *emergency_streak, "memory emergency");
                // Heaviest non-fatal actions: drop every cache we own.
                self.data_queue.clear().await.ok();
                self.fallback.clear().ok();
                self.metrics.prune();
                self.monitor
                    .record(ErrorKind::MemCritical, "small pool below emergency threshold")
                    .await;
                if *emergency_streak >= EMERGENCY_RESTART_AFTER {
                    self.events.publish(GatewayEvent::RestartRequested {
                        reason: format!(
                            "memory emergency sustained for {} checks",
                            emergency_streak
                        ),
                    });
                }
            }
        }
        level
    }

    pub async fn start(self: &Arc<Self>) {
        let mut running = self.running.write().await;
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let guard = self.clone();
        let running_flag = self.running.clone();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(CHECK_INTERVAL_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut emergency_streak = 0u32;
            loop {
                if !*running_flag.read().await {
                    break;
                }
                tick.tick().await;
                guard.check(&mut emergency_streak).await;
            }
            debug!("memory guard exited");
        });

        let mut task = self.task.write().await;
        *task = Some(handle);
        info!("memory guard started");
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
        drop(running);
        let handle = self.task.write().await.take();
        if let Some(handle) = handle {
            handle.await.ok();
        }
        info!("memory guard stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldgate_core::{MeasurementPoint, MemoryPools};
    use fieldgate_storage::ConfigStore;

    fn fixture(small_budget: usize) -> (Arc<MemoryGuard>, Arc<DataQueue>, EventBus, SharedPools) {
        // A zero-size large pool forces everything into the small pool so
        // the thresholds are easy to hit.
        let pools: SharedPools = Arc::new(MemoryPools::with_budgets(small_budget, 0));
        let events = EventBus::new();
        let store = Arc::new(ConfigStore::ephemeral().unwrap());
        let fallback = Arc::new(FallbackQueue::open(&store).unwrap());
        let data_queue = Arc::new(DataQueue::with_capacity(200).with_pools(pools.clone()));
        let guard = Arc::new(MemoryGuard::new(
            pools.clone(),
            data_queue.clone(),
            fallback,
            Arc::new(LinkMetrics::new()),
            events.clone(),
            ErrorMonitor::new(),
        ));
        (guard, data_queue, events, pools)
    }

    fn point(i: usize) -> MeasurementPoint {
        MeasurementPoint {
            timestamp: 0,
            device_id: "A3F2C1".to_string(),
            device_name: "M1".to_string(),
            register_id: format!("r{}", i),
            register_name: "r".to_string(),
            value: i as f64,
            unit: String::new(),
            description: String::new(),
        }
    }

    #[tokio::test]
    async fn test_healthy_takes_no_action() {
        let (guard, queue, _events, _pools) = fixture(1024 * 1024);
        queue.enqueue(point(0)).await.unwrap();
        let mut streak = 0;
        assert_eq!(guard.check(&mut streak).await, MemoryLevel::Healthy);
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_warning_flushes_oldest() {
        // 64 KB small pool: plenty of queue entries fit, but free space
        // sits between the warning (40 KB) and critical (20 KB) marks.
        let (guard, queue, _events, _pools) = fixture(64 * 1024);
        for i in 0..120 {
            queue.enqueue(point(i)).await.unwrap();
        }
        let mut streak = 0;
        let level = guard.check(&mut streak).await;
        assert_eq!(level, MemoryLevel::Warning);
        assert_eq!(queue.len().await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_sustained_emergency_requests_restart() {
        let (guard, _queue, events, _pools) = fixture(1024);
        let mut rx = events.subscribe();
        let mut streak = 0;
        for _ in 0..EMERGENCY_RESTART_AFTER {
            assert_eq!(guard.check(&mut streak).await, MemoryLevel::Emergency);
        }
        match rx.recv().await {
            Some(GatewayEvent::RestartRequested { reason }) => {
                assert!(reason.contains("memory emergency"));
            }
            other => panic!("expected restart request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_emergency_streak_resets_on_recovery() {
        let (guard, queue, events, pools) = fixture(1024);
        let mut rx = events.subscribe();
        let mut streak = 0;
        guard.check(&mut streak).await;
        assert_eq!(streak, 1);

        // Pressure released: reserve accounting freed.
        queue.clear().await.unwrap();
        let _ = pools;
        // The small pool is tiny, still emergency by budget; emulate
        // recovery by checking the streak reset path with a bigger fixture.
        let (guard2, _q2, _e2, _p2) = fixture(1024 * 1024);
        guard2.check(&mut streak).await;
        assert_eq!(streak, 0);
        assert!(rx.try_recv().is_none());
    }
}
