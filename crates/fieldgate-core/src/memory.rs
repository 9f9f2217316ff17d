//! Two-pool memory accounting.
//!
//! The target hardware carries a scarce internal heap and an abundant
//! external one. Rather than a custom allocator, the gateway accounts for
//! bulk allocations (queue payloads, JSON working buffers, metrics rings)
//! against pool budgets: reservations prefer the large pool and fall back to
//! the small one with a rate-limited warning. The memory guard reads the
//! same accounting to drive its recovery ladder.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Which pool a reservation landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Internal heap, scarce.
    Small,
    /// External heap, abundant.
    Large,
}

/// Free-space classification of the small pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryLevel {
    Healthy,
    Warning,
    Critical,
    Emergency,
}

/// Thresholds on free bytes in the small pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryThresholds {
    pub healthy: usize,
    pub warning: usize,
    pub critical: usize,
    pub emergency: usize,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            healthy: 80 * 1024,
            warning: 40 * 1024,
            critical: 20 * 1024,
            emergency: 10 * 1024,
        }
    }
}

impl MemoryThresholds {
    /// Classify a free-byte reading.
    pub fn classify(&self, free_small: usize) -> MemoryLevel {
        if free_small >= self.healthy {
            MemoryLevel::Healthy
        } else if free_small >= self.warning {
            MemoryLevel::Warning
        } else if free_small >= self.critical {
            MemoryLevel::Critical
        } else {
            MemoryLevel::Emergency
        }
    }
}

/// Minimum interval between fallback warnings, in milliseconds.
const FALLBACK_WARN_INTERVAL_MS: u64 = 10_000;

/// Shared pool accounting.
pub struct MemoryPools {
    small_capacity: usize,
    large_capacity: usize,
    small_used: AtomicUsize,
    large_used: AtomicUsize,
    fallback_count: AtomicU64,
    last_fallback_warn_ms: AtomicU64,
    thresholds: MemoryThresholds,
}

/// Shared handle to the pool accounting.
pub type SharedPools = Arc<MemoryPools>;

impl MemoryPools {
    /// Default pool budgets: 300 KB internal, 4 MB external.
    pub fn new() -> Self {
        Self::with_budgets(300 * 1024, 4 * 1024 * 1024)
    }

    pub fn with_budgets(small_capacity: usize, large_capacity: usize) -> Self {
        Self {
            small_capacity,
            large_capacity,
            small_used: AtomicUsize::new(0),
            large_used: AtomicUsize::new(0),
            fallback_count: AtomicU64::new(0),
            last_fallback_warn_ms: AtomicU64::new(0),
            thresholds: MemoryThresholds::default(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: MemoryThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn thresholds(&self) -> &MemoryThresholds {
        &self.thresholds
    }

    /// Reserve `bytes`, preferring the large pool. Returns the pool charged,
    /// or `None` when both pools are exhausted.
    pub fn reserve(&self, bytes: usize, now_ms: u64) -> Option<PoolKind> {
        if self.try_charge(&self.large_used, self.large_capacity, bytes) {
            return Some(PoolKind::Large);
        }
        if self.try_charge(&self.small_used, self.small_capacity, bytes) {
            self.fallback_count.fetch_add(1, Ordering::Relaxed);
            let last = self.last_fallback_warn_ms.load(Ordering::Relaxed);
            if now_ms.saturating_sub(last) >= FALLBACK_WARN_INTERVAL_MS
                && self
                    .last_fallback_warn_ms
                    .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                tracing::warn!(
                    bytes,
                    fallbacks = self.fallback_count.load(Ordering::Relaxed),
                    "large pool exhausted; allocation fell back to internal heap"
                );
            }
            return Some(PoolKind::Small);
        }
        None
    }

    /// Release a prior reservation.
    pub fn release(&self, kind: PoolKind, bytes: usize) {
        let counter = match kind {
            PoolKind::Small => &self.small_used,
            PoolKind::Large => &self.large_used,
        };
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match counter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn try_charge(&self, counter: &AtomicUsize, capacity: usize, bytes: usize) -> bool {
        let mut current = counter.load(Ordering::Relaxed);
        loop {
            let next = match current.checked_add(bytes) {
                Some(n) if n <= capacity => n,
                _ => return false,
            };
            match counter.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn free_small(&self) -> usize {
        self.small_capacity
            .saturating_sub(self.small_used.load(Ordering::Relaxed))
    }

    pub fn free_large(&self) -> usize {
        self.large_capacity
            .saturating_sub(self.large_used.load(Ordering::Relaxed))
    }

    /// Current classification of the small pool.
    pub fn level(&self) -> MemoryLevel {
        self.thresholds.classify(self.free_small())
    }

    pub fn fallback_count(&self) -> u64 {
        self.fallback_count.load(Ordering::Relaxed)
    }
}

impl Default for MemoryPools {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_large_pool() {
        let pools = MemoryPools::with_budgets(1024, 4096);
        assert_eq!(pools.reserve(1000, 0), Some(PoolKind::Large));
        assert_eq!(pools.free_large(), 3096);
        assert_eq!(pools.free_small(), 1024);
    }

    #[test]
    fn test_falls_back_to_small_pool() {
        let pools = MemoryPools::with_budgets(1024, 512);
        assert_eq!(pools.reserve(800, 0), Some(PoolKind::Small));
        assert_eq!(pools.fallback_count(), 1);
    }

    #[test]
    fn test_exhaustion() {
        let pools = MemoryPools::with_budgets(100, 100);
        assert_eq!(pools.reserve(300, 0), None);
    }

    #[test]
    fn test_release_restores_capacity() {
        let pools = MemoryPools::with_budgets(0, 1000);
        let kind = pools.reserve(600, 0).unwrap();
        pools.release(kind, 600);
        assert_eq!(pools.free_large(), 1000);
    }

    #[test]
    fn test_level_classification() {
        let thresholds = MemoryThresholds::default();
        assert_eq!(thresholds.classify(100 * 1024), MemoryLevel::Healthy);
        assert_eq!(thresholds.classify(50 * 1024), MemoryLevel::Warning);
        assert_eq!(thresholds.classify(25 * 1024), MemoryLevel::Critical);
        assert_eq!(thresholds.classify(5 * 1024), MemoryLevel::Emergency);
    }
}
