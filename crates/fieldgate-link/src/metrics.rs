//! Link metrics collector.
//!
//! Every transport operation contributes one sample (latency, outcome,
//! signal, MTU, bytes). Rolling windows of 60, 300 and 900 seconds are
//! computed over the raw ring; a trend report compares the 5-minute and
//! 15-minute windows, and an overall health score folds latency, delivery
//! and signal penalties into a 0..100 value with coarse labels.
//!
//! The ring keeps at most 15 minutes of raw samples or 1000 entries,
//! whichever is smaller; a pruning task trims it once a second.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Raw sample cap.
pub const MAX_SAMPLES: usize = 1000;

/// Raw retention window.
pub const RETENTION_MS: u64 = 15 * 60 * 1000;

/// Rolling windows, in seconds.
pub const WINDOWS_SECS: [u64; 3] = [60, 300, 900];

/// One recorded link operation.
#[derive(Debug, Clone, Copy)]
pub struct LinkSample {
    pub timestamp_ms: u64,
    pub latency_ms: u64,
    pub success: bool,
    pub rssi: Option<i16>,
    pub mtu: Option<u16>,
    pub bytes: u64,
}

/// Statistics over one rolling window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowStats {
    pub window_secs: u64,
    pub count: u64,
    pub success_count: u64,
    pub success_rate: f64,
    pub min_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub p99_latency_ms: u64,
    pub throughput_bps: f64,
    pub avg_rssi: Option<f64>,
    pub avg_mtu: Option<f64>,
}

/// Direction of one metric between the 5- and 15-minute windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// Trend labels per tracked metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendReport {
    pub latency: Trend,
    pub throughput: Trend,
    pub signal: Trend,
    pub success_rate: Trend,
}

/// Health labels over the 0..100 score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthLabel {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl HealthLabel {
    pub fn from_score(score: u32) -> Self {
        match score {
            90..=100 => HealthLabel::Excellent,
            80..=89 => HealthLabel::Good,
            70..=79 => HealthLabel::Fair,
            50..=69 => HealthLabel::Poor,
            _ => HealthLabel::Critical,
        }
    }
}

/// Full metrics report as served over the link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub windows: Vec<WindowStats>,
    pub trend: TrendReport,
    pub health_score: u32,
    pub health_label: HealthLabel,
}

/// The collector.
pub struct LinkMetrics {
    samples: Mutex<VecDeque<LinkSample>>,
    epoch: Instant,
    prune_task: RwLock<Option<JoinHandle<()>>>,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(256)),
            epoch: Instant::now(),
            prune_task: RwLock::new(None),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Record one link operation.
    pub fn record(
        &self,
        latency_ms: u64,
        success: bool,
        rssi: Option<i16>,
        mtu: Option<u16>,
        bytes: u64,
    ) {
        let sample = LinkSample {
            timestamp_ms: self.now_ms(),
            latency_ms,
            success,
            rssi,
            mtu,
            bytes,
        };
        let mut samples = self.samples.lock().expect("metrics ring poisoned");
        if samples.len() >= MAX_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Drop samples past the retention window.
    pub fn prune(&self) {
        let cutoff = self.now_ms().saturating_sub(RETENTION_MS);
        let mut samples = self.samples.lock().expect("metrics ring poisoned");
        while samples.front().map(|s| s.timestamp_ms < cutoff).unwrap_or(false) {
            samples.pop_front();
        }
    }

    /// Stats over the trailing `window_secs`.
    pub fn window(&self, window_secs: u64) -> WindowStats {
        let now = self.now_ms();
        let cutoff = now.saturating_sub(window_secs * 1000);
        let samples = self.samples.lock().expect("metrics ring poisoned");
        let selected: Vec<LinkSample> = samples
            .iter()
            .filter(|s| s.timestamp_ms >= cutoff)
            .copied()
            .collect();
        drop(samples);
        compute_window(window_secs, &selected)
    }

    /// Full report: all three windows, trends and the health score.
    pub fn report(&self) -> MetricsReport {
        let windows: Vec<WindowStats> = WINDOWS_SECS.iter().map(|&s| self.window(s)).collect();
        let trend = compute_trend(&windows[1], &windows[2]);
        let (health_score, health_label) = compute_health(&windows[0]);
        MetricsReport {
            windows,
            trend,
            health_score,
            health_label,
        }
    }

    /// Start the once-a-second pruning task.
    pub async fn start_pruning(self: &std::sync::Arc<Self>) {
        let mut slot = self.prune_task.write().await;
        if slot.is_some() {
            return;
        }
        let metrics = self.clone();
        *slot = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                metrics.prune();
            }
        }));
    }

    pub async fn stop_pruning(&self) {
        if let Some(task) = self.prune_task.write().await.take() {
            task.abort();
            debug!("metrics pruning task stopped");
        }
    }
}

impl Default for LinkMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn compute_window(window_secs: u64, samples: &[LinkSample]) -> WindowStats {
    if samples.is_empty() {
        return WindowStats {
            window_secs,
            ..WindowStats::default()
        };
    }
    let count = samples.len() as u64;
    let success_count = samples.iter().filter(|s| s.success).count() as u64;
    let mut latencies: Vec<u64> = samples.iter().map(|s| s.latency_ms).collect();
    latencies.sort_unstable();
    let total_latency: u64 = latencies.iter().sum();
    let total_bytes: u64 = samples.iter().map(|s| s.bytes).sum();

    let rssi_values: Vec<f64> = samples.iter().filter_map(|s| s.rssi.map(f64::from)).collect();
    let mtu_values: Vec<f64> = samples.iter().filter_map(|s| s.mtu.map(f64::from)).collect();

    WindowStats {
        window_secs,
        count,
        success_count,
        success_rate: success_count as f64 / count as f64 * 100.0,
        min_latency_ms: latencies[0],
        avg_latency_ms: total_latency as f64 / count as f64,
        max_latency_ms: *latencies.last().expect("non-empty"),
        p95_latency_ms: percentile(&latencies, 95.0),
        p99_latency_ms: percentile(&latencies, 99.0),
        throughput_bps: total_bytes as f64 / window_secs.max(1) as f64,
        avg_rssi: (!rssi_values.is_empty())
            .then(|| rssi_values.iter().sum::<f64>() / rssi_values.len() as f64),
        avg_mtu: (!mtu_values.is_empty())
            .then(|| mtu_values.iter().sum::<f64>() / mtu_values.len() as f64),
    }
}

/// A metric moves when it differs by more than 10% between windows.
const TREND_THRESHOLD: f64 = 0.10;

fn trend_of(recent: f64, older: f64, higher_is_better: bool) -> Trend {
    if older == 0.0 {
        return Trend::Stable;
    }
    let change = (recent - older) / older;
    if change.abs() < TREND_THRESHOLD {
        Trend::Stable
    } else if (change > 0.0) == higher_is_better {
        Trend::Improving
    } else {
        Trend::Degrading
    }
}

fn compute_trend(five_min: &WindowStats, fifteen_min: &WindowStats) -> TrendReport {
    TrendReport {
        latency: trend_of(five_min.avg_latency_ms, fifteen_min.avg_latency_ms, false),
        throughput: trend_of(five_min.throughput_bps, fifteen_min.throughput_bps, true),
        signal: trend_of(
            five_min.avg_rssi.unwrap_or(0.0).abs(),
            fifteen_min.avg_rssi.unwrap_or(0.0).abs(),
            // RSSI is negative dBm: a smaller magnitude is a better signal.
            false,
        ),
        success_rate: trend_of(five_min.success_rate, fifteen_min.success_rate, true),
    }
}

fn compute_health(minute: &WindowStats) -> (u32, HealthLabel) {
    let mut score: i32 = 100;
    if minute.count > 0 {
        if minute.avg_latency_ms > 500.0 {
            score -= 25;
        } else if minute.avg_latency_ms > 200.0 {
            score -= 10;
        }
        if minute.success_rate < 80.0 {
            score -= 40;
        } else if minute.success_rate < 95.0 {
            score -= 25;
        } else if minute.success_rate < 99.0 {
            score -= 10;
        }
        if let Some(rssi) = minute.avg_rssi {
            if rssi < -80.0 {
                score -= 20;
            } else if rssi < -70.0 {
                score -= 10;
            }
        }
    }
    let score = score.clamp(0, 100) as u32;
    (score, HealthLabel::from_score(score))
}
