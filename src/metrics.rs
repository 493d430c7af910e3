// =============================================================================
// Metrics Registry — counters, gauges, timers, histograms with summaries
// =============================================================================
//
// Each metric owns a ring buffer of timestamped observations behind its own
// mutex; counters are additionally backed by an AtomicU64 so increments are
// true atomic fetch-adds (no read-then-write window).
//
// Every write is forwarded to the bound alert engine so threshold rules are
// evaluated inline. The binding is a Weak reference installed once by the
// composition root; the engine itself records notification metrics through
// a strong Arc to this registry, and the Weak direction keeps that pair
// from becoming an Arc cycle.
// =============================================================================

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{Context as _, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::debug;

use crate::alerts::AlertEngine;

/// Observations retained per metric.
const MAX_HISTORY: usize = 1000;

// =============================================================================
// Metric model
// =============================================================================

/// Kind of a metric series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Timer,
    Histogram,
}

/// One observation in a metric's ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct Observation {
    pub value: f64,
    /// Seconds since the UNIX epoch.
    pub timestamp: f64,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

/// Statistical summary of a metric over an optional time window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub median: f64,
    pub stddev: f64,
    pub p95: f64,
    pub p99: f64,
    pub rate_per_second: f64,
    pub last_value: f64,
    pub last_update: f64,
}

struct Collector {
    kind: MetricKind,
    values: Mutex<VecDeque<Observation>>,
    /// Monotone total for counters; unused for other kinds.
    total: AtomicU64,
}

impl Collector {
    fn new(kind: MetricKind) -> Self {
        Self {
            kind,
            values: Mutex::new(VecDeque::with_capacity(64)),
            total: AtomicU64::new(0),
        }
    }

    fn record(&self, value: f64, labels: HashMap<String, String>) {
        let mut values = self.values.lock();
        if values.len() == MAX_HISTORY {
            values.pop_front();
        }
        values.push_back(Observation {
            value,
            timestamp: now_secs(),
            labels,
        });
    }

    fn summary(&self, since: Option<f64>) -> MetricSummary {
        let values = self.values.lock();
        let window: Vec<&Observation> = match since {
            Some(since) => values.iter().filter(|o| o.timestamp >= since).collect(),
            None => values.iter().collect(),
        };

        if window.is_empty() {
            return MetricSummary::default();
        }

        let mut nums: Vec<f64> = window.iter().map(|o| o.value).collect();
        nums.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let count = nums.len();
        let sum: f64 = nums.iter().sum();
        let mean = sum / count as f64;
        let variance = nums.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;

        let median = if count % 2 == 1 {
            nums[count / 2]
        } else {
            (nums[count / 2 - 1] + nums[count / 2]) / 2.0
        };

        let span = window.last().map(|o| o.timestamp).unwrap_or(0.0)
            - window.first().map(|o| o.timestamp).unwrap_or(0.0);
        let rate = if span > 0.0 {
            count as f64 / span
        } else {
            0.0
        };

        MetricSummary {
            count,
            min: nums[0],
            max: nums[count - 1],
            mean,
            median,
            stddev: variance.sqrt(),
            p95: percentile(&nums, 0.95),
            p99: percentile(&nums, 0.99),
            rate_per_second: rate,
            last_value: window.last().map(|o| o.value).unwrap_or(0.0),
            last_update: window.last().map(|o| o.timestamp).unwrap_or(0.0),
        }
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64) * p) as usize;
    sorted[index.min(sorted.len() - 1)]
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// =============================================================================
// Registry
// =============================================================================

/// Central registry of all metric series.
pub struct MetricsRegistry {
    collectors: RwLock<HashMap<String, Arc<Collector>>>,
    alerts: RwLock<Option<Weak<AlertEngine>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Self {
            collectors: RwLock::new(HashMap::new()),
            alerts: RwLock::new(None),
        };

        // Pre-register the engine's standard series so dashboards and
        // exports show them even before first use.
        for (name, kind) in SYSTEM_METRICS {
            registry.register(name, *kind);
        }
        registry
    }

    /// Install the alert engine that rule-checks every write. Called once by
    /// the composition root; a Weak reference avoids an Arc cycle with the
    /// engine's own handle to this registry.
    pub fn bind_alerts(&self, engine: Weak<AlertEngine>) {
        *self.alerts.write() = Some(engine);
    }

    /// Register `name` with an explicit kind; returns the existing collector
    /// unchanged when already present.
    pub fn register(&self, name: &str, kind: MetricKind) {
        let mut collectors = self.collectors.write();
        collectors
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Collector::new(kind)));
    }

    fn collector(&self, name: &str, default_kind: MetricKind) -> Arc<Collector> {
        if let Some(existing) = self.collectors.read().get(name) {
            return existing.clone();
        }
        let mut collectors = self.collectors.write();
        collectors
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Collector::new(default_kind)))
            .clone()
    }

    /// Record a raw observation (auto-registers unknown names as gauges).
    pub fn record(&self, name: &str, value: f64, labels: Option<HashMap<String, String>>) {
        self.collector(name, MetricKind::Gauge)
            .record(value, labels.unwrap_or_default());
        self.check_alerts(name, value);
    }

    /// Atomically add `delta` to a counter and record the new total.
    pub fn increment_counter(&self, name: &str, delta: u64) {
        let collector = self.collector(name, MetricKind::Counter);
        let new_total = collector.total.fetch_add(delta, Ordering::Relaxed) + delta;
        collector.record(new_total as f64, HashMap::new());
        self.check_alerts(name, new_total as f64);
    }

    /// Current monotone total of a counter (zero if never incremented).
    pub fn counter_value(&self, name: &str) -> u64 {
        self.collectors
            .read()
            .get(name)
            .map(|c| c.total.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Replace a gauge's value.
    pub fn set_gauge(&self, name: &str, value: f64) {
        self.collector(name, MetricKind::Gauge)
            .record(value, HashMap::new());
        self.check_alerts(name, value);
    }

    /// Last recorded gauge value.
    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        let collector = self.collectors.read().get(name)?.clone();
        let values = collector.values.lock();
        values.back().map(|o| o.value)
    }

    /// Record an execution duration in seconds.
    pub fn record_timer(&self, name: &str, seconds: f64) {
        self.collector(name, MetricKind::Timer)
            .record(seconds, HashMap::new());
        self.check_alerts(name, seconds);
    }

    fn check_alerts(&self, name: &str, value: f64) {
        let engine = match self.alerts.read().as_ref().and_then(Weak::upgrade) {
            Some(engine) => engine,
            None => return,
        };
        engine.observe_metric(name, value);
    }

    /// Summary of one metric over an optional lookback window in seconds.
    pub fn summary(&self, name: &str, window_secs: Option<f64>) -> Option<MetricSummary> {
        let collector = self.collectors.read().get(name)?.clone();
        let since = window_secs.map(|w| now_secs() - w);
        Some(collector.summary(since))
    }

    /// Summaries of every registered metric.
    pub fn all_summaries(&self, window_secs: Option<f64>) -> HashMap<String, MetricSummary> {
        let since = window_secs.map(|w| now_secs() - w);
        let collectors = self.collectors.read();
        collectors
            .iter()
            .map(|(name, c)| (name.clone(), c.summary(since)))
            .collect()
    }

    /// Write a JSON snapshot of all summaries into `export_dir`. Returns the
    /// path of the file written.
    pub fn export_json(&self, export_dir: &std::path::Path) -> Result<PathBuf> {
        std::fs::create_dir_all(export_dir).with_context(|| {
            format!(
                "failed to create metrics export dir {}",
                export_dir.display()
            )
        })?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let path = export_dir.join(format!("metrics_{stamp}.json"));

        let payload = serde_json::json!({
            "exported_at": Utc::now().to_rfc3339(),
            "summaries": self.all_summaries(None),
        });

        std::fs::write(&path, serde_json::to_vec_pretty(&payload)?)
            .with_context(|| format!("failed to write metrics export {}", path.display()))?;

        debug!(path = %path.display(), "metrics exported");
        Ok(path)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Standard series recorded by the engine's subsystems.
const SYSTEM_METRICS: &[(&str, MetricKind)] = &[
    ("scraper.pages_processed", MetricKind::Counter),
    ("scraper.pages_failed", MetricKind::Counter),
    ("scraper.jobs_found", MetricKind::Counter),
    ("scraper.jobs_processed", MetricKind::Counter),
    ("scraper.page_processing_time", MetricKind::Timer),
    ("scraper.success_rate", MetricKind::Gauge),
    ("scraper.error_rate", MetricKind::Gauge),
    ("scraper.time_saved_seconds", MetricKind::Gauge),
    ("retry.total_operations", MetricKind::Counter),
    ("retry.failed_operations", MetricKind::Counter),
    ("retry.retry_count", MetricKind::Counter),
    ("retry.success_after_retry", MetricKind::Counter),
    ("circuit_breaker.opens", MetricKind::Counter),
    ("circuit_breaker.closes", MetricKind::Counter),
    ("circuit_breaker.rejections", MetricKind::Counter),
    ("circuit_breaker.current_state", MetricKind::Gauge),
    ("validation.jobs_validated", MetricKind::Counter),
    ("validation.quality_score", MetricKind::Gauge),
    ("cache.hits", MetricKind::Counter),
    ("cache.misses", MetricKind::Counter),
    ("cache.hit_rate", MetricKind::Gauge),
    ("fallback.selector_attempts", MetricKind::Counter),
    ("fallback.selector_successes", MetricKind::Counter),
    ("fallback.fallback_level", MetricKind::Histogram),
    ("dedup.input", MetricKind::Counter),
    ("dedup.output", MetricKind::Counter),
    ("pool.idle", MetricKind::Gauge),
    ("pool.leased", MetricKind::Gauge),
    ("pool.created", MetricKind::Counter),
    ("pool.retired", MetricKind::Counter),
    ("pool.timeouts", MetricKind::Counter),
];

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_atomically() {
        let registry = MetricsRegistry::new();
        registry.increment_counter("scraper.pages_processed", 1);
        registry.increment_counter("scraper.pages_processed", 2);
        assert_eq!(registry.counter_value("scraper.pages_processed"), 3);

        let summary = registry.summary("scraper.pages_processed", None).unwrap();
        assert_eq!(summary.last_value, 3.0);
        assert_eq!(summary.count, 2);
    }

    #[test]
    fn counters_are_safe_under_contention() {
        let registry = Arc::new(MetricsRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    registry.increment_counter("retry.retry_count", 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.counter_value("retry.retry_count"), 4000);
    }

    #[test]
    fn gauges_replace() {
        let registry = MetricsRegistry::new();
        registry.set_gauge("scraper.error_rate", 10.0);
        registry.set_gauge("scraper.error_rate", 35.0);
        assert_eq!(registry.gauge_value("scraper.error_rate"), Some(35.0));
    }

    #[test]
    fn summary_statistics() {
        let registry = MetricsRegistry::new();
        for v in [1.0, 2.0, 3.0, 4.0, 5.0] {
            registry.record_timer("scraper.page_processing_time", v);
        }

        let summary = registry
            .summary("scraper.page_processing_time", None)
            .unwrap();
        assert_eq!(summary.count, 5);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 5.0);
        assert_eq!(summary.mean, 3.0);
        assert_eq!(summary.median, 3.0);
        assert!((summary.stddev - 1.4142).abs() < 0.001);
        assert_eq!(summary.p95, 5.0);
    }

    #[test]
    fn ring_buffer_is_bounded() {
        let registry = MetricsRegistry::new();
        for i in 0..(MAX_HISTORY + 100) {
            registry.record("fallback.fallback_level", i as f64, None);
        }
        let summary = registry.summary("fallback.fallback_level", None).unwrap();
        assert_eq!(summary.count, MAX_HISTORY);
        // Oldest observations were evicted.
        assert_eq!(summary.min, 100.0);
    }

    #[test]
    fn unknown_metric_has_no_summary() {
        let registry = MetricsRegistry::new();
        assert!(registry.summary("does.not.exist", None).is_none());
    }

    #[test]
    fn export_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let registry = MetricsRegistry::new();
        registry.increment_counter("cache.hits", 7);

        let path = registry.export_json(dir.path()).unwrap();
        let content: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(content["summaries"]["cache.hits"]["last_value"], 7.0);
    }
}
