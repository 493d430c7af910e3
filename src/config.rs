// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Every tunable of the engine lives here, grouped by subsystem. All fields
// carry serde defaults so a config file written by an older build still
// loads. Persistence uses the tmp + rename pattern to prevent corruption on
// crash.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::alerts::{AlertRule, ChannelConfig, Severity};
use crate::circuit::CircuitConfig;
use crate::pool::PoolConfig;
use crate::retry::{Backoff, RetryPolicy};
use crate::types::ScrapeTarget;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_max_pages() -> u32 {
    5
}

fn default_max_concurrent_jobs() -> usize {
    3
}

fn default_requests_per_second() -> f64 {
    2.0
}

fn default_burst() -> u32 {
    5
}

fn default_result_dir() -> PathBuf {
    PathBuf::from("data/results")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/cache")
}

fn default_cache_max_age_hours() -> u64 {
    6
}

fn default_cache_sweep_interval_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("data/checkpoint.json")
}

fn default_early_stop_threshold() -> f64 {
    crate::incremental::EARLY_STOP_THRESHOLD
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_retry_backoff() -> Backoff {
    Backoff::Exponential
}

fn default_retry_jitter() -> f64 {
    0.1
}

fn default_retry_attempt_timeout_secs() -> u64 {
    30
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_metrics_export_dir() -> PathBuf {
    PathBuf::from("data/metrics")
}

fn default_metrics_export_interval_secs() -> u64 {
    60
}

// =============================================================================
// Sections
// =============================================================================

/// Pagination, concurrency, and pacing of the scrape itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapingConfig {
    /// Listing URLs to scrape, each with an optional per-URL page cap.
    #[serde(default)]
    pub targets: Vec<ScrapeTarget>,

    /// Global page cap per target URL.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Jobs processed concurrently within one page.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Outbound fetch pacing (token bucket refill rate).
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,

    /// Token bucket burst capacity.
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Directory receiving one result file per run.
    #[serde(default = "default_result_dir")]
    pub result_dir: PathBuf,
}

impl Default for ScrapingConfig {
    fn default() -> Self {
        Self {
            targets: Vec::new(),
            max_pages: default_max_pages(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            result_dir: default_result_dir(),
        }
    }
}

/// Compressed page cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Entries older than this are expired.
    #[serde(default = "default_cache_max_age_hours")]
    pub max_age_hours: u64,

    /// Cadence of the periodic disk sweep.
    #[serde(default = "default_cache_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            max_age_hours: default_cache_max_age_hours(),
            sweep_interval_secs: default_cache_sweep_interval_secs(),
        }
    }
}

/// Incremental processing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_checkpoint_path")]
    pub checkpoint_path: PathBuf,

    /// Pagination stops when the unseen share of a page drops below this.
    #[serde(default = "default_early_stop_threshold")]
    pub early_stop_threshold: f64,
}

impl Default for IncrementalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            checkpoint_path: default_checkpoint_path(),
            early_stop_threshold: default_early_stop_threshold(),
        }
    }
}

/// Retry policy expressed in plain config units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_retry_backoff")]
    pub backoff: Backoff,

    #[serde(default = "default_retry_jitter")]
    pub jitter: f64,

    #[serde(default = "default_retry_attempt_timeout_secs")]
    pub per_attempt_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            max_delay_ms: default_retry_max_delay_ms(),
            backoff: default_retry_backoff(),
            jitter: default_retry_jitter(),
            per_attempt_timeout_secs: default_retry_attempt_timeout_secs(),
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff: self.backoff,
            jitter: self.jitter,
            per_attempt_timeout: Some(Duration::from_secs(self.per_attempt_timeout_secs)),
            retryable: crate::errors::ScrapeError::is_transient,
        }
    }
}

/// Alerting: channels, extra rules, and resolution policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Notification channels; defaults to console (medium+) and a JSON-lines
    /// alert log (all severities).
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,

    /// Rules added on top of the engine's default set.
    #[serde(default)]
    pub rules: Vec<AlertRule>,

    /// Whether the 24-hour auto-resolve also covers acknowledged alerts.
    #[serde(default)]
    pub auto_resolve_acknowledged: bool,
}

fn default_channels() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig::console(Severity::Medium),
        ChannelConfig::file("data/alerts/alerts.log", Severity::Low),
    ]
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            rules: Vec::new(),
            auto_resolve_acknowledged: false,
        }
    }
}

/// Structured logger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
        }
    }
}

/// Metrics export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Periodically write JSON summaries when enabled.
    #[serde(default)]
    pub auto_export: bool,

    #[serde(default = "default_metrics_export_dir")]
    pub export_dir: PathBuf,

    #[serde(default = "default_metrics_export_interval_secs")]
    pub export_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            auto_export: false,
            export_dir: default_metrics_export_dir(),
            export_interval_secs: default_metrics_export_interval_secs(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level engine configuration.
///
/// Every field has a serde default so older JSON files missing new sections
/// still deserialize correctly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub scraping: ScrapingConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub incremental: IncrementalConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Per-name circuit overrides; unnamed circuits use built-in presets.
    #[serde(default)]
    pub circuits: HashMap<String, CircuitConfig>,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            targets = config.scraping.targets.len(),
            max_pages = config.scraping.max_pages,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialize config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// The circuit config for `name`: the per-name override when present,
    /// otherwise the built-in preset for known names, otherwise defaults.
    pub fn circuit_config(&self, name: &str) -> CircuitConfig {
        if let Some(config) = self.circuits.get(name) {
            return config.clone();
        }
        match name {
            "scraping" => CircuitConfig::scraping(),
            "network" => CircuitConfig::network(),
            "database" => CircuitConfig::database(),
            _ => CircuitConfig::default(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.scraping.max_pages, 5);
        assert_eq!(cfg.scraping.max_concurrent_jobs, 3);
        assert!((cfg.scraping.requests_per_second - 2.0).abs() < f64::EPSILON);
        assert_eq!(cfg.cache.max_age_hours, 6);
        assert!(cfg.incremental.enabled);
        assert!((cfg.incremental.early_stop_threshold - 0.3).abs() < f64::EPSILON);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retry.backoff, Backoff::Exponential);
        assert_eq!(cfg.pool.min_size, 2);
        assert_eq!(cfg.pool.max_size, 8);
        assert_eq!(cfg.alerts.channels.len(), 2);
        assert!(!cfg.alerts.auto_resolve_acknowledged);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.scraping.max_pages, 5);
        assert_eq!(cfg.pool.max_reuse, 50);
        assert!(!cfg.metrics.auto_export);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{
            "scraping": {
                "targets": [{"url": "https://example.com/vagas/home-office/"}],
                "max_pages": 2
            },
            "circuits": {
                "scraping": {"failure_threshold": 3, "recovery_timeout_secs": 2.0}
            }
        }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.scraping.targets.len(), 1);
        assert_eq!(cfg.scraping.max_pages, 2);
        assert_eq!(cfg.scraping.max_concurrent_jobs, 3);

        let circuit = cfg.circuit_config("scraping");
        assert_eq!(circuit.failure_threshold, 3);
        assert!((circuit.recovery_timeout_secs - 2.0).abs() < f64::EPSILON);
        // Fields absent from the override come from serde defaults.
        assert_eq!(circuit.sliding_window_size, 100);
    }

    #[test]
    fn circuit_presets_apply_without_override() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.circuit_config("scraping").failure_threshold, 3);
        assert_eq!(cfg.circuit_config("network").failure_threshold, 5);
        assert_eq!(cfg.circuit_config("database").failure_threshold, 2);
        assert_eq!(cfg.circuit_config("anything").failure_threshold, 5);
    }

    #[test]
    fn roundtrip_serialization() {
        let mut cfg = RuntimeConfig::default();
        cfg.scraping.targets.push(ScrapeTarget::new("https://example.com/vagas/"));
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg2.scraping.targets.len(), 1);
        assert_eq!(cfg2.scraping.max_pages, cfg.scraping.max_pages);
        assert_eq!(cfg2.retry.backoff, cfg.retry.backoff);
    }

    #[test]
    fn save_and_load_are_symmetric() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.scraping.max_pages = 9;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.scraping.max_pages, 9);
        // No tmp residue after the atomic rename.
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn retry_config_converts_to_policy() {
        let cfg = RetryConfig::default();
        let policy = cfg.to_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(1000));
        assert_eq!(policy.per_attempt_timeout, Some(Duration::from_secs(30)));
    }
}
