// =============================================================================
// Circuit Breaker — per-resource CLOSED / OPEN / HALF_OPEN state machines
// =============================================================================
//
// A circuit opens when consecutive failures hit the threshold, or when the
// sliding window holds enough samples and its error rate crosses the
// percentage threshold. While open, every call is rejected without
// executing. After the recovery timeout a call is let through in half-open;
// `success_threshold` consecutive successes close the circuit, any failure
// reopens it.
//
// Transitions are recorded under the per-circuit lock together with the
// outcome that caused them; the lock is never held across the guarded
// operation itself.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::alerts::AlertEngine;
use crate::errors::{ScrapeError, ScrapeResult};
use crate::metrics::MetricsRegistry;

// =============================================================================
// Configuration
// =============================================================================

/// Tunables of one circuit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds in OPEN before a half-open probe is allowed.
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: f64,
    /// Consecutive half-open successes that close the circuit.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Minimum window samples before the error rate is considered.
    #[serde(default = "default_request_volume_threshold")]
    pub request_volume_threshold: usize,
    /// Window error percentage (0-100) that opens the circuit.
    #[serde(default = "default_error_percentage_threshold")]
    pub error_percentage_threshold: f64,
    #[serde(default = "default_sliding_window_size")]
    pub sliding_window_size: usize,
    /// Deadline applied around each guarded operation.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: f64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> f64 {
    60.0
}

fn default_success_threshold() -> u32 {
    3
}

fn default_request_volume_threshold() -> usize {
    10
}

fn default_error_percentage_threshold() -> f64 {
    50.0
}

fn default_sliding_window_size() -> usize {
    100
}

fn default_operation_timeout_secs() -> f64 {
    30.0
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
            success_threshold: default_success_threshold(),
            request_volume_threshold: default_request_volume_threshold(),
            error_percentage_threshold: default_error_percentage_threshold(),
            sliding_window_size: default_sliding_window_size(),
            operation_timeout_secs: default_operation_timeout_secs(),
        }
    }
}

impl CircuitConfig {
    /// Preset guarding page fetches.
    pub fn scraping() -> Self {
        Self {
            failure_threshold: 3,
            recovery_timeout_secs: 30.0,
            success_threshold: 2,
            error_percentage_threshold: 60.0,
            operation_timeout_secs: 30.0,
            ..Self::default()
        }
    }

    /// Preset guarding plain network calls.
    pub fn network() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60.0,
            success_threshold: 3,
            error_percentage_threshold: 50.0,
            operation_timeout_secs: 15.0,
            ..Self::default()
        }
    }

    /// Preset guarding storage backends.
    pub fn database() -> Self {
        Self {
            failure_threshold: 2,
            recovery_timeout_secs: 120.0,
            success_threshold: 5,
            error_percentage_threshold: 40.0,
            operation_timeout_secs: 10.0,
            ..Self::default()
        }
    }

    fn recovery_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.recovery_timeout_secs)
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.operation_timeout_secs)
    }
}

// =============================================================================
// State
// =============================================================================

/// Circuit position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    /// Outcomes of the last W guarded operations (true = success).
    window: VecDeque<bool>,
    rejected: u64,
    opens: u64,
    closes: u64,
}

impl Inner {
    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }
}

/// Serializable view of a circuit for dashboards and the session summary.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Window error rate as a percentage.
    pub error_rate: f64,
    pub rejected: u64,
    pub opens: u64,
    pub closes: u64,
    /// Seconds until a half-open probe is allowed; zero unless open.
    pub time_until_retry: f64,
}

/// One named circuit.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
    metrics: Arc<MetricsRegistry>,
    alerts: Arc<AlertEngine>,
}

impl CircuitBreaker {
    fn new(
        name: String,
        config: CircuitConfig,
        metrics: Arc<MetricsRegistry>,
        alerts: Arc<AlertEngine>,
    ) -> Self {
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                window: VecDeque::new(),
                rejected: 0,
                opens: 0,
                closes: 0,
            }),
            metrics,
            alerts,
        }
    }

    /// Run `op` through the circuit. Rejected immediately with
    /// `CircuitOpenError` while open; a timeout of the guarded operation
    /// counts as a failure.
    pub async fn call<F, Fut, T>(&self, op: F) -> ScrapeResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ScrapeResult<T>>,
    {
        // Pre-flight under the lock: maybe move OPEN -> HALF_OPEN, or reject.
        {
            let mut inner = self.inner.lock();

            if inner.state == CircuitState::Open {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.recovery_timeout() {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    info!(circuit = %self.name, "circuit half-open; probing recovery");
                } else {
                    inner.rejected += 1;
                    self.metrics
                        .increment_counter("circuit_breaker.rejections", 1);
                    let retry_in =
                        (self.config.recovery_timeout() - elapsed).as_secs_f64();
                    return Err(ScrapeError::CircuitOpen {
                        name: self.name.clone(),
                        retry_in,
                    });
                }
            }
        }

        let result = tokio::time::timeout(self.config.operation_timeout(), op()).await;
        let result = match result {
            Ok(result) => result,
            Err(_) => Err(ScrapeError::Timeout(self.config.operation_timeout())),
        };

        // Outcome and any transition it causes are recorded atomically.
        match result {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure();
                Err(error)
            }
        }
    }

    fn push_outcome(inner: &mut Inner, window_size: usize, success: bool) {
        if inner.window.len() == window_size {
            inner.window.pop_front();
        }
        inner.window.push_back(success);
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        Self::push_outcome(&mut inner, self.config.sliding_window_size, true);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                    inner.closes += 1;
                    drop(inner);

                    self.metrics.increment_counter("circuit_breaker.closes", 1);
                    self.metrics.set_gauge("circuit_breaker.current_state", 0.0);
                    info!(circuit = %self.name, "circuit closed; resource recovered");
                }
            }
            CircuitState::Open => {
                // Unreachable through call(); kept as a no-op for safety.
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        Self::push_outcome(&mut inner, self.config.sliding_window_size, false);

        let should_open = match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                inner.consecutive_failures >= self.config.failure_threshold
                    || (inner.window.len() >= self.config.request_volume_threshold
                        && inner.error_rate() * 100.0 >= self.config.error_percentage_threshold)
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if !should_open {
            return;
        }

        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_successes = 0;
        inner.opens += 1;
        let failures = inner.consecutive_failures;
        let error_rate = inner.error_rate() * 100.0;
        drop(inner);

        self.metrics.increment_counter("circuit_breaker.opens", 1);
        self.metrics.set_gauge("circuit_breaker.current_state", 1.0);
        warn!(
            circuit = %self.name,
            failures,
            error_rate,
            recovery_timeout_secs = self.config.recovery_timeout_secs,
            "circuit opened"
        );

        self.alerts.trigger(
            "circuit_breaker_open",
            &format!("circuit '{}' opened", self.name),
            &format!("{failures} consecutive failures against '{}'", self.name),
            json!({
                "circuit": self.name,
                "consecutive_failures": failures,
                "error_rate_pct": error_rate,
                "recovery_timeout_secs": self.config.recovery_timeout_secs,
            }),
        );
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.inner.lock();
        let time_until_retry = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) => {
                (self.config.recovery_timeout().saturating_sub(at.elapsed())).as_secs_f64()
            }
            _ => 0.0,
        };
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            error_rate: inner.error_rate() * 100.0,
            rejected: inner.rejected,
            opens: inner.opens,
            closes: inner.closes,
            time_until_retry,
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Registry of named circuits. `get` never replaces an existing circuit, so
/// a config passed for an already-known name is ignored.
pub struct CircuitBreakerManager {
    circuits: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    metrics: Arc<MetricsRegistry>,
    alerts: Arc<AlertEngine>,
}

impl CircuitBreakerManager {
    pub fn new(metrics: Arc<MetricsRegistry>, alerts: Arc<AlertEngine>) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            metrics,
            alerts,
        }
    }

    /// Fetch or create the circuit named `name`.
    pub fn get(&self, name: &str, config: CircuitConfig) -> Arc<CircuitBreaker> {
        let mut circuits = self.circuits.lock();
        circuits
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(circuit = name, "circuit created");
                Arc::new(CircuitBreaker::new(
                    name.to_string(),
                    config,
                    self.metrics.clone(),
                    self.alerts.clone(),
                ))
            })
            .clone()
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let circuits = self.circuits.lock();
        circuits.values().map(|c| c.snapshot()).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::StructuredLogger;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn harness(dir: &std::path::Path) -> (CircuitBreakerManager, Arc<MetricsRegistry>, Arc<AlertEngine>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let logger = Arc::new(StructuredLogger::new(dir.join("logs")).unwrap());
        let alerts = Arc::new(AlertEngine::new(&[], metrics.clone(), logger, false));
        alerts.add_default_rules();
        (
            CircuitBreakerManager::new(metrics.clone(), alerts.clone()),
            metrics,
            alerts,
        )
    }

    fn fast_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            recovery_timeout_secs: 0.2,
            success_threshold: 2,
            operation_timeout_secs: 5.0,
            ..CircuitConfig::default()
        }
    }

    async fn fail(circuit: &CircuitBreaker) {
        let result: ScrapeResult<()> = circuit
            .call(|| async { Err(ScrapeError::Network("down".into())) })
            .await;
        assert!(result.is_err());
    }

    async fn succeed(circuit: &CircuitBreaker) {
        circuit
            .call(|| async { Ok::<_, ScrapeError>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = harness(dir.path());
        let circuit = manager.get("scraping", fast_config());

        fail(&circuit).await;
        fail(&circuit).await;
        succeed(&circuit).await;
        fail(&circuit).await;
        fail(&circuit).await;

        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, metrics, alerts) = harness(dir.path());
        let circuit = manager.get("scraping", fast_config());

        for _ in 0..3 {
            fail(&circuit).await;
        }
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(metrics.counter_value("circuit_breaker.opens"), 1);

        // While open, the operation must never execute.
        let executed = AtomicU32::new(0);
        let result: ScrapeResult<()> = circuit
            .call(|| {
                executed.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(ScrapeError::CircuitOpen { .. })));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.counter_value("circuit_breaker.rejections"), 1);

        // The open transition raised the configured alert.
        let active = alerts.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_name, "circuit_breaker_open");
    }

    #[tokio::test]
    async fn recovers_through_half_open() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, metrics, _) = harness(dir.path());
        let circuit = manager.get("scraping", fast_config());

        for _ in 0..3 {
            fail(&circuit).await;
        }
        assert_eq!(circuit.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(250)).await;

        // First probe enters half-open; two successes close the circuit.
        succeed(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        succeed(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Closed);

        assert_eq!(metrics.counter_value("circuit_breaker.opens"), 1);
        assert_eq!(metrics.counter_value("circuit_breaker.closes"), 1);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = harness(dir.path());
        let circuit = manager.get("scraping", fast_config());

        for _ in 0..3 {
            fail(&circuit).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        fail(&circuit).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        // The reopen resets the recovery clock: immediate calls are rejected.
        let result: ScrapeResult<()> = circuit.call(|| async { Ok(()) }).await;
        assert!(matches!(result, Err(ScrapeError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn error_rate_opens_with_enough_volume() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = harness(dir.path());
        let config = CircuitConfig {
            failure_threshold: 100, // out of reach; only the rate can open
            request_volume_threshold: 10,
            error_percentage_threshold: 50.0,
            recovery_timeout_secs: 60.0,
            ..CircuitConfig::default()
        };
        let circuit = manager.get("rate", config);

        // Alternate: 5 failures / 5 successes = 50% over 10 samples.
        for _ in 0..5 {
            succeed(&circuit).await;
            fail(&circuit).await;
        }
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn operation_timeout_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = harness(dir.path());
        let config = CircuitConfig {
            failure_threshold: 1,
            operation_timeout_secs: 0.05,
            ..fast_config()
        };
        let circuit = manager.get("slow", config);

        let result: ScrapeResult<()> = circuit
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ScrapeError::Timeout(_))));
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn manager_never_replaces_existing_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = harness(dir.path());

        let first = manager.get("scraping", fast_config());
        fail(&first).await;

        let again = manager.get("scraping", CircuitConfig::default());
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn snapshot_reports_retry_window() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _, _) = harness(dir.path());
        let circuit = manager.get("scraping", fast_config());

        for _ in 0..3 {
            fail(&circuit).await;
        }
        let snapshot = circuit.snapshot();
        assert_eq!(snapshot.state, CircuitState::Open);
        assert!(snapshot.time_until_retry > 0.0);
        assert_eq!(snapshot.opens, 1);
    }
}
