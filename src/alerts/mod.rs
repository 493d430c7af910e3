// =============================================================================
// Alert Engine — rule evaluation, active-alert lifecycle, notification fan-out
// =============================================================================
//
// The engine consumes metric writes (via `observe_metric`, wired by the
// composition root) and direct triggers (circuit breaker opens). It owns the
// active-alert table and a bounded history.
//
// Lifecycle of an alert id (hash of rule + title + description):
//   absent         -> inserted ACTIVE, trigger_count = 1, notified
//   re-trigger     -> trigger_count++, re-notified only after the cooldown
//   persisted past rule.escalation_after -> severity raised, re-notified
//   idle > 24 h    -> auto-resolved by the maintenance pass
//
// Notification delivery runs on a dispatcher task fed by an unbounded
// channel, so triggering never blocks on network I/O. The maintenance pass
// takes the table lock only for short scans and releases it before any
// notification is enqueued.
// =============================================================================

pub mod channels;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::identity::content_key;
use crate::logger::{Component, LogFields, StructuredLogger};
use crate::metrics::MetricsRegistry;

pub use channels::{ChannelConfig, ChannelKind, NotificationChannel};

/// Alerts retained in history before the oldest are purged.
const MAX_HISTORY: usize = 10_000;
/// Idle period after which an alert is auto-resolved.
const STALE_AFTER_SECS: i64 = 24 * 3600;
/// Cadence of the background maintenance pass.
const MAINTENANCE_INTERVAL_SECS: u64 = 60;

// =============================================================================
// Severity / status / rules
// =============================================================================

/// Alert severity, ordered low to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Threshold comparison applied to a metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Comparator {
    Gt,
    Lt,
    Eq,
}

impl Comparator {
    fn matches(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Lt => value < threshold,
            Self::Eq => (value - threshold).abs() < 1e-3,
        }
    }
}

/// Lifecycle state of an active alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Suppressed,
}

/// Definition of an alert rule. Pure configuration; runtime state (cooldown
/// bookkeeping) lives in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub description: String,
    /// Metric this rule watches; `None` for trigger-only rules (e.g. the
    /// circuit breaker raises them directly).
    #[serde(default)]
    pub metric_name: Option<String>,
    #[serde(default = "default_comparator")]
    pub comparator: Comparator,
    #[serde(default)]
    pub threshold: f64,
    pub severity: Severity,
    /// Channel kinds to notify; empty means every configured channel.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Escalate after this long in the active state.
    #[serde(default)]
    pub escalation_after_secs: Option<u64>,
    #[serde(default)]
    pub escalation_severity: Option<Severity>,
}

fn default_comparator() -> Comparator {
    Comparator::Gt
}

fn default_true() -> bool {
    true
}

fn default_cooldown_secs() -> u64 {
    15 * 60
}

/// One alert in the active table (or history).
#[derive(Debug, Clone, Serialize)]
pub struct ActiveAlert {
    pub id: String,
    pub rule_name: String,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub created_at: DateTime<Utc>,
    pub last_triggered: DateTime<Utc>,
    pub trigger_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub escalated: bool,
    pub context: Value,
}

/// Aggregate counts for the session summary.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertStats {
    pub active: usize,
    pub active_by_severity: HashMap<String, usize>,
    pub history: usize,
    pub rules: usize,
}

// =============================================================================
// Engine internals
// =============================================================================

struct RuleState {
    rule: AlertRule,
    /// Last time this rule produced a notification (cooldown anchor).
    last_triggered: Option<DateTime<Utc>>,
}

struct NotifyJob {
    alert: ActiveAlert,
    channels: Vec<String>,
}

/// Central alert engine. Constructed once by the orchestrator.
pub struct AlertEngine {
    rules: RwLock<HashMap<String, RuleState>>,
    active: Mutex<HashMap<String, ActiveAlert>>,
    history: Mutex<VecDeque<ActiveAlert>>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    notify_tx: mpsc::UnboundedSender<NotifyJob>,
    notify_rx: Mutex<Option<mpsc::UnboundedReceiver<NotifyJob>>>,
    metrics: Arc<MetricsRegistry>,
    logger: Arc<StructuredLogger>,
    /// Whether the 24-h auto-resolve also applies to acknowledged alerts.
    auto_resolve_acknowledged: bool,
}

impl AlertEngine {
    pub fn new(
        channel_configs: &[ChannelConfig],
        metrics: Arc<MetricsRegistry>,
        logger: Arc<StructuredLogger>,
        auto_resolve_acknowledged: bool,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Self {
            rules: RwLock::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(VecDeque::new()),
            channels: channels::build_channels(channel_configs),
            notify_tx,
            notify_rx: Mutex::new(Some(notify_rx)),
            metrics,
            logger,
            auto_resolve_acknowledged,
        }
    }

    // -------------------------------------------------------------------------
    // Rules
    // -------------------------------------------------------------------------

    /// Register a rule; replaces any rule with the same name.
    pub fn add_rule(&self, rule: AlertRule) {
        debug!(
            rule = %rule.name,
            severity = %rule.severity,
            cooldown_secs = rule.cooldown_secs,
            "alert rule registered"
        );
        self.rules.write().insert(
            rule.name.clone(),
            RuleState {
                rule,
                last_triggered: None,
            },
        );
    }

    /// Install the engine's standard rule set.
    pub fn add_default_rules(&self) {
        for rule in default_rules() {
            self.add_rule(rule);
        }
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Evaluate metric-bound rules against a fresh observation. Called by
    /// the metrics registry on every write.
    pub fn observe_metric(&self, metric_name: &str, value: f64) {
        let now = Utc::now();

        // Collect matching rule names first so the rule lock is not held
        // while triggering (trigger re-enters the rule table).
        let matching: Vec<String> = {
            let rules = self.rules.read();
            rules
                .values()
                .filter(|state| {
                    let rule = &state.rule;
                    rule.enabled
                        && rule.metric_name.as_deref() == Some(metric_name)
                        && !in_cooldown(state.last_triggered, rule.cooldown_secs, now)
                        && rule.comparator.matches(value, rule.threshold)
                })
                .map(|state| state.rule.name.clone())
                .collect()
        };

        for rule_name in matching {
            let (title, description) = {
                let rules = self.rules.read();
                let rule = &rules[&rule_name].rule;
                (
                    format!("{}: {} threshold crossed", rule.name, metric_name),
                    format!(
                        "{} (value {:.2}, threshold {:.2})",
                        rule.description, value, rule.threshold
                    ),
                )
            };
            self.trigger(
                &rule_name,
                &title,
                &description,
                json!({
                    "metric": metric_name,
                    "value": value,
                }),
            );
        }
    }

    /// Fire a rule directly. Returns the alert id when the rule exists and
    /// is enabled.
    pub fn trigger(
        &self,
        rule_name: &str,
        title: &str,
        description: &str,
        context: Value,
    ) -> Option<String> {
        let now = Utc::now();
        let alert_id = content_key(&format!("{rule_name}:{title}:{description}"));

        // Rule lookup + cooldown decision under the rule lock.
        let (severity, rule_channels, should_notify) = {
            let mut rules = self.rules.write();
            let state = match rules.get_mut(rule_name) {
                Some(state) => state,
                None => {
                    warn!(rule = rule_name, "trigger for unknown alert rule");
                    return None;
                }
            };
            if !state.rule.enabled {
                return None;
            }
            let notify = !in_cooldown(state.last_triggered, state.rule.cooldown_secs, now);
            if notify {
                state.last_triggered = Some(now);
            }
            (state.rule.severity, state.rule.channels.clone(), notify)
        };

        // Insert or re-trigger under the table lock.
        let snapshot = {
            let mut active = self.active.lock();
            let alert = active.entry(alert_id.clone()).or_insert_with(|| {
                let alert = ActiveAlert {
                    id: alert_id.clone(),
                    rule_name: rule_name.to_string(),
                    title: title.to_string(),
                    description: description.to_string(),
                    severity,
                    status: AlertStatus::Active,
                    created_at: now,
                    last_triggered: now,
                    trigger_count: 0,
                    acknowledged_by: None,
                    acknowledged_at: None,
                    resolved_at: None,
                    escalated: false,
                    context: context.clone(),
                };
                let mut history = self.history.lock();
                history.push_back(alert.clone());
                alert
            });
            alert.trigger_count += 1;
            alert.last_triggered = now;
            alert.clone()
        };

        self.metrics.increment_counter("alerts.triggered", 1);
        self.metrics
            .increment_counter(&format!("alerts.{}", snapshot.severity), 1);

        self.logger.log(
            severity_log_level(snapshot.severity),
            Component::Alerts,
            &format!("alert triggered: {title}"),
            LogFields::operation("trigger_alert").with_context(json!({
                "alert_id": snapshot.id,
                "rule": rule_name,
                "severity": snapshot.severity.to_string(),
                "trigger_count": snapshot.trigger_count,
            })),
        );

        if should_notify {
            self.enqueue_notification(snapshot, rule_channels);
        }

        Some(alert_id)
    }

    fn enqueue_notification(&self, alert: ActiveAlert, channels: Vec<String>) {
        // Send fails only when the dispatcher is gone (shutdown); drop then.
        let _ = self.notify_tx.send(NotifyJob { alert, channels });
    }

    // -------------------------------------------------------------------------
    // Resolution API
    // -------------------------------------------------------------------------

    /// Mark an alert ACKNOWLEDGED. Returns false for unknown ids.
    pub fn acknowledge(&self, alert_id: &str, actor: &str) -> bool {
        let mut active = self.active.lock();
        match active.get_mut(alert_id) {
            Some(alert) => {
                alert.status = AlertStatus::Acknowledged;
                alert.acknowledged_by = Some(actor.to_string());
                alert.acknowledged_at = Some(Utc::now());
                info!(alert_id, actor, "alert acknowledged");
                true
            }
            None => false,
        }
    }

    /// Remove an alert from the active set (kept in history). Returns false
    /// for unknown ids.
    pub fn resolve(&self, alert_id: &str) -> bool {
        let resolved = {
            let mut active = self.active.lock();
            active.remove(alert_id).map(|mut alert| {
                alert.status = AlertStatus::Resolved;
                alert.resolved_at = Some(Utc::now());
                alert
            })
        };

        match resolved {
            Some(alert) => {
                self.history.lock().push_back(alert);
                self.metrics.increment_counter("alerts.resolved", 1);
                info!(alert_id, "alert resolved");
                true
            }
            None => false,
        }
    }

    /// Snapshot of the active alerts, most recent first.
    pub fn active_alerts(&self) -> Vec<ActiveAlert> {
        let mut alerts: Vec<ActiveAlert> = self.active.lock().values().cloned().collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        alerts
    }

    pub fn stats(&self) -> AlertStats {
        let active = self.active.lock();
        let mut by_severity: HashMap<String, usize> = HashMap::new();
        for alert in active.values() {
            *by_severity.entry(alert.severity.to_string()).or_default() += 1;
        }
        AlertStats {
            active: active.len(),
            active_by_severity: by_severity,
            history: self.history.lock().len(),
            rules: self.rules.read().len(),
        }
    }

    // -------------------------------------------------------------------------
    // Background work
    // -------------------------------------------------------------------------

    /// One maintenance sweep: auto-resolve stale alerts, evaluate pending
    /// escalations, purge old history. The background loop calls this every
    /// 60 s; tests call it directly.
    pub fn maintenance_pass(&self) {
        let now = Utc::now();

        // Stale alerts. Collect ids under the lock, resolve after releasing
        // it (resolve takes the same lock).
        let stale: Vec<String> = {
            let active = self.active.lock();
            active
                .values()
                .filter(|alert| {
                    let eligible = alert.status == AlertStatus::Active
                        || (self.auto_resolve_acknowledged
                            && alert.status == AlertStatus::Acknowledged);
                    eligible
                        && (now - alert.last_triggered).num_seconds() >= STALE_AFTER_SECS
                })
                .map(|alert| alert.id.clone())
                .collect()
        };
        for alert_id in stale {
            if self.resolve(&alert_id) {
                info!(alert_id, "stale alert auto-resolved");
            }
        }

        // Escalations. Mutate under the lock, enqueue notifications after.
        let mut to_notify: Vec<(ActiveAlert, Vec<String>)> = Vec::new();
        {
            let rules = self.rules.read();
            let mut active = self.active.lock();
            for alert in active.values_mut() {
                if alert.escalated {
                    continue;
                }
                let rule = match rules.get(&alert.rule_name) {
                    Some(state) => &state.rule,
                    None => continue,
                };
                let after = match rule.escalation_after_secs {
                    Some(after) => after as i64,
                    None => continue,
                };
                if (now - alert.created_at).num_seconds() >= after {
                    if let Some(severity) = rule.escalation_severity {
                        alert.severity = severity;
                    }
                    alert.escalated = true;
                    to_notify.push((alert.clone(), rule.channels.clone()));
                }
            }
        }
        for (alert, channels) in to_notify {
            warn!(
                alert_id = %alert.id,
                severity = %alert.severity,
                "alert escalated"
            );
            self.metrics.increment_counter("alerts.escalated", 1);
            self.enqueue_notification(alert, channels);
        }

        // Bounded history.
        let mut history = self.history.lock();
        while history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    /// Background maintenance loop. Exits when the stop signal flips.
    pub async fn run_maintenance(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.maintenance_pass(),
                _ = stop.changed() => {
                    debug!("alert maintenance loop stopping");
                    return;
                }
            }
        }
    }

    /// Notification dispatcher loop. Owns the receive side of the queue;
    /// exits when the stop signal flips and the queue has drained.
    pub async fn run_dispatcher(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut rx = match self.notify_rx.lock().take() {
            Some(rx) => rx,
            None => {
                warn!("alert dispatcher started twice; second start ignored");
                return;
            }
        };

        loop {
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => self.fan_out(&job.alert, &job.channels).await,
                    None => return,
                },
                _ = stop.changed() => {
                    // Drain whatever is already queued, then exit.
                    while let Ok(job) = rx.try_recv() {
                        self.fan_out(&job.alert, &job.channels).await;
                    }
                    debug!("alert dispatcher stopping");
                    return;
                }
            }
        }
    }

    /// Deliver one alert to every eligible channel. A failing channel never
    /// aborts its siblings.
    async fn fan_out(&self, alert: &ActiveAlert, rule_channels: &[String]) {
        for channel in &self.channels {
            if !rule_channels.is_empty() && !rule_channels.iter().any(|c| c == channel.name()) {
                continue;
            }
            if !channel.enabled() {
                continue;
            }
            if alert.severity < channel.min_severity() {
                continue;
            }
            if !channel.rate_check() {
                self.logger.warn(
                    Component::Alerts,
                    &format!("rate limit exceeded for channel {}", channel.name()),
                    LogFields::default(),
                );
                continue;
            }

            let rendered = channels::render(alert, channel.template_name(alert.severity));
            match channel.send(alert, &rendered).await {
                Ok(()) => {
                    self.metrics
                        .increment_counter(&format!("notifications.{}.sent", channel.name()), 1);
                }
                Err(e) => {
                    self.metrics
                        .increment_counter(&format!("notifications.{}.failed", channel.name()), 1);
                    self.logger.error(
                        Component::Alerts,
                        &format!("notification via {} failed", channel.name()),
                        LogFields::default().with_error(e.to_string()),
                    );
                }
            }
        }
    }
}

fn in_cooldown(last: Option<DateTime<Utc>>, cooldown_secs: u64, now: DateTime<Utc>) -> bool {
    match last {
        Some(last) => (now - last).num_milliseconds() < (cooldown_secs as i64) * 1000,
        None => false,
    }
}

fn severity_log_level(severity: Severity) -> crate::logger::LogLevel {
    match severity {
        Severity::Low => crate::logger::LogLevel::Info,
        Severity::Medium => crate::logger::LogLevel::Warn,
        Severity::High | Severity::Critical => crate::logger::LogLevel::Error,
    }
}

/// The engine's standard rule set.
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule {
            name: "high_error_rate".into(),
            description: "scraper error rate above tolerance".into(),
            metric_name: Some("scraper.error_rate".into()),
            comparator: Comparator::Gt,
            threshold: 15.0,
            severity: Severity::High,
            channels: vec![],
            enabled: true,
            cooldown_secs: 30 * 60,
            escalation_after_secs: Some(120 * 60),
            escalation_severity: Some(Severity::Critical),
        },
        AlertRule {
            name: "low_success_rate".into(),
            description: "scraper success rate below tolerance".into(),
            metric_name: Some("scraper.success_rate".into()),
            comparator: Comparator::Lt,
            threshold: 80.0,
            severity: Severity::Medium,
            channels: vec![],
            enabled: true,
            cooldown_secs: 60 * 60,
            escalation_after_secs: None,
            escalation_severity: None,
        },
        AlertRule {
            name: "circuit_breaker_open".into(),
            description: "circuit breaker opened; source overloaded".into(),
            metric_name: None,
            comparator: Comparator::Gt,
            threshold: 0.0,
            severity: Severity::High,
            channels: vec![],
            enabled: true,
            cooldown_secs: 15 * 60,
            escalation_after_secs: None,
            escalation_severity: None,
        },
        AlertRule {
            name: "low_data_quality".into(),
            description: "extracted record quality degraded".into(),
            metric_name: Some("validation.quality_score".into()),
            comparator: Comparator::Lt,
            threshold: 70.0,
            severity: Severity::Medium,
            channels: vec![],
            enabled: true,
            cooldown_secs: 60 * 60,
            escalation_after_secs: None,
            escalation_severity: None,
        },
        AlertRule {
            name: "slow_processing".into(),
            description: "page processing time above tolerance".into(),
            metric_name: Some("scraper.page_processing_time".into()),
            comparator: Comparator::Gt,
            threshold: 10.0,
            severity: Severity::Medium,
            channels: vec![],
            enabled: true,
            cooldown_secs: 45 * 60,
            escalation_after_secs: None,
            escalation_severity: None,
        },
    ]
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine(dir: &std::path::Path) -> (Arc<AlertEngine>, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let logger = Arc::new(StructuredLogger::new(dir.join("logs")).unwrap());
        // No channels: delivery paths are covered in channels::tests.
        let engine = Arc::new(AlertEngine::new(&[], metrics.clone(), logger, false));
        metrics.bind_alerts(Arc::downgrade(&engine));
        (engine, metrics)
    }

    fn rule(name: &str, metric: &str, cooldown_secs: u64) -> AlertRule {
        AlertRule {
            name: name.into(),
            description: "test rule".into(),
            metric_name: Some(metric.into()),
            comparator: Comparator::Gt,
            threshold: 10.0,
            severity: Severity::High,
            channels: vec![],
            enabled: true,
            cooldown_secs,
            escalation_after_secs: None,
            escalation_severity: None,
        }
    }

    #[test]
    fn metric_write_triggers_bound_rule() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, metrics) = test_engine(dir.path());
        engine.add_rule(rule("high_err", "scraper.error_rate", 0));

        metrics.set_gauge("scraper.error_rate", 50.0);

        let active = engine.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_name, "high_err");
        assert_eq!(active[0].status, AlertStatus::Active);
        assert_eq!(active[0].trigger_count, 1);
    }

    #[test]
    fn below_threshold_does_not_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, metrics) = test_engine(dir.path());
        engine.add_rule(rule("high_err", "scraper.error_rate", 0));

        metrics.set_gauge("scraper.error_rate", 5.0);
        assert!(engine.active_alerts().is_empty());
    }

    #[test]
    fn disabled_rule_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, metrics) = test_engine(dir.path());
        let mut r = rule("high_err", "scraper.error_rate", 0);
        r.enabled = false;
        engine.add_rule(r);

        metrics.set_gauge("scraper.error_rate", 50.0);
        assert!(engine.active_alerts().is_empty());
    }

    #[test]
    fn retrigger_increments_count_without_new_alert() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _metrics) = test_engine(dir.path());
        engine.add_rule(rule("r", "m", 0));

        let id1 = engine.trigger("r", "t", "d", json!({})).unwrap();
        let id2 = engine.trigger("r", "t", "d", json!({})).unwrap();
        assert_eq!(id1, id2);

        let active = engine.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].trigger_count, 2);
    }

    #[test]
    fn cooldown_blocks_eval_but_not_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, metrics) = test_engine(dir.path());
        engine.add_rule(rule("r", "scraper.error_rate", 3600));

        metrics.set_gauge("scraper.error_rate", 50.0);
        // Second write lands inside the cooldown window: no new evaluation.
        metrics.set_gauge("scraper.error_rate", 60.0);

        let active = engine.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].trigger_count, 1);

        // A direct trigger still updates the existing alert's bookkeeping.
        engine.trigger(
            "r",
            &format!("r: {} threshold crossed", "scraper.error_rate"),
            &format!("{} (value {:.2}, threshold {:.2})", "test rule", 50.0, 10.0),
            json!({}),
        );
        assert_eq!(engine.active_alerts()[0].trigger_count, 2);
    }

    #[test]
    fn acknowledge_and_resolve_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _metrics) = test_engine(dir.path());
        engine.add_rule(rule("r", "m", 0));

        let id = engine.trigger("r", "t", "d", json!({})).unwrap();
        assert!(engine.acknowledge(&id, "operator"));
        assert_eq!(engine.active_alerts()[0].status, AlertStatus::Acknowledged);

        assert!(engine.resolve(&id));
        assert!(engine.active_alerts().is_empty());
        assert_eq!(engine.stats().history, 1);

        assert!(!engine.resolve(&id));
        assert!(!engine.acknowledge("unknown", "operator"));
    }

    #[test]
    fn escalation_raises_severity_once() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _metrics) = test_engine(dir.path());
        let mut r = rule("r", "m", 0);
        r.severity = Severity::Medium;
        r.escalation_after_secs = Some(0);
        r.escalation_severity = Some(Severity::Critical);
        engine.add_rule(r);

        engine.trigger("r", "t", "d", json!({}));
        engine.maintenance_pass();

        let active = engine.active_alerts();
        assert!(active[0].escalated);
        assert_eq!(active[0].severity, Severity::Critical);

        // A second pass must not escalate again.
        engine.maintenance_pass();
        assert_eq!(engine.stats().active, 1);
    }

    #[test]
    fn unknown_rule_trigger_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _metrics) = test_engine(dir.path());
        assert!(engine.trigger("nope", "t", "d", json!({})).is_none());
    }

    #[test]
    fn default_rules_register() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _metrics) = test_engine(dir.path());
        engine.add_default_rules();
        assert_eq!(engine.stats().rules, 5);
    }

    #[tokio::test]
    async fn dispatcher_drains_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _metrics) = test_engine(dir.path());
        engine.add_rule(rule("r", "m", 0));
        engine.trigger("r", "t", "d", json!({}));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(engine.clone().run_dispatcher(stop_rx));
        stop_tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("dispatcher must stop promptly")
            .unwrap();
    }
}
