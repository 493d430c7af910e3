// =============================================================================
// Notification channels — console, file, webhook, email, Slack
// =============================================================================
//
// Channels are polymorphic over {rate_check, format, send}. Each sender
// embeds a shared base carrying its config and a per-hour send counter; the
// trait's provided methods delegate to the base so the dispatcher treats all
// channels uniformly.
// =============================================================================

use std::collections::HashMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{ActiveAlert, Severity};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration of one notification channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
    #[serde(default = "default_max_per_hour")]
    pub max_alerts_per_hour: u32,
    /// Template override; defaults are selected by severity and channel.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(flatten)]
    pub kind: ChannelKind,
}

fn default_enabled() -> bool {
    true
}

fn default_min_severity() -> Severity {
    Severity::Low
}

fn default_max_per_hour() -> u32 {
    60
}

/// Kind-specific channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChannelKind {
    Console,
    File {
        path: PathBuf,
    },
    Webhook {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default = "default_webhook_timeout_secs")]
        timeout_secs: u64,
    },
    Email {
        smtp_server: String,
        #[serde(default = "default_smtp_port")]
        smtp_port: u16,
        username: String,
        password: String,
        from: String,
        to: Vec<String>,
    },
    Slack {
        webhook_url: String,
    },
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_smtp_port() -> u16 {
    587
}

impl ChannelConfig {
    /// A console channel gated at the given severity.
    pub fn console(min_severity: Severity) -> Self {
        Self {
            enabled: true,
            min_severity,
            max_alerts_per_hour: default_max_per_hour(),
            template: None,
            kind: ChannelKind::Console,
        }
    }

    /// A JSON-lines file channel appending to `path`.
    pub fn file(path: impl Into<PathBuf>, min_severity: Severity) -> Self {
        Self {
            enabled: true,
            min_severity,
            max_alerts_per_hour: default_max_per_hour(),
            template: None,
            kind: ChannelKind::File { path: path.into() },
        }
    }
}

// =============================================================================
// Templates
// =============================================================================

/// A formatted notification ready for delivery.
#[derive(Debug, Clone)]
pub struct RenderedNotification {
    pub title: String,
    pub body: String,
}

struct Template {
    title: &'static str,
    body: &'static str,
}

const DEFAULT_TEMPLATE: Template = Template {
    title: "Alert: {title}",
    body: "Alert id: {alert_id}\nSeverity: {severity}\nStatus: {status}\n\
           Description: {description}\nCreated at: {created_at}\n\
           Occurrences: {trigger_count}\n\nContext:\n{context}",
};

const CRITICAL_TEMPLATE: Template = Template {
    title: "CRITICAL ALERT: {title}",
    body: "Immediate action required.\n\nAlert id: {alert_id}\n\
           Severity: {severity}\nDescription: {description}\n\
           Occurrences: {trigger_count}\nFirst seen: {created_at}\n\n\
           Context:\n{context}",
};

const SLACK_TEMPLATE: Template = Template {
    title: "{title}",
    body: "{description}\n\n*Severity:* {severity}\n*Occurrences:* {trigger_count}",
};

fn template_by_name(name: &str) -> &'static Template {
    match name {
        "critical" => &CRITICAL_TEMPLATE,
        "slack" => &SLACK_TEMPLATE,
        _ => &DEFAULT_TEMPLATE,
    }
}

/// Substitute `{placeholder}` variables with the alert's fields.
pub fn render(alert: &ActiveAlert, template_name: &str) -> RenderedNotification {
    let template = template_by_name(template_name);
    let context =
        serde_json::to_string_pretty(&alert.context).unwrap_or_else(|_| "{}".to_string());
    let status = serde_json::to_value(alert.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_uppercase))
        .unwrap_or_default();

    let substitute = |text: &str| {
        text.replace("{alert_id}", &alert.id)
            .replace("{title}", &alert.title)
            .replace("{description}", &alert.description)
            .replace("{severity}", &alert.severity.to_string().to_uppercase())
            .replace("{status}", &status)
            .replace(
                "{created_at}",
                &alert.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            )
            .replace("{trigger_count}", &alert.trigger_count.to_string())
            .replace("{context}", &context)
    };

    RenderedNotification {
        title: substitute(template.title),
        body: substitute(template.body),
    }
}

/// Slack attachment color by severity.
fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "#36a64f",
        Severity::Medium => "#ff9900",
        Severity::High => "#ff0000",
        Severity::Critical => "#8b0000",
    }
}

// =============================================================================
// Channel trait and shared base
// =============================================================================

struct RateWindow {
    sent: u32,
    window_start: Instant,
}

/// State shared by every sender: its config and the hourly rate window.
pub struct ChannelBase {
    config: ChannelConfig,
    window: Mutex<RateWindow>,
}

impl ChannelBase {
    fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            window: Mutex::new(RateWindow {
                sent: 0,
                window_start: Instant::now(),
            }),
        }
    }

    fn consume_rate_slot(&self) -> bool {
        let mut window = self.window.lock();
        if window.window_start.elapsed() > Duration::from_secs(3600) {
            window.sent = 0;
            window.window_start = Instant::now();
        }
        if window.sent >= self.config.max_alerts_per_hour {
            return false;
        }
        window.sent += 1;
        true
    }
}

/// A notification destination. Implementations provide `send`; eligibility
/// checks and template selection are shared.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;
    fn base(&self) -> &ChannelBase;

    fn enabled(&self) -> bool {
        self.base().config.enabled
    }

    fn min_severity(&self) -> Severity {
        self.base().config.min_severity
    }

    /// Consume one slot of the per-hour budget; false when exhausted.
    fn rate_check(&self) -> bool {
        self.base().consume_rate_slot()
    }

    /// Template to render for an alert of the given severity.
    fn template_name(&self, severity: Severity) -> &str {
        if let Some(template) = self.base().config.template.as_deref() {
            return template;
        }
        if severity == Severity::Critical {
            "critical"
        } else {
            "default"
        }
    }

    async fn send(&self, alert: &ActiveAlert, rendered: &RenderedNotification) -> Result<()>;
}

/// Instantiate senders for every configured channel.
pub fn build_channels(configs: &[ChannelConfig]) -> Vec<Arc<dyn NotificationChannel>> {
    configs
        .iter()
        .map(|config| -> Arc<dyn NotificationChannel> {
            match &config.kind {
                ChannelKind::Console => Arc::new(ConsoleChannel::new(config.clone())),
                ChannelKind::File { .. } => Arc::new(FileChannel::new(config.clone())),
                ChannelKind::Webhook { .. } => Arc::new(WebhookChannel::new(config.clone())),
                ChannelKind::Email { .. } => Arc::new(EmailChannel::new(config.clone())),
                ChannelKind::Slack { .. } => Arc::new(SlackChannel::new(config.clone())),
            }
        })
        .collect()
}

// =============================================================================
// Console
// =============================================================================

struct ConsoleChannel {
    base: ChannelBase,
}

impl ConsoleChannel {
    fn new(config: ChannelConfig) -> Self {
        Self {
            base: ChannelBase::new(config),
        }
    }
}

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn name(&self) -> &'static str {
        "console"
    }

    fn base(&self) -> &ChannelBase {
        &self.base
    }

    async fn send(&self, alert: &ActiveAlert, rendered: &RenderedNotification) -> Result<()> {
        match alert.severity {
            Severity::Low | Severity::Medium => info!(
                alert_id = %alert.id,
                severity = %alert.severity,
                occurrences = alert.trigger_count,
                "{}",
                rendered.title
            ),
            Severity::High | Severity::Critical => warn!(
                alert_id = %alert.id,
                severity = %alert.severity,
                occurrences = alert.trigger_count,
                "{}",
                rendered.title
            ),
        }
        Ok(())
    }
}

// =============================================================================
// File (append-only JSON lines)
// =============================================================================

struct FileChannel {
    base: ChannelBase,
    path: PathBuf,
}

impl FileChannel {
    fn new(config: ChannelConfig) -> Self {
        let path = match &config.kind {
            ChannelKind::File { path } => path.clone(),
            _ => unreachable!("FileChannel built from non-file config"),
        };
        Self {
            base: ChannelBase::new(config),
            path,
        }
    }
}

#[async_trait]
impl NotificationChannel for FileChannel {
    fn name(&self) -> &'static str {
        "file"
    }

    fn base(&self) -> &ChannelBase {
        &self.base
    }

    async fn send(&self, alert: &ActiveAlert, _rendered: &RenderedNotification) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create alert log dir {}", parent.display()))?;
        }

        let line = serde_json::to_string(&json!({
            "timestamp": alert.created_at.to_rfc3339(),
            "alert_id": alert.id,
            "title": alert.title,
            "description": alert.description,
            "severity": alert.severity.to_string(),
            "status": alert.status,
            "trigger_count": alert.trigger_count,
            "context": alert.context,
        }))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open alert log {}", self.path.display()))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

// =============================================================================
// HTTP webhook
// =============================================================================

struct WebhookChannel {
    base: ChannelBase,
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
}

impl WebhookChannel {
    fn new(config: ChannelConfig) -> Self {
        let (url, headers, timeout_secs) = match &config.kind {
            ChannelKind::Webhook {
                url,
                headers,
                timeout_secs,
            } => (url.clone(), headers.clone(), *timeout_secs),
            _ => unreachable!("WebhookChannel built from non-webhook config"),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build webhook http client");
        Self {
            base: ChannelBase::new(config),
            client,
            url,
            headers,
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn base(&self) -> &ChannelBase {
        &self.base
    }

    async fn send(&self, alert: &ActiveAlert, rendered: &RenderedNotification) -> Result<()> {
        let payload = json!({
            "alert_id": alert.id,
            "title": rendered.title,
            "description": rendered.body,
            "severity": alert.severity.to_string(),
            "status": alert.status,
            "created_at": alert.created_at.to_rfc3339(),
            "trigger_count": alert.trigger_count,
            "context": alert.context,
        });

        let mut request = self.client.post(&self.url).json(&payload);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.context("webhook request failed")?;
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(anyhow!("webhook returned status {status}"));
        }
        Ok(())
    }
}

// =============================================================================
// SMTP email
// =============================================================================

struct EmailChannel {
    base: ChannelBase,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
    to: Vec<String>,
}

impl EmailChannel {
    fn new(config: ChannelConfig) -> Self {
        let (server, port, username, password, from, to) = match &config.kind {
            ChannelKind::Email {
                smtp_server,
                smtp_port,
                username,
                password,
                from,
                to,
            } => (
                smtp_server.clone(),
                *smtp_port,
                username.clone(),
                password.clone(),
                from.clone(),
                to.clone(),
            ),
            _ => unreachable!("EmailChannel built from non-email config"),
        };

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&server)
            .expect("invalid SMTP relay host")
            .port(port)
            .credentials(Credentials::new(username, password))
            .build();

        Self {
            base: ChannelBase::new(config),
            transport,
            from,
            to,
        }
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn base(&self) -> &ChannelBase {
        &self.base
    }

    async fn send(&self, _alert: &ActiveAlert, rendered: &RenderedNotification) -> Result<()> {
        let mut builder = Message::builder()
            .from(self.from.parse().context("invalid sender address")?)
            .subject(rendered.title.clone())
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.to {
            builder = builder.to(recipient.parse().context("invalid recipient address")?);
        }
        let message = builder
            .body(rendered.body.clone())
            .context("failed to build email")?;

        self.transport
            .send(message)
            .await
            .context("smtp send failed")?;
        Ok(())
    }
}

// =============================================================================
// Slack incoming webhook
// =============================================================================

struct SlackChannel {
    base: ChannelBase,
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackChannel {
    fn new(config: ChannelConfig) -> Self {
        let webhook_url = match &config.kind {
            ChannelKind::Slack { webhook_url } => webhook_url.clone(),
            _ => unreachable!("SlackChannel built from non-slack config"),
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build slack http client");
        Self {
            base: ChannelBase::new(config),
            client,
            webhook_url,
        }
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn template_name(&self, severity: Severity) -> &str {
        if let Some(template) = self.base().config.template.as_deref() {
            return template;
        }
        if severity == Severity::Critical {
            "critical"
        } else {
            "slack"
        }
    }

    async fn send(&self, alert: &ActiveAlert, rendered: &RenderedNotification) -> Result<()> {
        let payload = json!({
            "attachments": [{
                "color": severity_color(alert.severity),
                "title": rendered.title,
                "text": rendered.body,
                "fields": [
                    {"title": "Severity", "value": alert.severity.to_string().to_uppercase(), "short": true},
                    {"title": "Occurrences", "value": alert.trigger_count.to_string(), "short": true},
                ],
                "footer": "vagascout alert engine",
                "ts": alert.created_at.timestamp(),
            }]
        });

        let response = self
            .client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await
            .context("slack request failed")?;
        if !response.status().is_success() {
            return Err(anyhow!("slack returned status {}", response.status()));
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_alert(severity: Severity) -> ActiveAlert {
        ActiveAlert {
            id: "abc123".into(),
            rule_name: "high_error_rate".into(),
            title: "error rate above tolerance".into(),
            description: "error rate at 50%".into(),
            severity,
            status: super::super::AlertStatus::Active,
            created_at: Utc::now(),
            last_triggered: Utc::now(),
            trigger_count: 3,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            escalated: false,
            context: json!({"source": "test"}),
        }
    }

    #[test]
    fn render_substitutes_placeholders() {
        let rendered = render(&sample_alert(Severity::High), "default");
        assert!(rendered.title.contains("error rate above tolerance"));
        assert!(rendered.body.contains("abc123"));
        assert!(rendered.body.contains("HIGH"));
        assert!(rendered.body.contains("Occurrences: 3"));
    }

    #[test]
    fn critical_template_differs() {
        let rendered = render(&sample_alert(Severity::Critical), "critical");
        assert!(rendered.title.starts_with("CRITICAL ALERT"));
    }

    #[test]
    fn severity_colors() {
        assert_eq!(severity_color(Severity::Low), "#36a64f");
        assert_eq!(severity_color(Severity::Medium), "#ff9900");
        assert_eq!(severity_color(Severity::High), "#ff0000");
        assert_eq!(severity_color(Severity::Critical), "#8b0000");
    }

    #[test]
    fn rate_window_enforces_hourly_budget() {
        let mut config = ChannelConfig::console(Severity::Low);
        config.max_alerts_per_hour = 2;
        let channel = ConsoleChannel::new(config);

        assert!(channel.rate_check());
        assert!(channel.rate_check());
        assert!(!channel.rate_check());
    }

    #[test]
    fn template_selection_by_severity_and_channel() {
        let console = ConsoleChannel::new(ChannelConfig::console(Severity::Low));
        assert_eq!(console.template_name(Severity::Medium), "default");
        assert_eq!(console.template_name(Severity::Critical), "critical");

        let slack = SlackChannel::new(ChannelConfig {
            enabled: true,
            min_severity: Severity::Low,
            max_alerts_per_hour: 60,
            template: None,
            kind: ChannelKind::Slack {
                webhook_url: "https://hooks.slack.invalid/services/T/B/X".into(),
            },
        });
        assert_eq!(slack.template_name(Severity::Medium), "slack");
        assert_eq!(slack.template_name(Severity::Critical), "critical");
    }

    #[tokio::test]
    async fn file_channel_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts").join("alerts.log");
        let channel = FileChannel::new(ChannelConfig::file(&path, Severity::Low));

        let alert = sample_alert(Severity::High);
        let rendered = render(&alert, "default");
        channel.send(&alert, &rendered).await.unwrap();
        channel.send(&alert, &rendered).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["alert_id"], "abc123");
        assert_eq!(lines[0]["severity"], "high");
        assert_eq!(lines[0]["status"], "active");
    }

    #[test]
    fn channel_config_deserializes_tagged_kinds() {
        let json = r#"{
            "kind": "webhook",
            "url": "https://ops.example.com/hook",
            "min_severity": "high",
            "headers": {"authorization": "Bearer t"}
        }"#;
        let config: ChannelConfig = serde_json::from_str(json).unwrap();
        assert!(config.enabled);
        assert_eq!(config.min_severity, Severity::High);
        match config.kind {
            ChannelKind::Webhook {
                url, timeout_secs, ..
            } => {
                assert_eq!(url, "https://ops.example.com/hook");
                assert_eq!(timeout_secs, 10);
            }
            _ => panic!("expected webhook kind"),
        }
    }

    #[test]
    fn build_channels_covers_all_kinds() {
        let configs = vec![
            ChannelConfig::console(Severity::Medium),
            ChannelConfig::file("/tmp/alerts.log", Severity::Low),
        ];
        let channels = build_channels(&configs);
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].name(), "console");
        assert_eq!(channels[1].name(), "file");
    }
}
