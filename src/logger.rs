// =============================================================================
// Structured Logger — JSON-lines records with trace correlation
// =============================================================================
//
// Every record is one JSON object per line:
//
//   {timestamp, level, component, message, trace_id?, operation?,
//    duration_ms?, success?, error?, context?}
//
// Three file destinations with size-triggered rotation:
//   - scraper.log         info and above, 10 MiB, 5 backups
//   - scraper_debug.log   everything,     50 MiB, 3 backups
//   - scraper_errors.log  error and above, 5 MiB, 10 backups
//
// Rotation shifts name.log -> name.log.1 -> name.log.2 ... dropping the
// oldest backup. Warn-and-above records are mirrored to `tracing` so the
// console stays readable without tailing the JSON files.
//
// Trace ids are 8 hex chars scoped to the current tokio task; nested scopes
// shadow the outer id and restore it on exit.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context as _, Result};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};
use uuid::Uuid;

// =============================================================================
// Levels and components
// =============================================================================

/// Log severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

/// Engine subsystem emitting the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Scraper,
    RetrySystem,
    FallbackSelector,
    Cache,
    Pool,
    RateLimiter,
    Incremental,
    Deduplicator,
    Alerts,
    Metrics,
    System,
}

// =============================================================================
// Record shape
// =============================================================================

#[derive(Debug, Serialize)]
struct LogEntry<'a> {
    timestamp: String,
    level: LogLevel,
    component: Component,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a Value>,
}

/// Optional fields attached to a record.
#[derive(Debug, Default, Clone)]
pub struct LogFields {
    pub operation: Option<String>,
    pub duration_ms: Option<f64>,
    pub success: Option<bool>,
    pub error: Option<String>,
    pub context: Option<Value>,
}

impl LogFields {
    pub fn operation(op: impl Into<String>) -> Self {
        Self {
            operation: Some(op.into()),
            ..Default::default()
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

// =============================================================================
// Trace context
// =============================================================================

tokio::task_local! {
    static TRACE_ID: String;
}

/// The trace id of the current task scope, if any.
pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(|id| id.clone()).ok()
}

/// Generate a short trace id: the first 8 hex chars of a v4 UUID.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Run `fut` inside a fresh trace scope. Nested calls shadow the outer id;
/// the outer id is visible again once the future completes.
pub async fn in_trace<F, T>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    TRACE_ID.scope(new_trace_id(), fut).await
}

// =============================================================================
// Rotating destination
// =============================================================================

struct Destination {
    path: PathBuf,
    min_level: LogLevel,
    max_bytes: u64,
    max_backups: u32,
    file: Mutex<Option<File>>,
}

impl Destination {
    fn new(path: PathBuf, min_level: LogLevel, max_bytes: u64, max_backups: u32) -> Self {
        Self {
            path,
            min_level,
            max_bytes,
            max_backups,
            file: Mutex::new(None),
        }
    }

    fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.file.lock();

        if guard.is_none() {
            *guard = Some(self.open()?);
        }

        // Size check before the write so a single oversized record cannot
        // grow the file unboundedly between checks.
        let current_len = guard
            .as_ref()
            .and_then(|f| f.metadata().ok())
            .map(|m| m.len())
            .unwrap_or(0);
        if current_len >= self.max_bytes {
            *guard = None;
            self.rotate()?;
            *guard = Some(self.open()?);
        }

        let file = guard.as_mut().expect("destination file just opened");
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    fn open(&self) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open log file {}", self.path.display()))
    }

    /// Shift name.log -> name.log.1 -> ... -> name.log.N, dropping the oldest.
    fn rotate(&self) -> Result<()> {
        let backup = |n: u32| PathBuf::from(format!("{}.{}", self.path.display(), n));

        let oldest = backup(self.max_backups);
        if oldest.exists() {
            std::fs::remove_file(&oldest).ok();
        }
        for n in (1..self.max_backups).rev() {
            let src = backup(n);
            if src.exists() {
                std::fs::rename(&src, backup(n + 1)).ok();
            }
        }
        if self.path.exists() {
            std::fs::rename(&self.path, backup(1))
                .with_context(|| format!("failed to rotate {}", self.path.display()))?;
        }
        Ok(())
    }
}

// =============================================================================
// StructuredLogger
// =============================================================================

/// Main log (info+) rollover size and backup count.
const MAIN_MAX_BYTES: u64 = 10 * 1024 * 1024;
const MAIN_BACKUPS: u32 = 5;
/// Debug log (debug+) rollover size and backup count.
const DEBUG_MAX_BYTES: u64 = 50 * 1024 * 1024;
const DEBUG_BACKUPS: u32 = 3;
/// Error log (error+) rollover size and backup count.
const ERROR_MAX_BYTES: u64 = 5 * 1024 * 1024;
const ERROR_BACKUPS: u32 = 10;

/// Structured JSON logger with rotating file destinations.
pub struct StructuredLogger {
    destinations: Vec<Destination>,
}

impl StructuredLogger {
    /// Create the logger, ensuring `log_dir` exists.
    pub fn new(log_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = log_dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;

        Ok(Self {
            destinations: vec![
                Destination::new(
                    dir.join("scraper.log"),
                    LogLevel::Info,
                    MAIN_MAX_BYTES,
                    MAIN_BACKUPS,
                ),
                Destination::new(
                    dir.join("scraper_debug.log"),
                    LogLevel::Debug,
                    DEBUG_MAX_BYTES,
                    DEBUG_BACKUPS,
                ),
                Destination::new(
                    dir.join("scraper_errors.log"),
                    LogLevel::Error,
                    ERROR_MAX_BYTES,
                    ERROR_BACKUPS,
                ),
            ],
        })
    }

    /// Emit a record at `level` with the given optional fields.
    pub fn log(&self, level: LogLevel, component: Component, message: &str, fields: LogFields) {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            level,
            component,
            message,
            trace_id: current_trace_id(),
            operation: fields.operation.as_deref(),
            duration_ms: fields.duration_ms,
            success: fields.success,
            error: fields.error.as_deref(),
            context: fields.context.as_ref(),
        };

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "failed to serialize log entry");
                return;
            }
        };

        for dest in &self.destinations {
            if level >= dest.min_level {
                if let Err(e) = dest.write_line(&line) {
                    // A broken log file must not take the pipeline down.
                    error!(error = %e, path = %dest.path.display(), "log write failed");
                }
            }
        }

        // Mirror warnings and errors onto the console subscriber.
        match level {
            LogLevel::Warn => warn!(component = ?component, "{message}"),
            LogLevel::Error | LogLevel::Critical => error!(component = ?component, "{message}"),
            _ => {}
        }
    }

    pub fn debug(&self, component: Component, message: &str, fields: LogFields) {
        self.log(LogLevel::Debug, component, message, fields);
    }

    pub fn info(&self, component: Component, message: &str, fields: LogFields) {
        self.log(LogLevel::Info, component, message, fields);
    }

    pub fn warn(&self, component: Component, message: &str, fields: LogFields) {
        self.log(LogLevel::Warn, component, message, fields);
    }

    pub fn error(&self, component: Component, message: &str, fields: LogFields) {
        self.log(LogLevel::Error, component, message, fields);
    }

    pub fn critical(&self, component: Component, message: &str, fields: LogFields) {
        self.log(LogLevel::Critical, component, message, fields);
    }

    /// Start a performance-tracked operation. The returned tracker emits a
    /// completion record with `duration_ms` and `success` when finished.
    pub fn track<'a>(&'a self, component: Component, operation: &str) -> PerfTracker<'a> {
        self.debug(
            component,
            &format!("started operation: {operation}"),
            LogFields::operation(operation),
        );
        PerfTracker {
            logger: self,
            component,
            operation: operation.to_string(),
            started: Instant::now(),
        }
    }

    /// Run `fut` under a performance tracker. Failures are logged with
    /// `success: false` and then propagated unchanged.
    pub async fn track_async<'a, F, T, E>(
        &'a self,
        component: Component,
        operation: &str,
        fut: F,
    ) -> Result<T, E>
    where
        F: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let tracker = self.track(component, operation);
        match fut.await {
            Ok(value) => {
                tracker.finish(true, LogFields::default());
                Ok(value)
            }
            Err(e) => {
                tracker.finish(false, LogFields::default().with_error(e.to_string()));
                Err(e)
            }
        }
    }
}

/// In-flight measurement of a single operation.
pub struct PerfTracker<'a> {
    logger: &'a StructuredLogger,
    component: Component,
    operation: String,
    started: Instant,
}

impl PerfTracker<'_> {
    /// Emit the completion record and return the measured duration in ms.
    pub fn finish(self, success: bool, mut fields: LogFields) -> f64 {
        let duration_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        fields.operation = Some(self.operation.clone());
        fields.duration_ms = Some((duration_ms * 100.0).round() / 100.0);
        fields.success = Some(success);

        let level = if success { LogLevel::Info } else { LogLevel::Warn };
        self.logger.log(
            level,
            self.component,
            &format!("completed operation: {}", self.operation),
            fields,
        );
        duration_ms
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn read_lines(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn records_are_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let logger = StructuredLogger::new(dir.path()).unwrap();

        logger.info(
            Component::Scraper,
            "page processed",
            LogFields::operation("fetch_page").with_context(json!({"page": 1})),
        );
        logger.debug(Component::Cache, "cache miss", LogFields::default());

        let main = read_lines(&dir.path().join("scraper.log"));
        assert_eq!(main.len(), 1);
        assert_eq!(main[0]["level"], "INFO");
        assert_eq!(main[0]["component"], "scraper");
        assert_eq!(main[0]["operation"], "fetch_page");
        assert_eq!(main[0]["context"]["page"], 1);

        // Debug destination receives everything.
        let debug = read_lines(&dir.path().join("scraper_debug.log"));
        assert_eq!(debug.len(), 2);

        // Error destination receives nothing yet.
        assert!(read_lines(&dir.path().join("scraper_errors.log")).is_empty());
    }

    #[test]
    fn errors_reach_all_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let logger = StructuredLogger::new(dir.path()).unwrap();

        logger.error(
            Component::Pool,
            "acquire timed out",
            LogFields::default().with_error("pool exhausted"),
        );

        for file in ["scraper.log", "scraper_debug.log", "scraper_errors.log"] {
            let lines = read_lines(&dir.path().join(file));
            assert_eq!(lines.len(), 1, "{file} should carry the error record");
            assert_eq!(lines[0]["error"], "pool exhausted");
        }
    }

    #[tokio::test]
    async fn trace_scopes_nest_and_restore() {
        assert!(current_trace_id().is_none());

        in_trace(async {
            let outer = current_trace_id().unwrap();
            assert_eq!(outer.len(), 8);

            in_trace(async {
                let inner = current_trace_id().unwrap();
                assert_ne!(inner, outer);
            })
            .await;

            assert_eq!(current_trace_id().unwrap(), outer);
        })
        .await;

        assert!(current_trace_id().is_none());
    }

    #[tokio::test]
    async fn tracked_records_carry_trace_id() {
        let dir = tempfile::tempdir().unwrap();
        let logger = StructuredLogger::new(dir.path()).unwrap();

        in_trace(async {
            logger.info(Component::System, "inside trace", LogFields::default());
        })
        .await;

        let main = read_lines(&dir.path().join("scraper.log"));
        assert_eq!(main[0]["trace_id"].as_str().unwrap().len(), 8);
    }

    #[test]
    fn perf_tracker_reports_duration_and_success() {
        let dir = tempfile::tempdir().unwrap();
        let logger = StructuredLogger::new(dir.path()).unwrap();

        let tracker = logger.track(Component::Scraper, "extract_jobs");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let duration = tracker.finish(true, LogFields::default());
        assert!(duration >= 5.0);

        let main = read_lines(&dir.path().join("scraper.log"));
        let completion = main.last().unwrap();
        assert_eq!(completion["success"], true);
        assert!(completion["duration_ms"].as_f64().unwrap() >= 5.0);
    }

    #[tokio::test]
    async fn track_async_propagates_failure() {
        let dir = tempfile::tempdir().unwrap();
        let logger = StructuredLogger::new(dir.path()).unwrap();

        let result: Result<(), crate::errors::ScrapeError> = logger
            .track_async(Component::Scraper, "fetch", async {
                Err(crate::errors::ScrapeError::Network("reset".into()))
            })
            .await;
        assert!(result.is_err());

        let main = read_lines(&dir.path().join("scraper.log"));
        let completion = main.last().unwrap();
        assert_eq!(completion["success"], false);
        assert!(completion["error"]
            .as_str()
            .unwrap()
            .contains("network error"));
    }

    #[test]
    fn rotation_keeps_bounded_backups() {
        let dir = tempfile::tempdir().unwrap();
        let dest = Destination::new(dir.path().join("t.log"), LogLevel::Debug, 64, 2);

        // Each line is ~40 bytes; enough writes to force several rotations.
        for i in 0..32 {
            dest.write_line(&format!("{{\"n\":{i},\"pad\":\"xxxxxxxxxxxxxxxxxxxx\"}}"))
                .unwrap();
        }

        assert!(dir.path().join("t.log").exists());
        assert!(dir.path().join("t.log.1").exists());
        assert!(dir.path().join("t.log.2").exists());
        assert!(!dir.path().join("t.log.3").exists());
    }
}
