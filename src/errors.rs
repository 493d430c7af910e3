// =============================================================================
// Error taxonomy for the scraping engine
// =============================================================================
//
// Retryability is a property of the error *kind*, not of where it was caught.
// The retry engine and the orchestrator inspect `is_transient()` /
// `is_fatal()` instead of matching on message strings.
// =============================================================================

use std::time::Duration;

/// Errors produced by the scraping pipeline and its subsystems.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// An operation exceeded its deadline (fetch, pool acquire wait, send).
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Network-level failure: connection reset, DNS, TLS, driver I/O.
    #[error("network error: {0}")]
    Network(String),

    /// The upstream returned an HTTP error status.
    #[error("http status {status}")]
    Http { status: u16 },

    /// A circuit breaker rejected the call without executing it.
    #[error("circuit '{name}' is open; retry in {retry_in:.1}s")]
    CircuitOpen { name: String, retry_in: f64 },

    /// The connection pool could not produce a page within the timeout.
    #[error("connection pool exhausted after waiting {0:?}")]
    PoolExhausted(Duration),

    /// A selector matched nothing or the page shape changed.
    #[error("extraction failed: {0}")]
    Structural(String),

    /// An extracted record failed validation and was dropped.
    #[error("validation rejected record: {0}")]
    Validation(String),

    /// Unrecoverable initialization failure (missing driver, unusable dirs).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ScrapeError {
    /// Whether a retry has any chance of succeeding.
    ///
    /// Timeouts, network faults, and 5xx responses are transient; everything
    /// else either cannot improve on retry (structural, validation) or must
    /// not be retried (circuit open, fatal). Pool exhaustion is a local
    /// resource signal: the orchestrator gives it a single retry of its own
    /// and it never enters the generic retry budget.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) => true,
            Self::Http { status } => *status >= 500,
            Self::PoolExhausted(_)
            | Self::CircuitOpen { .. }
            | Self::Structural(_)
            | Self::Validation(_)
            | Self::Fatal(_) => false,
        }
    }

    /// Whether this error must abort the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Short machine-readable kind label used in logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Network(_) => "network",
            Self::Http { .. } => "http",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::Structural(_) => "structural",
            Self::Validation(_) => "validation",
            Self::Fatal(_) => "fatal",
        }
    }
}

/// Convenience alias used throughout the pipeline.
pub type ScrapeResult<T> = Result<T, ScrapeError>;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ScrapeError::Timeout(Duration::from_secs(5)).is_transient());
        assert!(ScrapeError::Network("reset".into()).is_transient());
        assert!(ScrapeError::Http { status: 503 }.is_transient());
        assert!(!ScrapeError::Http { status: 404 }.is_transient());
        assert!(!ScrapeError::CircuitOpen {
            name: "scraping".into(),
            retry_in: 1.0
        }
        .is_transient());
        assert!(!ScrapeError::Validation("short title".into()).is_transient());
        // Resource contention is handled by the orchestrator's own single
        // retry, never by the generic retry engine.
        assert!(!ScrapeError::PoolExhausted(Duration::from_secs(10)).is_transient());
    }

    #[test]
    fn fatal_classification() {
        assert!(ScrapeError::Fatal("no driver".into()).is_fatal());
        assert!(!ScrapeError::Timeout(Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(ScrapeError::Http { status: 500 }.kind(), "http");
        assert_eq!(
            ScrapeError::PoolExhausted(Duration::from_secs(10)).kind(),
            "pool_exhausted"
        );
    }
}
