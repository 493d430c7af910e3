// =============================================================================
// Shared types used across the scraping engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single scraped job listing.
///
/// The core only interprets the identity and validation fields (title,
/// company, link, location, salary, collection timestamp); the optional
/// enriched fields are carried opaquely for downstream consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub title: String,
    pub link: String,
    pub company: String,
    pub location: String,
    /// Raw salary text as displayed by the source (e.g. "R$ 8.000 - R$ 12.000").
    pub salary: String,
    pub collected_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub benefits: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_date: Option<String>,
}

impl JobRecord {
    /// Build a record with the required fields; enriched fields start empty.
    pub fn new(
        title: impl Into<String>,
        link: impl Into<String>,
        company: impl Into<String>,
        location: impl Into<String>,
        salary: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            company: company.into(),
            location: location.into(),
            salary: salary.into(),
            collected_at: Utc::now(),
            description: None,
            requirements: None,
            benefits: None,
            experience: None,
            work_mode: None,
            publish_date: None,
        }
    }

    /// Whether all identity/validation fields carry real content (used for
    /// the run-level quality score).
    pub fn is_complete(&self) -> bool {
        !self.title.trim().is_empty()
            && !self.link.trim().is_empty()
            && !self.company.trim().is_empty()
            && !self.location.trim().is_empty()
            && !self.salary.trim().is_empty()
    }
}

/// A scrape target: one listing URL with an optional per-URL page cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeTarget {
    pub url: String,
    /// Overrides the global `max_pages` for this URL when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u32>,
}

impl ScrapeTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_pages: None,
        }
    }
}

/// Aggregate outcome of a full scraping run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub pages_processed: u64,
    pub pages_failed: u64,
    pub jobs_found: u64,
    pub jobs_new: u64,
    pub jobs_after_dedup: u64,
    pub cache_hits: u64,
    /// Percentage of processed pages that succeeded (0-100).
    pub success_rate: f64,
    /// Percentage of records with every core field populated (0-100).
    pub quality_score: f64,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Path of the result file, when one was written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_file: Option<String>,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_completeness() {
        let full = JobRecord::new(
            "Desenvolvedor Python Senior",
            "https://example.com/vagas/1",
            "TechCorp",
            "São Paulo, SP",
            "R$ 8.000",
        );
        assert!(full.is_complete());

        let mut partial = full.clone();
        partial.company = "  ".into();
        assert!(!partial.is_complete());
    }

    #[test]
    fn record_serialization_skips_empty_enrichment() {
        let record = JobRecord::new("t", "l", "c", "loc", "s");
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("description").is_none());
        assert!(json.get("title").is_some());
    }

    #[test]
    fn record_roundtrip() {
        let mut record = JobRecord::new("t", "l", "c", "loc", "s");
        record.work_mode = Some("Home Office".into());
        let json = serde_json::to_string(&record).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.title, "t");
        assert_eq!(back.work_mode.as_deref(), Some("Home Office"));
    }
}
