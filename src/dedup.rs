// =============================================================================
// Deduplicator — multi-signal identity resolution over job records
// =============================================================================
//
// Signals, cheapest and most specific first:
//   1. exact link match after URL normalization
//   2. content hash over normalized title + company + location
//   3. normalized title AND normalized company equal
//   4. Jaccard similarity of title word sets >= 0.85 AND company equal
//
// The first positive signal wins; the duplicate is dropped and the reason
// recorded. Output preserves first-seen order, which makes the pass
// idempotent: feeding the output through a fresh deduplicator changes
// nothing.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::identity::{content_key, normalize_text};
use crate::metrics::MetricsRegistry;
use crate::types::JobRecord;

/// Minimum Jaccard similarity of title word sets for signal 4.
const TITLE_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Query parameters stripped during URL normalization (tracking noise).
const QUERY_PARAM_DENYLIST: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "ref",
    "fbclid",
    "gclid",
];

/// Which signal identified a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupSignal {
    Link,
    ContentHash,
    TitleCompany,
    TitleSimilarity,
}

impl DedupSignal {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Link => "link",
            Self::ContentHash => "content_hash",
            Self::TitleCompany => "title_company",
            Self::TitleSimilarity => "title_similarity",
        }
    }
}

/// Outcome counts of one deduplication pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    pub input: u64,
    pub output: u64,
    pub removed_by: HashMap<&'static str, u64>,
}

/// Accumulating identity index. One instance spans one run, so duplicates
/// are caught across pages and target URLs.
pub struct JobDeduplicator {
    seen_links: HashSet<String>,
    seen_hashes: HashSet<String>,
    seen_title_company: HashSet<(String, String)>,
    /// Normalized title word sets per normalized company, for signal 4.
    titles_by_company: HashMap<String, Vec<HashSet<String>>>,
    stats: DedupStats,
    metrics: Arc<MetricsRegistry>,
}

impl JobDeduplicator {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            seen_links: HashSet::new(),
            seen_hashes: HashSet::new(),
            seen_title_company: HashSet::new(),
            titles_by_company: HashMap::new(),
            stats: DedupStats::default(),
            metrics,
        }
    }

    /// Remove duplicates from `jobs`, preserving first-seen order.
    pub fn deduplicate(&mut self, jobs: Vec<JobRecord>) -> Vec<JobRecord> {
        let input = jobs.len() as u64;
        self.stats.input += input;
        self.metrics.increment_counter("dedup.input", input);

        let mut unique = Vec::with_capacity(jobs.len());
        for job in jobs {
            match self.check(&job) {
                Some(signal) => {
                    *self.stats.removed_by.entry(signal.label()).or_default() += 1;
                    self.metrics.increment_counter(
                        &format!("dedup.removed_by_{}", signal.label()),
                        1,
                    );
                    debug!(
                        signal = signal.label(),
                        title = %job.title,
                        link = %job.link,
                        "duplicate discarded"
                    );
                }
                None => {
                    self.register(&job);
                    unique.push(job);
                }
            }
        }

        let output = unique.len() as u64;
        self.stats.output += output;
        self.metrics.increment_counter("dedup.output", output);
        unique
    }

    /// Evaluate the signals against the accumulated index without
    /// registering the record.
    pub fn check(&self, job: &JobRecord) -> Option<DedupSignal> {
        let link = normalize_url(&job.link);
        if !link.is_empty() && self.seen_links.contains(&link) {
            return Some(DedupSignal::Link);
        }

        if self.seen_hashes.contains(&content_hash(job)) {
            return Some(DedupSignal::ContentHash);
        }

        let title = normalize_text(&job.title);
        let company = normalize_text(&job.company);
        if !title.is_empty()
            && !company.is_empty()
            && self
                .seen_title_company
                .contains(&(title.clone(), company.clone()))
        {
            return Some(DedupSignal::TitleCompany);
        }

        if !company.is_empty() {
            let words = word_set(&title);
            if let Some(known) = self.titles_by_company.get(&company) {
                if known
                    .iter()
                    .any(|candidate| jaccard(&words, candidate) >= TITLE_SIMILARITY_THRESHOLD)
                {
                    return Some(DedupSignal::TitleSimilarity);
                }
            }
        }

        None
    }

    /// Add the record's identity signatures to the index.
    pub fn register(&mut self, job: &JobRecord) {
        let link = normalize_url(&job.link);
        if !link.is_empty() {
            self.seen_links.insert(link);
        }
        self.seen_hashes.insert(content_hash(job));

        let title = normalize_text(&job.title);
        let company = normalize_text(&job.company);
        if !title.is_empty() && !company.is_empty() {
            self.seen_title_company
                .insert((title.clone(), company.clone()));
            self.titles_by_company
                .entry(company)
                .or_default()
                .push(word_set(&title));
        }
    }

    pub fn stats(&self) -> &DedupStats {
        &self.stats
    }
}

/// Canonical form of a job link: lowercase scheme and host, denylisted
/// query params removed, trailing slash stripped.
fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    match Url::parse(trimmed) {
        Ok(mut url) => {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(key, _)| !QUERY_PARAM_DENYLIST.contains(&key.as_ref()))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if kept.is_empty() {
                url.set_query(None);
            } else {
                url.query_pairs_mut().clear().extend_pairs(kept);
            }

            let mut text = url.to_string();
            while text.ends_with('/') {
                text.pop();
            }
            text
        }
        // Relative links and malformed URLs fall back to a textual form.
        Err(_) => trimmed.trim_end_matches('/').to_lowercase(),
    }
}

fn content_hash(job: &JobRecord) -> String {
    content_key(&format!(
        "{}\u{1f}{}\u{1f}{}",
        normalize_text(&job.title),
        normalize_text(&job.company),
        normalize_text(&job.location)
    ))
}

fn word_set(normalized_title: &str) -> HashSet<String> {
    normalized_title
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}
