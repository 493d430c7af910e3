// =============================================================================
// Incremental Processor — cross-run fingerprinting and early-stop
// =============================================================================
//
// Keeps a durable set of job fingerprints across sessions so re-runs only
// pay for listings they have not seen. A page whose share of unseen jobs
// falls below the early-stop threshold ends pagination for that URL.
//
// The fingerprint history is capped; the oldest fingerprints are evicted
// FIFO once the cap is reached, after which the same job may legitimately
// be reported as new again.
//
// Checkpoint file: single JSON document {fingerprints, sessions}, rewritten
// atomically (tmp + rename) on every session end.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::identity::job_fingerprint;
use crate::metrics::MetricsRegistry;
use crate::types::JobRecord;

/// Maximum fingerprints retained across sessions.
const MAX_FINGERPRINTS: usize = 100_000;
/// Sessions kept in the checkpoint file.
const MAX_SESSIONS: usize = 50;
/// Estimated seconds of work avoided per already-known job.
const AVG_SECS_PER_JOB: f64 = 0.5;

/// Ratio of unseen jobs below which a whole page ends pagination.
pub const EARLY_STOP_THRESHOLD: f64 = 0.3;
/// Stricter ratio used when filtering individual batches.
pub const HARD_FILTER_THRESHOLD: f64 = 0.1;

// =============================================================================
// Checkpoint shapes
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub pages_processed: u64,
    pub jobs_new: u64,
    pub jobs_known: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stats: SessionStats,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Checkpoint {
    #[serde(default)]
    fingerprints: Vec<String>,
    #[serde(default)]
    sessions: Vec<SessionRecord>,
}

// =============================================================================
// Processor
// =============================================================================

struct Inner {
    seen: HashSet<String>,
    /// Insertion order of `seen`, for FIFO eviction at the cap.
    order: VecDeque<String>,
    sessions: Vec<SessionRecord>,
    current: Option<SessionRecord>,
}

impl Inner {
    fn register(&mut self, fingerprint: String) {
        if !self.seen.insert(fingerprint.clone()) {
            return;
        }
        self.order.push_back(fingerprint);
        while self.order.len() > MAX_FINGERPRINTS {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}

/// Fingerprint registry with session checkpointing.
pub struct IncrementalProcessor {
    checkpoint_path: PathBuf,
    inner: Mutex<Inner>,
    metrics: Arc<MetricsRegistry>,
}

impl IncrementalProcessor {
    /// Load state from `checkpoint_path`, starting empty when the file does
    /// not exist yet.
    pub fn new(checkpoint_path: impl Into<PathBuf>, metrics: Arc<MetricsRegistry>) -> Self {
        let checkpoint_path = checkpoint_path.into();

        let checkpoint = match std::fs::read_to_string(&checkpoint_path) {
            Ok(content) => match serde_json::from_str::<Checkpoint>(&content) {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    warn!(
                        path = %checkpoint_path.display(),
                        error = %e,
                        "unreadable checkpoint ignored; starting fresh"
                    );
                    Checkpoint::default()
                }
            },
            Err(_) => Checkpoint::default(),
        };

        let mut inner = Inner {
            seen: HashSet::with_capacity(checkpoint.fingerprints.len()),
            order: VecDeque::with_capacity(checkpoint.fingerprints.len()),
            sessions: checkpoint.sessions,
            current: None,
        };
        for fingerprint in checkpoint.fingerprints {
            inner.register(fingerprint);
        }

        info!(
            known = inner.seen.len(),
            sessions = inner.sessions.len(),
            "incremental processor loaded"
        );

        Self {
            checkpoint_path,
            inner: Mutex::new(inner),
            metrics,
        }
    }

    // -------------------------------------------------------------------------
    // Session boundaries
    // -------------------------------------------------------------------------

    /// Open a new session. Statistics accumulate until `end_session`.
    pub fn start_session(&self) -> Uuid {
        let session = SessionRecord {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            ended_at: None,
            stats: SessionStats::default(),
        };
        let id = session.id;
        self.inner.lock().current = Some(session);
        debug!(session_id = %id, "incremental session started");
        id
    }

    /// Close the current session, report its savings estimate, and persist
    /// the checkpoint.
    pub fn end_session(&self) -> Result<Option<SessionRecord>> {
        let finished = {
            let mut inner = self.inner.lock();
            let mut session = match inner.current.take() {
                Some(session) => session,
                None => return Ok(None),
            };
            session.ended_at = Some(Utc::now());
            inner.sessions.push(session.clone());
            while inner.sessions.len() > MAX_SESSIONS {
                inner.sessions.remove(0);
            }
            session
        };

        let saved = finished.stats.jobs_known as f64 * AVG_SECS_PER_JOB;
        self.metrics.set_gauge("scraper.time_saved_seconds", saved);

        info!(
            session_id = %finished.id,
            jobs_new = finished.stats.jobs_new,
            jobs_known = finished.stats.jobs_known,
            time_saved_secs = saved,
            "incremental session ended"
        );

        self.save()?;
        Ok(Some(finished))
    }

    // -------------------------------------------------------------------------
    // Page decisions
    // -------------------------------------------------------------------------

    /// Split `page_jobs` into unseen jobs and decide whether pagination
    /// should continue: it does while `|new| / |page|` stays at or above
    /// `threshold`. An empty page always stops.
    pub fn should_continue_processing(
        &self,
        page_jobs: &[JobRecord],
        threshold: f64,
    ) -> (bool, Vec<JobRecord>) {
        if page_jobs.is_empty() {
            return (false, Vec::new());
        }

        let inner = self.inner.lock();
        let new_jobs: Vec<JobRecord> = page_jobs
            .iter()
            .filter(|job| !inner.seen.contains(&fingerprint_of(job)))
            .cloned()
            .collect();

        let ratio = new_jobs.len() as f64 / page_jobs.len() as f64;
        (ratio >= threshold, new_jobs)
    }

    /// Register every unseen job on the page and return only the new subset.
    pub fn process_page_incrementally(
        &self,
        page_jobs: &[JobRecord],
        page_num: u32,
    ) -> Vec<JobRecord> {
        let mut inner = self.inner.lock();
        let mut new_jobs = Vec::new();

        for job in page_jobs {
            let fingerprint = fingerprint_of(job);
            if inner.seen.contains(&fingerprint) {
                if let Some(session) = inner.current.as_mut() {
                    session.stats.jobs_known += 1;
                }
            } else {
                inner.register(fingerprint);
                if let Some(session) = inner.current.as_mut() {
                    session.stats.jobs_new += 1;
                }
                new_jobs.push(job.clone());
            }
        }

        if let Some(session) = inner.current.as_mut() {
            session.stats.pages_processed += 1;
        }

        debug!(
            page = page_num,
            total = page_jobs.len(),
            new = new_jobs.len(),
            "page processed incrementally"
        );
        new_jobs
    }

    /// Number of fingerprints currently known.
    pub fn known_count(&self) -> usize {
        self.inner.lock().seen.len()
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Rewrite the checkpoint file atomically (tmp + rename).
    pub fn save(&self) -> Result<()> {
        let checkpoint = {
            let inner = self.inner.lock();
            Checkpoint {
                fingerprints: inner.order.iter().cloned().collect(),
                sessions: inner.sessions.clone(),
            }
        };

        if let Some(parent) = self.checkpoint_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create checkpoint dir {}", parent.display())
            })?;
        }

        let content =
            serde_json::to_string_pretty(&checkpoint).context("failed to serialize checkpoint")?;
        let tmp = self.checkpoint_path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write checkpoint tmp {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.checkpoint_path).with_context(|| {
            format!(
                "failed to rename checkpoint to {}",
                self.checkpoint_path.display()
            )
        })?;
        Ok(())
    }
}

fn fingerprint_of(job: &JobRecord) -> String {
    job_fingerprint(&job.title, &job.company, &job.link)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn job(n: usize) -> JobRecord {
        JobRecord::new(
            format!("Desenvolvedor {n}"),
            format!("https://example.com/vagas/{n}"),
            "TechCorp",
            "Remoto",
            "R$ 5.000",
        )
    }

    fn processor(dir: &std::path::Path) -> IncrementalProcessor {
        IncrementalProcessor::new(
            dir.join("checkpoint.json"),
            Arc::new(MetricsRegistry::new()),
        )
    }

    #[test]
    fn unseen_jobs_are_new_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let proc = processor(dir.path());
        let jobs: Vec<JobRecord> = (0..5).map(job).collect();

        proc.start_session();
        let first = proc.process_page_incrementally(&jobs, 1);
        assert_eq!(first.len(), 5);

        let second = proc.process_page_incrementally(&jobs, 2);
        assert!(second.is_empty());
    }

    #[test]
    fn early_stop_when_page_is_mostly_known() {
        let dir = tempfile::tempdir().unwrap();
        let proc = processor(dir.path());
        let jobs: Vec<JobRecord> = (0..20).map(job).collect();

        proc.start_session();
        proc.process_page_incrementally(&jobs, 1);

        let (cont, new_jobs) = proc.should_continue_processing(&jobs, 0.1);
        assert!(!cont);
        assert!(new_jobs.is_empty());

        // A fully fresh page continues.
        let fresh: Vec<JobRecord> = (100..110).map(job).collect();
        let (cont, new_jobs) = proc.should_continue_processing(&fresh, 0.3);
        assert!(cont);
        assert_eq!(new_jobs.len(), 10);
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let dir = tempfile::tempdir().unwrap();
        let proc = processor(dir.path());

        proc.start_session();
        // 7 known, 3 new on a 10-job page: ratio exactly 0.3.
        let known: Vec<JobRecord> = (0..7).map(job).collect();
        proc.process_page_incrementally(&known, 1);

        let mut page: Vec<JobRecord> = (0..7).map(job).collect();
        page.extend((50..53).map(job));
        let (cont, new_jobs) = proc.should_continue_processing(&page, EARLY_STOP_THRESHOLD);
        assert!(cont);
        assert_eq!(new_jobs.len(), 3);
    }

    #[test]
    fn empty_page_stops() {
        let dir = tempfile::tempdir().unwrap();
        let proc = processor(dir.path());
        let (cont, new_jobs) = proc.should_continue_processing(&[], 0.1);
        assert!(!cont);
        assert!(new_jobs.is_empty());
    }

    #[test]
    fn fingerprints_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let jobs: Vec<JobRecord> = (0..10).map(job).collect();

        {
            let proc = processor(dir.path());
            proc.start_session();
            proc.process_page_incrementally(&jobs, 1);
            proc.end_session().unwrap();
        }

        // Session 2 sees all fingerprints from session 1.
        let proc = processor(dir.path());
        assert_eq!(proc.known_count(), 10);
        proc.start_session();
        let (cont, new_jobs) = proc.should_continue_processing(&jobs, 0.1);
        assert!(!cont);
        assert!(new_jobs.is_empty());
    }

    #[test]
    fn session_stats_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let proc = processor(dir.path());
        let jobs: Vec<JobRecord> = (0..4).map(job).collect();

        proc.start_session();
        proc.process_page_incrementally(&jobs, 1);
        proc.process_page_incrementally(&jobs, 2);
        let session = proc.end_session().unwrap().unwrap();

        assert_eq!(session.stats.pages_processed, 2);
        assert_eq!(session.stats.jobs_new, 4);
        assert_eq!(session.stats.jobs_known, 4);
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn time_saved_gauge_reported() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(MetricsRegistry::new());
        let proc = IncrementalProcessor::new(dir.path().join("cp.json"), metrics.clone());
        let jobs: Vec<JobRecord> = (0..6).map(job).collect();

        proc.start_session();
        proc.process_page_incrementally(&jobs, 1);
        proc.process_page_incrementally(&jobs, 2);
        proc.end_session().unwrap();

        assert_eq!(
            metrics.gauge_value("scraper.time_saved_seconds"),
            Some(6.0 * AVG_SECS_PER_JOB)
        );
    }

    #[test]
    fn corrupt_checkpoint_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("checkpoint.json"), "{not json").unwrap();
        let proc = processor(dir.path());
        assert_eq!(proc.known_count(), 0);
    }

    #[test]
    fn end_session_without_start_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let proc = processor(dir.path());
        assert!(proc.end_session().unwrap().is_none());
    }
}
