// =============================================================================
// Scrape Orchestrator — drives the pipeline end to end
// =============================================================================
//
// Composition root of the engine. Owns every subsystem, starts the
// background workers (alert maintenance, notification dispatch, pool
// sweeper, cache sweeper, optional metrics export), paginates each target
// URL, and shuts everything down with a bounded drain.
//
// Per page: consult the cache; on a miss, lease a page from the pool, then
// run the fetch through the `scraping` circuit with the retry policy
// inside, pacing each attempt through the rate limiter and extracting job
// cards with the selector engine. Extracted records flow through the
// incremental processor (which may end pagination early) and, after all
// targets, through the deduplicator before being written to the run-result
// file.
//
// The lease is taken before the circuit and the retry engine ever run: an
// exhausted pool is local contention, not evidence against the remote
// source, so it gets a warning and exactly one backed-off retry of its own
// and never touches the circuit's failure accounting or the generic retry
// budget.
//
// Failure semantics: a failed page is logged and counted, never fatal; an
// open circuit stops further work against that target until recovery; only
// initialization errors abort the run.
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::alerts::AlertEngine;
use crate::cache::CompressedCache;
use crate::circuit::CircuitBreakerManager;
use crate::config::RuntimeConfig;
use crate::dedup::JobDeduplicator;
use crate::errors::{ScrapeError, ScrapeResult};
use crate::extract::{Field, SelectorEngine};
use crate::fetcher::{ElementHandle, Fetcher, SelectorKind};
use crate::incremental::IncrementalProcessor;
use crate::logger::{Component, LogFields, StructuredLogger};
use crate::metrics::MetricsRegistry;
use crate::pool::PagePool;
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryEngine, RetryPolicy};
use crate::types::{JobRecord, RunReport, ScrapeTarget};

/// Anchor selector identifying job cards on a listing page.
const JOB_CARD_SELECTOR: &str = r#"h2 a[href*="/vagas/"]"#;

/// Name of the circuit guarding page fetches.
const FETCH_CIRCUIT: &str = "scraping";

/// Budget for draining background workers on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Placeholder values for fields the extractor could not fill.
const UNKNOWN_COMPANY: &str = "Empresa não identificada";
const UNKNOWN_LOCATION: &str = "Não informada";
const UNKNOWN_SALARY: &str = "Não informado";

// =============================================================================
// Orchestrator
// =============================================================================

/// Engine composition root; one instance drives one or more runs.
pub struct ScrapeOrchestrator {
    config: RuntimeConfig,
    logger: Arc<StructuredLogger>,
    metrics: Arc<MetricsRegistry>,
    alerts: Arc<AlertEngine>,
    cache: Arc<CompressedCache>,
    incremental: Arc<IncrementalProcessor>,
    pool: Arc<PagePool>,
    selectors: Arc<SelectorEngine>,
    retry: Arc<RetryEngine>,
    retry_policy: RetryPolicy,
    circuits: Arc<CircuitBreakerManager>,
    limiter: Arc<RateLimiter>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ScrapeOrchestrator {
    /// Build every subsystem from `config`. Errors here are the run-fatal
    /// kind: unusable log or cache directories, bad channel configs.
    pub fn new(config: RuntimeConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let logger = Arc::new(
            StructuredLogger::new(&config.logging.dir).context("failed to initialize logger")?,
        );
        let metrics = Arc::new(MetricsRegistry::new());

        let alerts = Arc::new(AlertEngine::new(
            &config.alerts.channels,
            metrics.clone(),
            logger.clone(),
            config.alerts.auto_resolve_acknowledged,
        ));
        metrics.bind_alerts(Arc::downgrade(&alerts));
        alerts.add_default_rules();
        for rule in &config.alerts.rules {
            alerts.add_rule(rule.clone());
        }

        let cache = Arc::new(
            CompressedCache::new(
                &config.cache.dir,
                chrono::Duration::hours(config.cache.max_age_hours as i64),
                metrics.clone(),
            )
            .context("failed to initialize cache")?,
        );

        let incremental = Arc::new(IncrementalProcessor::new(
            &config.incremental.checkpoint_path,
            metrics.clone(),
        ));

        let pool = Arc::new(PagePool::new(fetcher, config.pool.clone(), metrics.clone()));

        let selectors = Arc::new(SelectorEngine::new(metrics.clone()));
        let retry = Arc::new(RetryEngine::new(metrics.clone()));
        let retry_policy = config.retry.to_policy();
        let circuits = Arc::new(CircuitBreakerManager::new(metrics.clone(), alerts.clone()));
        let limiter = Arc::new(RateLimiter::new(
            config.scraping.requests_per_second,
            config.scraping.burst,
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config,
            logger,
            metrics,
            alerts,
            cache,
            incremental,
            pool,
            selectors,
            retry,
            retry_policy,
            circuits,
            limiter,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Handles for observing the run from outside.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    pub fn alerts(&self) -> Arc<AlertEngine> {
        self.alerts.clone()
    }

    /// Ask a running `run()` to stop after the current page.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    // -------------------------------------------------------------------------
    // Run
    // -------------------------------------------------------------------------

    /// Execute one full run over the configured targets.
    pub async fn run(&self) -> Result<RunReport> {
        let started_at = Utc::now();
        let workers = self.spawn_background_workers();

        self.logger.info(
            Component::Scraper,
            "scraping session started",
            LogFields::operation("scraping_session").with_context(json!({
                "targets": self.config.scraping.targets.len(),
                "max_pages": self.config.scraping.max_pages,
                "incremental": self.config.incremental.enabled,
            })),
        );

        if self.config.incremental.enabled {
            self.incremental.start_session();
        }

        let mut report = RunReport {
            started_at: Some(started_at),
            ..RunReport::default()
        };
        let mut collected: Vec<JobRecord> = Vec::new();

        let targets = self.config.scraping.targets.clone();
        for target in &targets {
            if *self.shutdown_rx.borrow() {
                warn!("shutdown requested; skipping remaining targets");
                break;
            }
            crate::logger::in_trace(self.scrape_target(target, &mut report, &mut collected))
                .await;
        }

        report.jobs_found = collected.len() as u64;

        // Cross-run dedup across the whole collected set.
        let mut deduplicator = JobDeduplicator::new(self.metrics.clone());
        let unique = deduplicator.deduplicate(collected);
        report.jobs_after_dedup = unique.len() as u64;

        // Quality: share of records with every core field populated.
        let quality = if unique.is_empty() {
            100.0
        } else {
            let complete = unique.iter().filter(|j| j.is_complete()).count();
            complete as f64 / unique.len() as f64 * 100.0
        };
        self.metrics.set_gauge("validation.quality_score", quality);
        report.quality_score = quality;

        if self.config.incremental.enabled {
            if let Err(e) = self.incremental.end_session() {
                warn!(error = %e, "failed to persist incremental checkpoint");
            }
        }

        if !unique.is_empty() {
            match self.write_result_file(&unique, started_at) {
                Ok(path) => report.result_file = Some(path.display().to_string()),
                Err(e) => warn!(error = %e, "failed to write result file"),
            }
        }

        report.ended_at = Some(Utc::now());
        report.cache_hits = self.metrics.counter_value("cache.hits");
        report.success_rate = self
            .metrics
            .gauge_value("scraper.success_rate")
            .unwrap_or(100.0);

        self.logger.info(
            Component::Scraper,
            "scraping session completed",
            LogFields::operation("scraping_session").with_context(json!({
                "pages_processed": report.pages_processed,
                "pages_failed": report.pages_failed,
                "jobs_found": report.jobs_found,
                "jobs_after_dedup": report.jobs_after_dedup,
                "quality_score": report.quality_score,
                "active_alerts": self.alerts.stats().active,
            })),
        );

        self.drain_background_workers(workers).await;
        self.pool.shutdown().await;
        self.cache.sweep();

        Ok(report)
    }

    // -------------------------------------------------------------------------
    // Per-target pagination
    // -------------------------------------------------------------------------

    async fn scrape_target(
        &self,
        target: &ScrapeTarget,
        report: &mut RunReport,
        collected: &mut Vec<JobRecord>,
    ) {
        let max_pages = target.max_pages.unwrap_or(self.config.scraping.max_pages);
        info!(url = %target.url, max_pages, "scraping target");

        for page_num in 1..=max_pages {
            if *self.shutdown_rx.borrow() {
                return;
            }

            let page_url = page_url_for(&target.url, page_num);
            let tracker = self.logger.track(Component::Scraper, "process_page");
            let page_started = std::time::Instant::now();

            let outcome = self.process_page(&page_url).await;
            let elapsed = page_started.elapsed().as_secs_f64();
            self.metrics
                .record_timer("scraper.page_processing_time", elapsed);

            match outcome {
                Ok(page_jobs) => {
                    report.pages_processed += 1;
                    self.metrics.increment_counter("scraper.pages_processed", 1);
                    self.metrics
                        .increment_counter("scraper.jobs_found", page_jobs.len() as u64);
                    tracker.finish(
                        true,
                        LogFields::default().with_context(json!({
                            "url": page_url,
                            "jobs": page_jobs.len(),
                        })),
                    );
                    self.publish_page_rates(report);

                    // Incremental gate: register new fingerprints and decide
                    // whether deeper pages are worth fetching.
                    if self.config.incremental.enabled {
                        let (cont, _) = self.incremental.should_continue_processing(
                            &page_jobs,
                            self.config.incremental.early_stop_threshold,
                        );
                        let new_jobs = self
                            .incremental
                            .process_page_incrementally(&page_jobs, page_num);
                        report.jobs_new += new_jobs.len() as u64;
                        collected.extend(new_jobs);

                        if !cont {
                            info!(
                                url = %target.url,
                                page = page_num,
                                "early stop: page is mostly known jobs"
                            );
                            return;
                        }
                    } else {
                        report.jobs_new += page_jobs.len() as u64;
                        collected.extend(page_jobs);
                    }
                }
                Err(error) => {
                    report.pages_failed += 1;
                    self.metrics.increment_counter("scraper.pages_failed", 1);
                    tracker.finish(
                        false,
                        LogFields::default()
                            .with_error(error.to_string())
                            .with_context(json!({"url": page_url})),
                    );
                    self.publish_page_rates(report);

                    match &error {
                        ScrapeError::CircuitOpen { name, retry_in } => {
                            warn!(
                                circuit = %name,
                                retry_in_secs = retry_in,
                                url = %target.url,
                                "circuit open; pausing this target"
                            );
                            return;
                        }
                        ScrapeError::Fatal(_) => return,
                        _ => {
                            // Counted and logged; pagination continues.
                        }
                    }
                }
            }
        }
    }

    fn publish_page_rates(&self, report: &RunReport) {
        let total = report.pages_processed + report.pages_failed;
        if total == 0 {
            return;
        }
        let success = report.pages_processed as f64 / total as f64 * 100.0;
        self.metrics.set_gauge("scraper.success_rate", success);
        self.metrics
            .set_gauge("scraper.error_rate", 100.0 - success);
    }

    // -------------------------------------------------------------------------
    // Per-page fetch + extraction
    // -------------------------------------------------------------------------

    /// Produce the job records of one page, from cache or the live site.
    async fn process_page(&self, page_url: &str) -> ScrapeResult<Vec<JobRecord>> {
        if let Some(payload) = self.cache.get(page_url).await {
            if let Ok(jobs) = serde_json::from_value::<Vec<JobRecord>>(
                payload.get("jobs").cloned().unwrap_or(Value::Null),
            ) {
                self.logger.debug(
                    Component::Cache,
                    "page served from cache",
                    LogFields::default().with_context(json!({"url": page_url})),
                );
                return Ok(jobs);
            }
        }

        // The lease comes first, outside the circuit and the retry engine:
        // pool contention says nothing about the remote source.
        let lease = self.acquire_lease().await?;

        let circuit = self
            .circuits
            .get(FETCH_CIRCUIT, self.config.circuit_config(FETCH_CIRCUIT));

        let result = circuit
            .call(|| {
                self.retry
                    .execute("fetch_page", &self.retry_policy, || {
                        self.fetch_with_lease(&lease, page_url)
                    })
            })
            .await;

        let jobs = match result {
            Ok(jobs) => {
                lease.release(false).await;
                jobs
            }
            Err(e) => {
                // A rejected call never touched the page; anything else may
                // have left it in a bad state.
                let had_error = !matches!(e, ScrapeError::CircuitOpen { .. });
                lease.release(had_error).await;
                return Err(e);
            }
        };

        // Cache the extracted records for future runs; a cache write
        // failure degrades performance, never correctness.
        let payload = json!({"jobs": jobs});
        if let Err(e) = self.cache.set(page_url, payload).await {
            warn!(error = %e, url = page_url, "cache write failed");
        }

        Ok(jobs)
    }

    /// Lease a page from the pool. An exhausted pool gets a warning and
    /// exactly one backed-off retry; the second failure surfaces to the
    /// caller as the page's failure.
    async fn acquire_lease(&self) -> ScrapeResult<crate::pool::PageLease> {
        let timeout = Duration::from_secs(self.config.pool.acquire_timeout_secs);

        match self.pool.acquire(timeout).await {
            Ok(lease) => Ok(lease),
            Err(e @ ScrapeError::PoolExhausted(_)) => {
                self.logger.warn(
                    Component::Pool,
                    "page lease unavailable; backing off for one retry",
                    LogFields::default().with_error(e.to_string()),
                );
                tokio::time::sleep(self.retry_policy.base_delay).await;
                self.pool.acquire(timeout).await
            }
            Err(e) => Err(e),
        }
    }

    /// One fetch attempt on an already-held lease: pace, navigate, extract
    /// all job cards.
    async fn fetch_with_lease(
        &self,
        lease: &crate::pool::PageLease,
        page_url: &str,
    ) -> ScrapeResult<Vec<JobRecord>> {
        self.limiter.acquire().await;
        lease.page().goto(page_url).await?;
        let cards = lease
            .page()
            .query(JOB_CARD_SELECTOR, SelectorKind::Css)
            .await?;
        self.extract_cards(cards).await
    }

    /// Extract a record from every job card, bounded by the configured
    /// per-page concurrency. Card order is not preserved.
    async fn extract_cards(
        &self,
        cards: Vec<Box<dyn ElementHandle>>,
    ) -> ScrapeResult<Vec<JobRecord>> {
        let semaphore = Arc::new(Semaphore::new(self.config.scraping.max_concurrent_jobs.max(1)));
        let mut tasks: JoinSet<Option<JobRecord>> = JoinSet::new();

        for card in cards {
            let semaphore = semaphore.clone();
            let selectors = self.selectors.clone();
            let metrics = self.metrics.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                extract_one_card(card, &selectors, &metrics).await
            });
        }

        let mut jobs = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "card extraction task panicked"),
            }
        }
        Ok(jobs)
    }

    // -------------------------------------------------------------------------
    // Result file
    // -------------------------------------------------------------------------

    fn write_result_file(
        &self,
        jobs: &[JobRecord],
        started_at: chrono::DateTime<Utc>,
    ) -> Result<PathBuf> {
        let dir = &self.config.scraping.result_dir;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create result dir {}", dir.display()))?;

        let stamp = started_at.format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("jobs_{stamp}.json"));

        let document = json!({
            "metadata": {
                "total": jobs.len(),
                "started_at": started_at.to_rfc3339(),
                "ended_at": Utc::now().to_rfc3339(),
            },
            "jobs": jobs,
        });

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&document)?)
            .with_context(|| format!("failed to write result tmp {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename result file {}", path.display()))?;

        info!(path = %path.display(), total = jobs.len(), "result file written");
        Ok(path)
    }

    // -------------------------------------------------------------------------
    // Background workers
    // -------------------------------------------------------------------------

    fn spawn_background_workers(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(
            self.alerts.clone().run_maintenance(self.shutdown_rx.clone()),
        ));
        handles.push(tokio::spawn(
            self.alerts.clone().run_dispatcher(self.shutdown_rx.clone()),
        ));
        handles.push(tokio::spawn(
            self.pool.clone().run_sweeper(self.shutdown_rx.clone()),
        ));

        // Periodic cache sweep.
        {
            let cache = self.cache.clone();
            let mut stop = self.shutdown_rx.clone();
            let interval_secs = self.config.cache.sweep_interval_secs.max(1);
            handles.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(interval_secs));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            cache.sweep();
                        }
                        _ = stop.changed() => return,
                    }
                }
            }));
        }

        // Optional metrics auto-export.
        if self.config.metrics.auto_export {
            let metrics = self.metrics.clone();
            let export_dir = self.config.metrics.export_dir.clone();
            let mut stop = self.shutdown_rx.clone();
            let interval_secs = self.config.metrics.export_interval_secs.max(1);
            handles.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(interval_secs));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = metrics.export_json(&export_dir) {
                                warn!(error = %e, "metrics export failed");
                            }
                        }
                        _ = stop.changed() => return,
                    }
                }
            }));
        }

        handles
    }

    /// Signal every worker to stop and wait out the drain budget.
    async fn drain_background_workers(&self, handles: Vec<JoinHandle<()>>) {
        let _ = self.shutdown_tx.send(true);
        for handle in handles {
            if tokio::time::timeout(DRAIN_TIMEOUT, handle).await.is_err() {
                warn!("background worker did not stop within the drain budget");
            }
        }
    }
}

/// URL of page `page_num` for a listing base URL. Page 1 is the base
/// itself; deeper pages add a `page` query parameter.
fn page_url_for(base: &str, page_num: u32) -> String {
    if page_num <= 1 {
        return base.to_string();
    }
    if base.contains('?') {
        format!("{base}&page={page_num}")
    } else {
        format!("{base}?page={page_num}")
    }
}

/// Build one record from a job-card anchor: title and link come from the
/// anchor itself; the remaining fields go through the selector fallback
/// engine with placeholder defaults.
async fn extract_one_card(
    card: Box<dyn ElementHandle>,
    selectors: &SelectorEngine,
    metrics: &MetricsRegistry,
) -> Option<JobRecord> {
    let link = card.attribute("href").await.ok().flatten()?;
    if !(link.contains("/vagas/") || link.starts_with('/')) {
        warn!(link = %link, "record dropped: link failed validation");
        return None;
    }

    let title = card
        .text()
        .await
        .ok()
        .filter(|t| !t.trim().is_empty())?
        .trim()
        .to_string();

    let root = card.as_ref();
    let company = selectors
        .extract(root, Field::Company)
        .await
        .unwrap_or_else(|| UNKNOWN_COMPANY.to_string());
    let location = selectors
        .extract(root, Field::Location)
        .await
        .unwrap_or_else(|| UNKNOWN_LOCATION.to_string());
    let salary = selectors
        .extract(root, Field::Salary)
        .await
        .unwrap_or_else(|| UNKNOWN_SALARY.to_string());

    let mut job = JobRecord::new(title, link, company, location, salary);
    job.description = selectors.extract(root, Field::Description).await;
    job.requirements = selectors.extract(root, Field::Requirements).await;
    job.benefits = selectors.extract(root, Field::Benefits).await;
    job.experience = selectors.extract(root, Field::Experience).await;
    job.work_mode = selectors.extract(root, Field::WorkMode).await;
    job.publish_date = selectors.extract(root, Field::PublishDate).await;

    metrics.increment_counter("validation.jobs_validated", 1);
    metrics.increment_counter("scraper.jobs_processed", 1);
    Some(job)
}
