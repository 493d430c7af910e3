// =============================================================================
// Connection Pool — reusable browser pages with aging and health
// =============================================================================
//
// Pages are expensive to open, so the pool leases them out and takes them
// back. A page is retired (closed, not reused) when it errored, outlived
// `max_age`, or served more than `max_reuse` leases. A background sweeper
// retires aged idle pages and refills the pool to `min_size`.
//
// Invariant, asserted under the pool lock in debug builds:
//
//     created - retired == idle + leased
//
// A lease that goes out of scope without an explicit release is returned to
// the idle set by its Drop impl, so no page is ever leaked; callers that
// know the page misbehaved should still call `release(lease, true)` so the
// page is retired instead of recycled.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use crate::errors::{ScrapeError, ScrapeResult};
use crate::fetcher::{Fetcher, PageHandle};
use crate::metrics::MetricsRegistry;

// =============================================================================
// Configuration
// =============================================================================

/// Pool sizing and lifecycle parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_min_size")]
    pub min_size: usize,
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// Maximum page lifetime before retirement.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Maximum leases served by one page before retirement.
    #[serde(default = "default_max_reuse")]
    pub max_reuse: u32,
    /// Cadence of the background sweeper.
    #[serde(default = "default_idle_scan_interval_secs")]
    pub idle_scan_interval_secs: u64,
    /// Default wait budget for `acquire`.
    #[serde(default = "default_acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,
}

fn default_min_size() -> usize {
    2
}

fn default_max_size() -> usize {
    8
}

fn default_max_age_secs() -> u64 {
    30 * 60
}

fn default_max_reuse() -> u32 {
    50
}

fn default_idle_scan_interval_secs() -> u64 {
    60
}

fn default_acquire_timeout_secs() -> u64 {
    10
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            max_age_secs: default_max_age_secs(),
            max_reuse: default_max_reuse(),
            idle_scan_interval_secs: default_idle_scan_interval_secs(),
            acquire_timeout_secs: default_acquire_timeout_secs(),
        }
    }
}

impl PoolConfig {
    fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

// =============================================================================
// Pool internals
// =============================================================================

struct PooledPage {
    page: Box<dyn PageHandle>,
    created_at: Instant,
    last_used_at: Instant,
    use_count: u32,
}

impl PooledPage {
    fn new(page: Box<dyn PageHandle>) -> Self {
        let now = Instant::now();
        Self {
            page,
            created_at: now,
            last_used_at: now,
            use_count: 0,
        }
    }

    fn is_aged(&self, max_age: Duration) -> bool {
        self.created_at.elapsed() > max_age
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<PooledPage>,
    leased: usize,
    /// Slots reserved for pages currently being opened; they count against
    /// `max_size` but not against the conservation invariant.
    opening: usize,
    created: u64,
    retired: u64,
}

impl PoolState {
    fn assert_conserved(&self) {
        debug_assert_eq!(
            self.created - self.retired,
            (self.idle.len() + self.leased) as u64,
            "pool lease conservation violated"
        );
    }
}

/// Snapshot of the pool's counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub leased: usize,
    pub created: u64,
    pub retired: u64,
}

/// Lease/return pool of driver pages.
pub struct PagePool {
    fetcher: Arc<dyn Fetcher>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Notify,
    metrics: Arc<MetricsRegistry>,
}

impl PagePool {
    pub fn new(fetcher: Arc<dyn Fetcher>, config: PoolConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            fetcher,
            config,
            state: Mutex::new(PoolState::default()),
            available: Notify::new(),
            metrics,
        }
    }

    // -------------------------------------------------------------------------
    // Acquire / release
    // -------------------------------------------------------------------------

    /// Lease a page, waiting up to `timeout` for one to become available.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> ScrapeResult<PageLease> {
        let deadline = Instant::now() + timeout;

        loop {
            // Grab an idle page, or reserve a slot for a fresh one.
            let reserve = {
                let mut state = self.state.lock();
                if let Some(mut pooled) = state.idle.pop_front() {
                    pooled.use_count += 1;
                    pooled.last_used_at = Instant::now();
                    state.leased += 1;
                    state.assert_conserved();
                    self.publish_gauges(&state);
                    return Ok(PageLease {
                        pool: Arc::clone(self),
                        page: Some(pooled),
                    });
                }
                if state.leased + state.idle.len() + state.opening < self.config.max_size {
                    // Reserve the slot while the page is being opened so
                    // concurrent acquires cannot overshoot max_size.
                    state.opening += 1;
                    true
                } else {
                    false
                }
            };

            if reserve {
                match self.fetcher.open_page().await {
                    Ok(page) => {
                        let mut pooled = PooledPage::new(page);
                        pooled.use_count = 1;
                        let mut state = self.state.lock();
                        state.opening -= 1;
                        state.leased += 1;
                        state.created += 1;
                        state.assert_conserved();
                        self.publish_gauges(&state);
                        self.metrics.increment_counter("pool.created", 1);
                        return Ok(PageLease {
                            pool: Arc::clone(self),
                            page: Some(pooled),
                        });
                    }
                    Err(e) => {
                        let mut state = self.state.lock();
                        state.opening -= 1;
                        self.publish_gauges(&state);
                        drop(state);
                        self.available.notify_one();
                        return Err(e);
                    }
                }
            }

            // Full up: wait for a release or the deadline.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.metrics.increment_counter("pool.timeouts", 1);
                return Err(ScrapeError::PoolExhausted(timeout));
            }
            if tokio::time::timeout(remaining, self.available.notified())
                .await
                .is_err()
            {
                self.metrics.increment_counter("pool.timeouts", 1);
                return Err(ScrapeError::PoolExhausted(timeout));
            }
        }
    }

    /// Return a leased page. Retires it when it errored, aged out, or hit
    /// the reuse cap; otherwise it goes back to the idle set.
    pub async fn release(&self, mut lease: PageLease, had_error: bool) {
        let pooled = match lease.page.take() {
            Some(pooled) => pooled,
            None => return,
        };
        self.return_page(pooled, had_error).await;
    }

    async fn return_page(&self, pooled: PooledPage, had_error: bool) {
        let retire = had_error
            || pooled.is_aged(self.config.max_age())
            || pooled.use_count > self.config.max_reuse;

        if retire {
            let page = {
                let mut state = self.state.lock();
                state.leased -= 1;
                state.retired += 1;
                state.assert_conserved();
                self.publish_gauges(&state);
                pooled.page
            };
            self.metrics.increment_counter("pool.retired", 1);
            if let Err(e) = page.close().await {
                debug!(error = %e, "retired page close failed");
            }
        } else {
            let mut state = self.state.lock();
            state.leased -= 1;
            let mut pooled = pooled;
            pooled.last_used_at = Instant::now();
            state.idle.push_back(pooled);
            state.assert_conserved();
            self.publish_gauges(&state);
        }

        self.available.notify_one();
    }

    /// Synchronous return used by `PageLease::drop`. The page goes back to
    /// the idle set unconditionally; the sweeper retires it later if it
    /// aged out.
    fn reclaim(&self, mut pooled: PooledPage) {
        let mut state = self.state.lock();
        state.leased -= 1;
        pooled.last_used_at = Instant::now();
        state.idle.push_back(pooled);
        state.assert_conserved();
        self.publish_gauges(&state);
        drop(state);
        self.available.notify_one();
    }

    fn publish_gauges(&self, state: &PoolState) {
        self.metrics.set_gauge("pool.idle", state.idle.len() as f64);
        self.metrics.set_gauge("pool.leased", state.leased as f64);
    }

    // -------------------------------------------------------------------------
    // Sweeping
    // -------------------------------------------------------------------------

    /// One sweeper pass: retire aged idle pages, then refill to `min_size`.
    pub async fn sweep_once(&self) {
        // Phase 1: pull aged pages out under the lock, close them after.
        let aged: Vec<PooledPage> = {
            let mut state = self.state.lock();
            let max_age = self.config.max_age();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            let mut aged = Vec::new();
            while let Some(pooled) = state.idle.pop_front() {
                if pooled.is_aged(max_age) || pooled.use_count > self.config.max_reuse {
                    aged.push(pooled);
                } else {
                    kept.push_back(pooled);
                }
            }
            state.idle = kept;
            state.retired += aged.len() as u64;
            state.assert_conserved();
            self.publish_gauges(&state);
            aged
        };
        if !aged.is_empty() {
            self.metrics
                .increment_counter("pool.retired", aged.len() as u64);
            debug!(count = aged.len(), "sweeper retired aged pages");
        }
        for pooled in aged {
            pooled.page.close().await.ok();
        }

        // Phase 2: refill to min_size.
        loop {
            let needs = {
                let state = self.state.lock();
                state.idle.len() + state.leased < self.config.min_size
            };
            if !needs {
                break;
            }
            match self.fetcher.open_page().await {
                Ok(page) => {
                    let mut state = self.state.lock();
                    state.idle.push_back(PooledPage::new(page));
                    state.created += 1;
                    state.assert_conserved();
                    self.publish_gauges(&state);
                    self.metrics.increment_counter("pool.created", 1);
                    self.available.notify_one();
                }
                Err(e) => {
                    warn!(error = %e, "pool refill failed");
                    break;
                }
            }
        }
    }

    /// Background sweeper loop. Exits when the stop signal flips.
    pub async fn run_sweeper(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.idle_scan_interval_secs.max(1),
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_once().await,
                _ = stop.changed() => {
                    debug!("pool sweeper stopping");
                    return;
                }
            }
        }
    }

    /// Close every idle page. Leased pages are closed as they come back.
    pub async fn shutdown(&self) {
        let idle: Vec<PooledPage> = {
            let mut state = self.state.lock();
            let drained: Vec<PooledPage> = state.idle.drain(..).collect();
            state.retired += drained.len() as u64;
            state.assert_conserved();
            self.publish_gauges(&state);
            drained
        };
        for pooled in idle {
            pooled.page.close().await.ok();
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            leased: state.leased,
            created: state.created,
            retired: state.retired,
        }
    }
}

// =============================================================================
// Lease
// =============================================================================

/// A scoped loan of one pooled page.
pub struct PageLease {
    pool: Arc<PagePool>,
    page: Option<PooledPage>,
}

impl PageLease {
    /// The leased page.
    pub fn page(&self) -> &dyn PageHandle {
        self.page
            .as_ref()
            .expect("lease accessed after release")
            .page
            .as_ref()
    }

    /// Explicit release with an error verdict; preferred over dropping so
    /// misbehaving pages are retired.
    pub async fn release(self, had_error: bool) {
        let pool = Arc::clone(&self.pool);
        pool.release(self, had_error).await;
    }
}

impl Drop for PageLease {
    fn drop(&mut self) {
        if let Some(pooled) = self.page.take() {
            self.pool.reclaim(pooled);
        }
    }
}
