//! The utilization cache: periodic refresh, flush coordination, snapshot swap.
//!
//! [`UtilizationCache`] owns the only mutable shared state in the service.
//! A single background worker drives every refresh through
//! `Idle -> Fetching -> Building -> Swapping -> Idle`, then sleeps for the
//! refresh interval. Readers call [`UtilizationCache::current_snapshots`],
//! which is a lock-free `ArcSwap` load; the handle they get stays valid and
//! unchanged for as long as they hold it, whatever the worker installs next.
//!
//! Refresh failures never escape the worker: they are logged, the previous
//! pair keeps serving, and the next attempt happens one interval later.

pub mod config;
pub mod fetcher;
pub mod worker;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use storinfo_core::{
    build_snapshots, ClockSource, PageLimits, PageQueryService, RecordError, SnapshotPair,
    StorageNodeRecord, SystemClock,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info, trace, warn};

pub use config::{CacheConfig, MAX_FETCH_PAGE_SIZE};
pub use fetcher::{fetch_all, latest_per_id, FetchFilter, Fetched};
pub use worker::{BackgroundRunnable, BackgroundWorker};

use crate::store::RecordFeed;

// ---------------------------------------------------------------------------
// Errors and reports
// ---------------------------------------------------------------------------

/// Why a single refresh cycle failed.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("backing store query failed on page {page}: {source}")]
    Fetch {
        page: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("backing store returned internal id {returned} below marker {marker}")]
    MarkerStalled { marker: u64, returned: u64 },
    #[error("snapshot build failed: {0}")]
    Build(#[from] RecordError),
}

/// Errors returned to callers of [`UtilizationCache::refresh_now`].
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache refresh worker is not running")]
    WorkerStopped,
    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

/// Outcome of a successful refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Generation of the installed pair.
    pub generation: u64,
    pub eligible: usize,
    pub operator: usize,
    /// Backing-store round trips; 0 for a fixed dataset.
    pub pages: usize,
}

/// Where the refresh worker currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    /// Waiting for the next tick or flush.
    Idle,
    /// Backing-store pages in flight.
    Fetching,
    /// Partitioning and sorting.
    Building,
    /// Installing the new pair.
    Swapping,
}

impl RefreshState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshState::Idle => "idle",
            RefreshState::Fetching => "fetching",
            RefreshState::Building => "building",
            RefreshState::Swapping => "swapping",
        }
    }
}

// ---------------------------------------------------------------------------
// CacheView
// ---------------------------------------------------------------------------

/// What a request handler works against: one installed pair plus the page
/// settings in force.
#[derive(Debug, Clone)]
pub struct CacheView {
    pair: Arc<SnapshotPair>,
    limits: PageLimits,
}

impl CacheView {
    #[must_use]
    pub fn pair(&self) -> &SnapshotPair {
        &self.pair
    }

    #[must_use]
    pub fn limits(&self) -> PageLimits {
        self.limits
    }

    /// A query service configured with this view's page limits.
    #[must_use]
    pub fn query_service(&self) -> PageQueryService {
        PageQueryService::new(self.limits)
    }
}

// ---------------------------------------------------------------------------
// CacheRefresher (runs on the worker)
// ---------------------------------------------------------------------------

/// Work submitted to the refresh worker.
#[derive(Debug)]
pub enum RefreshTask {
    /// Refresh now and report once the new pair is visible.
    Flush {
        done: oneshot::Sender<Result<RefreshSummary, RefreshError>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    Flush,
}

/// State shared between the cache handle and its worker.
struct Shared {
    snapshots: ArcSwap<SnapshotPair>,
    state: ArcSwap<RefreshState>,
    flush_pending: AtomicBool,
}

struct CacheRefresher {
    feed: RecordFeed,
    config: Arc<CacheConfig>,
    clock: Arc<dyn ClockSource>,
    shared: Arc<Shared>,
    generation: u64,
}

impl CacheRefresher {
    fn set_state(&self, state: RefreshState) {
        trace!(state = state.as_str(), "refresh state");
        self.shared.state.store(Arc::new(state));
    }

    async fn refresh(&mut self, trigger: Trigger) -> Result<RefreshSummary, RefreshError> {
        let result = self.cycle(trigger).await;
        self.set_state(RefreshState::Idle);
        result
    }

    async fn cycle(&mut self, trigger: Trigger) -> Result<RefreshSummary, RefreshError> {
        self.set_state(RefreshState::Fetching);
        let (records, pages) = self.collect().await?;

        // A pending flush means the caller treats the current pair as stale,
        // so install without yielding. Otherwise let queued reads run first.
        let inline = trigger == Trigger::Flush || self.shared.flush_pending.load(Ordering::SeqCst);
        if !inline {
            tokio::task::yield_now().await;
        }

        self.set_state(RefreshState::Building);
        let (eligible, operator) = build_snapshots(records, self.config.thresholds)?;

        self.set_state(RefreshState::Swapping);
        self.generation += 1;
        let summary = RefreshSummary {
            generation: self.generation,
            eligible: eligible.len(),
            operator: operator.len(),
            pages,
        };
        self.shared.snapshots.store(Arc::new(SnapshotPair {
            eligible,
            operator,
            generation: self.generation,
            refreshed_at: Some(self.clock.now()),
        }));
        if inline {
            self.shared.flush_pending.store(false, Ordering::SeqCst);
        }

        debug!(
            generation = summary.generation,
            eligible = summary.eligible,
            operator = summary.operator,
            pages = summary.pages,
            inline,
            "installed new snapshots"
        );
        Ok(summary)
    }

    async fn collect(&self) -> Result<(Vec<StorageNodeRecord>, usize), RefreshError> {
        let ceiling = self.config.thresholds.operator_utilization;
        match &self.feed {
            RecordFeed::Store(source) => {
                let filter = FetchFilter::new(
                    ceiling,
                    self.config.lag,
                    self.clock.now(),
                    self.config.fetch_page_size,
                );
                let fetched = fetch_all(source.as_ref(), &filter).await?;
                Ok((fetched.records, fetched.pages))
            }
            RecordFeed::Fixed(records) => {
                let (records, _) = latest_per_id(
                    records
                        .iter()
                        .filter(|r| r.percent_used <= ceiling)
                        .cloned()
                        .collect(),
                );
                Ok((records, 0))
            }
        }
    }
}

#[async_trait]
impl BackgroundRunnable for CacheRefresher {
    type Task = RefreshTask;

    async fn run(&mut self, task: RefreshTask) {
        match task {
            RefreshTask::Flush { done } => {
                let result = self.refresh(Trigger::Flush).await;
                if let Err(e) = &result {
                    error!(error = %e, "flush refresh failed (will retry)");
                }
                // The caller may have given up waiting.
                let _ = done.send(result);
            }
        }
    }

    async fn on_tick(&mut self) {
        if let Err(e) = self.refresh(Trigger::Scheduled).await {
            error!(error = %e, "scheduled refresh failed (will retry)");
        }
    }

    async fn shutdown(&mut self) {
        debug!("refresh worker stopped");
    }
}

// ---------------------------------------------------------------------------
// UtilizationCache
// ---------------------------------------------------------------------------

/// Read-through cache of the storage fleet's utilization.
///
/// Construct one per process with [`start`](Self::start), share it behind an
/// `Arc`, and call [`close`](Self::close) on shutdown.
pub struct UtilizationCache {
    config: Arc<CacheConfig>,
    feed: RecordFeed,
    shared: Arc<Shared>,
    worker: Mutex<Option<BackgroundWorker<CacheRefresher>>>,
}

impl UtilizationCache {
    /// Starts the cache and its refresh worker using the system clock.
    ///
    /// The first refresh begins immediately; until it succeeds, both
    /// snapshots are empty. Must be called within a tokio runtime.
    #[must_use]
    pub fn start(config: CacheConfig, feed: RecordFeed) -> Self {
        Self::start_with_clock(config, feed, Arc::new(SystemClock))
    }

    /// Like [`start`](Self::start) with an explicit clock for staleness checks.
    #[must_use]
    pub fn start_with_clock(
        config: CacheConfig,
        feed: RecordFeed,
        clock: Arc<dyn ClockSource>,
    ) -> Self {
        if config.thresholds.operator_utilization < config.thresholds.utilization {
            warn!(
                utilization = config.thresholds.utilization,
                operator_utilization = config.thresholds.operator_utilization,
                "operator ceiling is below the eligible ceiling; eligible nodes above it are never fetched"
            );
        }

        let config = Arc::new(config);
        let shared = Arc::new(Shared {
            snapshots: ArcSwap::from_pointee(SnapshotPair::empty()),
            state: ArcSwap::from_pointee(RefreshState::Idle),
            flush_pending: AtomicBool::new(false),
        });
        let refresher = CacheRefresher {
            feed: feed.clone(),
            config: Arc::clone(&config),
            clock,
            shared: Arc::clone(&shared),
            generation: 0,
        };
        let worker = BackgroundWorker::start(refresher, config.refresh_interval);

        let cache = Self {
            config,
            feed,
            shared,
            worker: Mutex::new(Some(worker)),
        };
        info!("utilization cache started: {cache}");
        cache
    }

    /// Runs one fetch, build and swap cycle and waits for it.
    ///
    /// When this returns `Ok`, the new pair is already installed, so any read
    /// issued afterwards observes it. If a scheduled refresh is mid-fetch,
    /// that refresh installs inline as soon as its fetch completes, and this
    /// call then performs its own cycle.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Refresh`] if the cycle failed (the previous pair
    /// keeps serving) or [`CacheError::WorkerStopped`] after [`close`](Self::close).
    pub async fn refresh_now(&self) -> Result<RefreshSummary, CacheError> {
        let tx = self
            .worker
            .lock()
            .as_ref()
            .and_then(BackgroundWorker::sender)
            .ok_or(CacheError::WorkerStopped)?;

        self.shared.flush_pending.store(true, Ordering::SeqCst);
        let (done, rx) = oneshot::channel();
        tx.send(RefreshTask::Flush { done })
            .await
            .map_err(|_| CacheError::WorkerStopped)?;
        let summary = rx.await.map_err(|_| CacheError::WorkerStopped)??;
        Ok(summary)
    }

    /// Returns the installed pair and page settings. Never blocks.
    #[must_use]
    pub fn current_snapshots(&self) -> CacheView {
        CacheView {
            pair: self.shared.snapshots.load_full(),
            limits: self.config.page_limits,
        }
    }

    /// Current position of the refresh worker in its cycle.
    #[must_use]
    pub fn refresh_state(&self) -> RefreshState {
        **self.shared.state.load()
    }

    /// Whether a flush is waiting for its inline swap.
    #[must_use]
    pub fn flush_pending(&self) -> bool {
        self.shared.flush_pending.load(Ordering::SeqCst)
    }

    /// Whether at least one refresh has succeeded.
    #[must_use]
    pub fn is_warm(&self) -> bool {
        self.shared.snapshots.load().generation > 0
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Stops the refresh worker and releases the backing-store connection.
    ///
    /// Waits for a refresh already in progress. Calling `close` again is a
    /// no-op.
    pub async fn close(&self) {
        let worker = self.worker.lock().take();
        let Some(mut worker) = worker else {
            return;
        };
        worker.stop().await;

        if let RecordFeed::Store(source) = &self.feed {
            if let Err(e) = source.close().await {
                warn!(error = %e, "failed to close backing store");
            }
        }
        info!("utilization cache closed");
    }
}

impl fmt::Display for UtilizationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[UtilizationCache refresh_interval={:?}, lag={:?}, source={}]",
            self.config.refresh_interval, self.config.lag, self.feed
        )
    }
}

impl fmt::Debug for UtilizationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtilizationCache")
            .field("config", &self.config)
            .field("feed", &self.feed)
            .field("generation", &self.shared.snapshots.load().generation)
            .field("state", &self.refresh_state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
