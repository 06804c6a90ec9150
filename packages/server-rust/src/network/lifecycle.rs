//! Service lifecycle around the utilization cache.
//!
//! [`ServiceLifecycle`] decides what the outside world sees: readiness
//! follows the cache's first successful refresh, draining turns API requests
//! away, and a finished drain shuts the cache down. The phase lives in an
//! `ArcSwap` and the in-flight count in a `watch` channel, so the drain waits
//! on a notification rather than polling.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::UtilizationCache;

/// What health probes report.
///
/// `Starting -> Warming -> Ready -> Draining -> Stopped`. `Warming` and
/// `Ready` differ only in whether the cache has installed a snapshot yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Listener not serving yet.
    Starting,
    /// Serving, but no refresh has succeeded; every tier is empty.
    Warming,
    /// Serving from an installed snapshot.
    Ready,
    /// Waiting for in-flight requests; new API requests get 503.
    Draining,
    /// Drained and the cache is closed.
    Stopped,
}

impl HealthState {
    /// Lowercase name used in health responses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Warming => "warming",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }

    /// Whether new API requests should be admitted.
    #[must_use]
    pub fn accepts_requests(self) -> bool {
        !matches!(self, Self::Draining | Self::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Starting,
    Serving,
    Draining,
    Stopped,
}

/// Owns the cache for the lifetime of the HTTP server.
#[derive(Debug)]
pub struct ServiceLifecycle {
    cache: Arc<UtilizationCache>,
    phase: ArcSwap<Phase>,
    in_flight: Arc<watch::Sender<u64>>,
}

impl ServiceLifecycle {
    #[must_use]
    pub fn new(cache: Arc<UtilizationCache>) -> Self {
        Self {
            cache,
            phase: ArcSwap::from_pointee(Phase::Starting),
            in_flight: Arc::new(watch::Sender::new(0)),
        }
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<UtilizationCache> {
        &self.cache
    }

    /// Marks the listener as serving. Readiness still waits for the cache.
    pub fn mark_serving(&self) {
        self.phase.store(Arc::new(Phase::Serving));
        if !self.cache.is_warm() {
            info!("serving before the first refresh; tiers are empty until it lands");
        }
    }

    #[must_use]
    pub fn health(&self) -> HealthState {
        match **self.phase.load() {
            Phase::Starting => HealthState::Starting,
            Phase::Serving if self.cache.is_warm() => HealthState::Ready,
            Phase::Serving => HealthState::Warming,
            Phase::Draining => HealthState::Draining,
            Phase::Stopped => HealthState::Stopped,
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.health() == HealthState::Ready
    }

    /// Stops admitting API requests. Has no effect once stopped.
    pub fn begin_drain(&self) {
        let previous = self.phase.rcu(|phase| match **phase {
            Phase::Stopped => Phase::Stopped,
            _ => Phase::Draining,
        });
        if matches!(*previous, Phase::Starting | Phase::Serving) {
            info!(in_flight = self.in_flight(), "draining");
        }
    }

    /// Admits one API request, or returns `None` while draining or stopped.
    ///
    /// The request counts as in flight until the guard is dropped.
    #[must_use]
    pub fn admit(&self) -> Option<InFlightGuard> {
        if !self.health().accepts_requests() {
            return None;
        }
        self.in_flight.send_modify(|count| *count += 1);
        Some(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        *self.in_flight.borrow()
    }

    /// Drains in-flight requests for up to `timeout`, then closes the cache.
    ///
    /// The cache is closed and the state becomes `Stopped` either way.
    /// Returns whether every request finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.begin_drain();

        let mut idle = self.in_flight.subscribe();
        let drained = matches!(
            tokio::time::timeout(timeout, idle.wait_for(|count| *count == 0)).await,
            Ok(Ok(_))
        );
        if drained {
            info!("all requests drained");
        } else {
            warn!(in_flight = self.in_flight(), "drain timeout expired");
        }

        self.cache.close().await;
        self.phase.store(Arc::new(Phase::Stopped));
        drained
    }
}

/// Releases its request's in-flight slot when dropped, including on unwind.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<watch::Sender<u64>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.send_modify(|count| *count -= 1);
    }
}
