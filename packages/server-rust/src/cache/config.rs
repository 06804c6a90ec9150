use std::time::Duration;

use storinfo_core::{PageLimits, Thresholds};

/// Largest page the fetcher may request from the backing store per round trip.
pub const MAX_FETCH_PAGE_SIZE: usize = 1_000;

/// Settings for one [`UtilizationCache`](super::UtilizationCache).
///
/// Controls the refresh cadence, the staleness window, the tier ceilings and
/// both the backing-store and response page sizes.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Delay between the end of one refresh and the start of the next.
    pub refresh_interval: Duration,
    /// Records older than `now - lag` are excluded from a fetch.
    pub lag: Duration,
    /// Eligible and operator utilization ceilings.
    pub thresholds: Thresholds,
    /// Records requested per backing-store round trip.
    pub fetch_page_size: usize,
    /// Default and maximum response page sizes.
    pub page_limits: PageLimits,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            lag: Duration::from_secs(60 * 60),
            thresholds: Thresholds::default(),
            fetch_page_size: 100,
            page_limits: PageLimits::default(),
        }
    }
}
