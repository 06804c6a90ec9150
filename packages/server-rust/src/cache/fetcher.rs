//! Aggregating, marker-based pagination over a [`RecordSource`].
//!
//! The store caps every find at a page size that is independent of (and
//! usually smaller than) the fleet. [`fetch_all`] keeps issuing pages, each
//! resuming one past the last internal id seen, until a page reports that it
//! holds every record its query matched.
//!
//! A node rewritten while the fetch is underway reappears under a higher
//! internal id on a later page. Only its latest copy is kept.

use std::collections::HashSet;
use std::time::Duration;

use storinfo_core::StorageNodeRecord;
use tracing::{debug, trace};

use crate::store::{FindQuery, RecordSource};

use super::RefreshError;

/// Filter and page size applied to every page of one fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchFilter {
    /// Inclusive utilization ceiling.
    pub max_percent_used: f64,
    /// Records written before this epoch-millis instant are too stale.
    pub min_timestamp: u64,
    /// Records requested per round trip.
    pub page_size: usize,
}

impl FetchFilter {
    /// Builds the filter for a fetch starting at `now_millis`.
    #[must_use]
    pub fn new(max_percent_used: f64, lag: Duration, now_millis: u64, page_size: usize) -> Self {
        let lag_millis = u64::try_from(lag.as_millis()).unwrap_or(u64::MAX);
        Self {
            max_percent_used,
            min_timestamp: now_millis.saturating_sub(lag_millis),
            page_size,
        }
    }

    fn query(&self, marker: Option<u64>) -> FindQuery {
        FindQuery {
            max_percent_used: self.max_percent_used,
            min_timestamp: self.min_timestamp,
            marker,
            limit: self.page_size,
        }
    }
}

/// Result of a complete fetch.
#[derive(Debug, Clone, Default)]
pub struct Fetched {
    /// The latest copy of every matching node, in internal-id order.
    pub records: Vec<StorageNodeRecord>,
    /// Round trips issued.
    pub pages: usize,
    /// Older copies dropped because the node was rewritten mid-fetch.
    pub superseded: usize,
}

/// Keeps the last occurrence of every id, preserving relative order.
///
/// Returns the surviving records and how many were dropped.
pub fn latest_per_id(records: Vec<StorageNodeRecord>) -> (Vec<StorageNodeRecord>, usize) {
    let before = records.len();
    let mut seen = HashSet::with_capacity(before);
    let mut latest: Vec<StorageNodeRecord> = records
        .into_iter()
        .rev()
        .filter(|record| seen.insert(record.id.clone()))
        .collect();
    latest.reverse();
    let dropped = before - latest.len();
    (latest, dropped)
}

/// Pulls every record matching `filter` out of `source`.
///
/// The timestamp bound is fixed for the whole fetch so later pages do not
/// see a moving staleness window.
///
/// # Errors
///
/// Returns [`RefreshError::Fetch`] if any page fails; records already
/// gathered are dropped. Returns [`RefreshError::MarkerStalled`] if the store
/// hands back records below the requested marker.
pub async fn fetch_all(
    source: &dyn RecordSource,
    filter: &FetchFilter,
) -> Result<Fetched, RefreshError> {
    let mut records = Vec::new();
    let mut marker: Option<u64> = None;
    let mut pages = 0usize;

    loop {
        pages += 1;
        let page = source
            .find_page(&filter.query(marker))
            .await
            .map_err(|source| RefreshError::Fetch { page: pages, source })?;

        let returned = page.records.len();
        let Some(last_id) = page.records.last().map(|r| r.internal_id) else {
            break;
        };
        if let Some(first) = page.records.first() {
            if marker.is_some_and(|m| first.internal_id < m) {
                return Err(RefreshError::MarkerStalled {
                    marker: marker.unwrap_or_default(),
                    returned: first.internal_id,
                });
            }
        }

        records.extend(page.records.into_iter().map(|stored| stored.record));
        trace!(page = pages, returned, total = page.total, "fetched page");

        // `total` counts matches for this query's marker, so the page is the
        // tail exactly when it returned everything the query matched.
        if u64::try_from(returned).unwrap_or(u64::MAX) >= page.total {
            break;
        }
        let Some(next) = last_id.checked_add(1) else {
            break;
        };
        marker = Some(next);
    }

    let (records, superseded) = latest_per_id(records);
    if superseded > 0 {
        debug!(superseded, "dropped copies of nodes rewritten during fetch");
    }
    Ok(Fetched {
        records,
        pages,
        superseded,
    })
}
