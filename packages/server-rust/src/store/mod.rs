//! Backing-store access for the utilization cache.
//!
//! Storage nodes write their utilization records into one bucket of a
//! sharded key-value store. [`RecordSource`] is the narrow slice of that
//! store the cache consumes: a filtered find, sorted by the store's internal
//! record id, bounded by a page size, and reporting the total number of
//! records the filter matched.
//!
//! Implementations:
//! - [`InMemoryRecordSource`]: process-local store for tests and tooling
//! - `PostgresRecordSource` (feature `postgres`): the bucket's backing table

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use storinfo_core::StorageNodeRecord;

pub use memory::InMemoryRecordSource;
#[cfg(feature = "postgres")]
pub use postgres::PostgresRecordSource;

/// Name of the bucket holding storage node records.
pub const STORAGE_BUCKET: &str = "manta_storage";

/// One bounded find request.
#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    /// Only records with `percentUsed <= max_percent_used` match.
    pub max_percent_used: f64,
    /// Only records with `timestamp >= min_timestamp` match.
    pub min_timestamp: u64,
    /// Only records with internal id `>= marker` match. `None` on the first page.
    pub marker: Option<u64>,
    /// Maximum number of records to return.
    pub limit: usize,
}

impl FindQuery {
    /// Evaluates the filter (without the limit) against one stored record.
    #[must_use]
    pub fn matches(&self, stored: &StoredRecord) -> bool {
        stored.record.percent_used <= self.max_percent_used
            && stored.record.timestamp >= self.min_timestamp
            && self.marker.map_or(true, |m| stored.internal_id >= m)
    }
}

/// A record as held by the store, tagged with its internal id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Opaque, monotonically increasing per-record id assigned by the store.
    pub internal_id: u64,
    pub record: StorageNodeRecord,
}

/// One page of find results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindPage {
    /// Records ascending by `internal_id`, at most `limit` of them.
    pub records: Vec<StoredRecord>,
    /// Number of records matching the query's filter (marker included) when
    /// the query ran, regardless of `limit`.
    pub total: u64,
}

/// Read-only access to the storage bucket.
///
/// Used as `Arc<dyn RecordSource>`; the cache owns the only handle.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Runs one bounded find.
    async fn find_page(&self, query: &FindQuery) -> anyhow::Result<FindPage>;

    /// Releases connections held by the source.
    async fn close(&self) -> anyhow::Result<()>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String;
}

/// Where a refresh gets its raw records from.
#[derive(Clone)]
pub enum RecordFeed {
    /// Query the backing store.
    Store(Arc<dyn RecordSource>),
    /// Serve a fixed dataset and never touch a store.
    ///
    /// Each refresh still applies the operator utilization ceiling to the
    /// dataset, so records above it appear in neither tier. Staleness is not
    /// checked, and a repeated id keeps its last entry.
    Fixed(Arc<[StorageNodeRecord]>),
}

impl RecordFeed {
    /// Wraps a concrete source.
    pub fn store(source: impl RecordSource + 'static) -> Self {
        RecordFeed::Store(Arc::new(source))
    }

    /// Wraps a fixed dataset.
    #[must_use]
    pub fn fixed(records: Vec<StorageNodeRecord>) -> Self {
        RecordFeed::Fixed(records.into())
    }

    /// Loads a fixed dataset from a JSON array of records.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not a JSON array of
    /// storage node records.
    pub fn from_json_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read test dataset {}: {e}", path.display()))?;
        let records: Vec<StorageNodeRecord> = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse test dataset {}: {e}", path.display()))?;
        Ok(Self::fixed(records))
    }
}

impl fmt::Display for RecordFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordFeed::Store(source) => f.write_str(&source.describe()),
            RecordFeed::Fixed(records) => write!(f, "fixed dataset ({} records)", records.len()),
        }
    }
}

impl fmt::Debug for RecordFeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecordFeed").field(&self.to_string()).finish()
    }
}
