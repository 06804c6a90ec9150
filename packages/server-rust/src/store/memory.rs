//! Process-local [`RecordSource`] implementation.
//!
//! [`InMemoryRecordSource`] mimics the storage bucket closely enough to
//! exercise the page fetcher end to end: records are keyed by node id, each
//! write assigns a fresh, strictly increasing internal id (as the bucket does
//! on update), and [`find_page`](RecordSource::find_page) reports the total
//! match count independently of the page limit.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use storinfo_core::StorageNodeRecord;

use super::{FindPage, FindQuery, RecordSource, StoredRecord};

/// In-memory storage bucket.
#[derive(Debug)]
pub struct InMemoryRecordSource {
    /// Keyed by internal id so finds come out in id order.
    rows: RwLock<BTreeMap<u64, StorageNodeRecord>>,
    next_id: AtomicU64,
    queries: AtomicU64,
}

impl InMemoryRecordSource {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            queries: AtomicU64::new(0),
        }
    }

    /// Creates a store pre-populated with `records`, in order.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = StorageNodeRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.upsert(record);
        }
        store
    }

    /// Inserts or replaces the record for `record.id`, assigning it a new
    /// internal id. Returns that id.
    pub fn upsert(&self, record: StorageNodeRecord) -> u64 {
        let internal_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.rows.write();
        rows.retain(|_, existing| existing.id != record.id);
        rows.insert(internal_id, record);
        internal_id
    }

    /// Removes the record for `id`. Returns whether one existed.
    pub fn remove(&self, id: &str) -> bool {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|_, existing| existing.id != id);
        rows.len() != before
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Number of `find_page` calls served so far.
    #[must_use]
    pub fn query_count(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryRecordSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordSource for InMemoryRecordSource {
    async fn find_page(&self, query: &FindQuery) -> anyhow::Result<FindPage> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let rows = self.rows.read();

        let mut total = 0u64;
        let mut records = Vec::with_capacity(query.limit.min(rows.len()));
        for (internal_id, record) in rows.iter() {
            let stored = StoredRecord {
                internal_id: *internal_id,
                record: record.clone(),
            };
            if !query.matches(&stored) {
                continue;
            }
            total += 1;
            if records.len() < query.limit {
                records.push(stored);
            }
        }

        Ok(FindPage { records, total })
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn describe(&self) -> String {
        format!("in-memory bucket ({} records)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(instance: u64, pct: f64) -> StorageNodeRecord {
        StorageNodeRecord::new(format!("{instance}.stor.x.y"), pct, 1_000)
    }

    fn query(limit: usize, marker: Option<u64>) -> FindQuery {
        FindQuery {
            max_percent_used: 92.0,
            min_timestamp: 0,
            marker,
            limit,
        }
    }

    #[tokio::test]
    async fn pages_by_internal_id_and_reports_total() {
        let store = InMemoryRecordSource::with_records((1..=5).map(|i| node(i, 10.0)));

        let page = store.find_page(&query(2, None)).await.unwrap();
        assert_eq!(page.total, 5);
        let ids: Vec<u64> = page.records.iter().map(|r| r.internal_id).collect();
        assert_eq!(ids, vec![1, 2]);

        let page = store.find_page(&query(2, Some(3))).await.unwrap();
        assert_eq!(page.total, 3, "total counts the marker predicate");
        let ids: Vec<u64> = page.records.iter().map(|r| r.internal_id).collect();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(store.query_count(), 2);
    }

    #[tokio::test]
    async fn upsert_reassigns_internal_id() {
        let store = InMemoryRecordSource::with_records([node(1, 10.0), node(2, 10.0)]);
        let id = store.upsert(node(1, 50.0));
        assert_eq!(id, 3);
        assert_eq!(store.len(), 2);

        let page = store.find_page(&query(10, None)).await.unwrap();
        let order: Vec<&str> = page.records.iter().map(|r| r.record.id.as_str()).collect();
        assert_eq!(order, vec!["2.stor.x.y", "1.stor.x.y"]);
    }

    #[tokio::test]
    async fn filters_by_ceiling() {
        let store = InMemoryRecordSource::with_records([node(1, 10.0), node(2, 95.0)]);
        let page = store.find_page(&query(10, None)).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].record.id, "1.stor.x.y");
    }

    #[test]
    fn remove_reports_presence() {
        let store = InMemoryRecordSource::with_records([node(1, 10.0)]);
        assert!(store.remove("1.stor.x.y"));
        assert!(!store.remove("1.stor.x.y"));
        assert!(store.is_empty());
    }
}
