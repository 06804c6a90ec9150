//! Paginated and point queries over a single snapshot.
//!
//! Callers hold one [`Snapshot`] for the whole request, so every page is
//! consistent even if the cache installs a new pair meanwhile. Between
//! requests the snapshot may change underneath a paginating client; cursor
//! resolution therefore falls back to the cursor's sort position when the
//! exact id has disappeared.

use std::collections::HashMap;

use crate::record::{instance_number, StorageNodeRecord};
use crate::snapshot::Snapshot;

/// Query parameter carrying the page size.
pub const PARAM_LIMIT: &str = "limit";
/// Query parameter naming the last id the caller has consumed.
pub const PARAM_AFTER_ID: &str = "after_id";
/// Query parameter requesting a single node.
pub const PARAM_ONLY_ID: &str = "only_id";

/// Default and maximum number of records per response page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLimits {
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for PageLimits {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            max_page_size: 500,
        }
    }
}

/// Broad classification of a [`QueryError`], used to pick a response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// The request itself is malformed.
    Validation,
    /// The request is well-formed but names nothing in the snapshot.
    NotFound,
}

/// Errors produced while validating or answering a query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("invalid limit '{value}': must be an integer between 1 and {max}")]
    InvalidLimit { value: String, max: usize },
    #[error("unknown query parameter '{name}'")]
    UnknownParameter { name: String },
    #[error("after_id and only_id cannot be combined")]
    ConflictingCursors,
    #[error("after_id '{id}' is not a storage node id")]
    MalformedCursor { id: String },
    #[error("storage node '{id}' not found")]
    NotFound { id: String },
    #[error("storage node '{id}' exceeds the utilization ceiling for this listing")]
    FilteredOut { id: String },
    #[error("no storage nodes after '{after_id}'")]
    CursorExhausted { after_id: String },
}

impl QueryError {
    #[must_use]
    pub fn kind(&self) -> QueryErrorKind {
        match self {
            QueryError::InvalidLimit { .. }
            | QueryError::UnknownParameter { .. }
            | QueryError::ConflictingCursors
            | QueryError::MalformedCursor { .. } => QueryErrorKind::Validation,
            QueryError::NotFound { .. }
            | QueryError::FilteredOut { .. }
            | QueryError::CursorExhausted { .. } => QueryErrorKind::NotFound,
        }
    }

    /// Stable machine-readable name for error bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::InvalidLimit { .. } => "InvalidLimit",
            QueryError::UnknownParameter { .. } => "UnknownParameter",
            QueryError::ConflictingCursors => "ConflictingCursors",
            QueryError::MalformedCursor { .. } => "MalformedCursor",
            QueryError::NotFound { .. } => "StorageNodeNotFound",
            QueryError::FilteredOut { .. } => "StorageNodeFilteredOut",
            QueryError::CursorExhausted { .. } => "CursorExhausted",
        }
    }
}

/// A validated listing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListRequest {
    /// A page of at most `limit` records, optionally after a cursor.
    Page {
        limit: usize,
        after_id: Option<String>,
    },
    /// A single record by id.
    Only { id: String },
}

/// One page of a listing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Page<'a> {
    /// Records in ascending instance order.
    pub records: &'a [StorageNodeRecord],
    /// Id to pass as `after_id` for the next page, when more records remain.
    pub next: Option<&'a str>,
    /// Page size the request was served with.
    pub limit: usize,
}

/// Answers listing and lookup requests against a snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PageQueryService {
    limits: PageLimits,
}

impl PageQueryService {
    #[must_use]
    pub fn new(limits: PageLimits) -> Self {
        Self { limits }
    }

    #[must_use]
    pub fn limits(&self) -> PageLimits {
        self.limits
    }

    /// Validates raw query parameters into a [`ListRequest`].
    ///
    /// # Errors
    ///
    /// - [`QueryError::UnknownParameter`] for any key other than `limit`,
    ///   `after_id` or `only_id`
    /// - [`QueryError::ConflictingCursors`] when both `after_id` and
    ///   `only_id` are given
    /// - [`QueryError::InvalidLimit`] unless `limit` is an integer in
    ///   `1..=max_page_size`
    pub fn parse(&self, params: &HashMap<String, String>) -> Result<ListRequest, QueryError> {
        // Sorted so the reported unknown parameter is deterministic.
        let mut unknown: Vec<&String> = params
            .keys()
            .filter(|k| ![PARAM_LIMIT, PARAM_AFTER_ID, PARAM_ONLY_ID].contains(&k.as_str()))
            .collect();
        unknown.sort();
        if let Some(name) = unknown.first() {
            return Err(QueryError::UnknownParameter {
                name: (*name).clone(),
            });
        }

        let limit = match params.get(PARAM_LIMIT) {
            Some(raw) => self.parse_limit(raw)?,
            None => self.limits.default_page_size,
        };

        match (params.get(PARAM_AFTER_ID), params.get(PARAM_ONLY_ID)) {
            (Some(_), Some(_)) => Err(QueryError::ConflictingCursors),
            (None, Some(id)) => Ok(ListRequest::Only { id: id.clone() }),
            (after_id, None) => Ok(ListRequest::Page {
                limit,
                after_id: after_id.cloned(),
            }),
        }
    }

    fn parse_limit(&self, raw: &str) -> Result<usize, QueryError> {
        let invalid = || QueryError::InvalidLimit {
            value: raw.to_string(),
            max: self.limits.max_page_size,
        };
        if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let limit = raw.parse::<usize>().map_err(|_| invalid())?;
        if limit == 0 || limit > self.limits.max_page_size {
            return Err(invalid());
        }
        Ok(limit)
    }

    /// Returns up to `limit` records strictly after `after_id`.
    ///
    /// Without a cursor, a `limit` covering the whole snapshot returns all of
    /// it with no continuation. With a cursor whose id is no longer in the
    /// snapshot, the page starts at the first record sorting after it.
    ///
    /// # Errors
    ///
    /// - [`QueryError::MalformedCursor`] if `after_id` has no instance number
    /// - [`QueryError::CursorExhausted`] if no record sorts after `after_id`
    pub fn list<'a>(
        &self,
        snapshot: &'a Snapshot,
        limit: usize,
        after_id: Option<&str>,
    ) -> Result<Page<'a>, QueryError> {
        let records = snapshot.records();

        let Some(after_id) = after_id else {
            if limit >= records.len() {
                return Ok(Page {
                    records,
                    next: None,
                    limit,
                });
            }
            return Ok(slice_page(records, 0, limit));
        };

        let start = resolve_cursor(snapshot, after_id)?;
        if start >= records.len() {
            return Err(QueryError::CursorExhausted {
                after_id: after_id.to_string(),
            });
        }
        Ok(slice_page(records, start, limit))
    }

    /// Looks up one record by id.
    ///
    /// `fallback` is a looser snapshot (the operator tier when serving the
    /// eligible tier). A hit there means the node exists but was filtered out
    /// of `snapshot`.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::FilteredOut`] when only `fallback` holds the id,
    /// [`QueryError::NotFound`] when neither does.
    pub fn lookup<'a>(
        &self,
        snapshot: &'a Snapshot,
        fallback: Option<&Snapshot>,
        id: &str,
    ) -> Result<&'a StorageNodeRecord, QueryError> {
        if let Some(record) = snapshot.get(id) {
            return Ok(record);
        }
        if fallback.is_some_and(|f| f.get(id).is_some()) {
            return Err(QueryError::FilteredOut { id: id.to_string() });
        }
        Err(QueryError::NotFound { id: id.to_string() })
    }

    /// Runs a parsed request, returning a page in every case.
    ///
    /// `only_id` requests produce a single-record page with no continuation.
    ///
    /// # Errors
    ///
    /// Propagates the errors of [`list`](Self::list) and
    /// [`lookup`](Self::lookup).
    pub fn execute<'a>(
        &self,
        snapshot: &'a Snapshot,
        fallback: Option<&Snapshot>,
        request: &ListRequest,
    ) -> Result<Page<'a>, QueryError> {
        match request {
            ListRequest::Page { limit, after_id } => {
                self.list(snapshot, *limit, after_id.as_deref())
            }
            ListRequest::Only { id } => {
                self.lookup(snapshot, fallback, id)?;
                let index = snapshot
                    .position(id)
                    .ok_or_else(|| QueryError::NotFound { id: id.clone() })?;
                Ok(Page {
                    records: &snapshot.records()[index..=index],
                    next: None,
                    limit: 1,
                })
            }
        }
    }
}

/// Index of the first record to return after `after_id`.
///
/// A present cursor resumes right after itself. An absent cursor resumes at
/// the insertion point of its instance number: the smallest index whose
/// instance sorts strictly after it. The result may equal the snapshot
/// length, meaning nothing remains.
///
/// # Errors
///
/// Returns [`QueryError::MalformedCursor`] if `after_id` has no instance
/// number to position it by.
pub fn resolve_cursor(snapshot: &Snapshot, after_id: &str) -> Result<usize, QueryError> {
    if let Some(index) = snapshot.position(after_id) {
        return Ok(index + 1);
    }
    let key = instance_number(after_id).map_err(|_| QueryError::MalformedCursor {
        id: after_id.to_string(),
    })?;
    Ok(snapshot.keys().partition_point(|k| *k <= key))
}

fn slice_page(records: &[StorageNodeRecord], start: usize, limit: usize) -> Page<'_> {
    let end = start.saturating_add(limit).min(records.len());
    let page = &records[start..end];
    let next = if end < records.len() {
        page.last().map(|r| r.id.as_str())
    } else {
        None
    };
    Page {
        records: page,
        next,
        limit,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn id(instance: u64) -> String {
        format!("{instance}.stor.us-east.example.com")
    }

    fn snapshot_of(instances: &[u64]) -> Snapshot {
        Snapshot::from_records(
            instances
                .iter()
                .map(|i| StorageNodeRecord::new(id(*i), 10.0, 1_000))
                .collect(),
        )
        .unwrap()
    }

    fn instances(page: &Page<'_>) -> Vec<u64> {
        page.records
            .iter()
            .map(|r| r.instance_number().unwrap())
            .collect()
    }

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn service() -> PageQueryService {
        PageQueryService::new(PageLimits {
            default_page_size: 100,
            max_page_size: 500,
        })
    }

    // ---- parse ----

    #[test]
    fn parse_defaults_limit() {
        let request = service().parse(&params(&[])).unwrap();
        assert_eq!(
            request,
            ListRequest::Page {
                limit: 100,
                after_id: None
            }
        );
    }

    #[test]
    fn parse_accepts_limit_and_cursor() {
        let request = service()
            .parse(&params(&[("limit", "2"), ("after_id", "4.stor.x.y")]))
            .unwrap();
        assert_eq!(
            request,
            ListRequest::Page {
                limit: 2,
                after_id: Some("4.stor.x.y".to_string())
            }
        );
    }

    #[test]
    fn parse_rejects_bad_limits_without_clamping() {
        let rejected = [
            "0", "-1", "501", "abc", "1.5", "", "+5", " 5", "5 ", "99999999999999999999999",
        ];
        for raw in rejected {
            let err = service().parse(&params(&[("limit", raw)])).unwrap_err();
            assert_eq!(
                err,
                QueryError::InvalidLimit {
                    value: raw.to_string(),
                    max: 500
                },
                "limit {raw:?}"
            );
            assert_eq!(err.kind(), QueryErrorKind::Validation);
        }
    }

    #[test]
    fn parse_accepts_max_limit() {
        let request = service().parse(&params(&[("limit", "500")])).unwrap();
        assert!(matches!(request, ListRequest::Page { limit: 500, .. }));
    }

    #[test]
    fn parse_rejects_unknown_parameters() {
        let err = service()
            .parse(&params(&[("limit", "2"), ("offset", "3"), ("bogus", "1")]))
            .unwrap_err();
        assert_eq!(
            err,
            QueryError::UnknownParameter {
                name: "bogus".to_string()
            }
        );
    }

    #[test]
    fn parse_rejects_conflicting_cursors() {
        let err = service()
            .parse(&params(&[("after_id", "1.stor.x"), ("only_id", "2.stor.x")]))
            .unwrap_err();
        assert_eq!(err, QueryError::ConflictingCursors);
    }

    #[test]
    fn parse_only_id() {
        let request = service().parse(&params(&[("only_id", "2.stor.x")])).unwrap();
        assert_eq!(
            request,
            ListRequest::Only {
                id: "2.stor.x".to_string()
            }
        );
    }

    // ---- list ----

    #[test]
    fn full_listing_fast_path() {
        let snapshot = snapshot_of(&[1, 2, 3]);
        let page = service().list(&snapshot, 3, None).unwrap();
        assert_eq!(instances(&page), vec![1, 2, 3]);
        assert_eq!(page.next, None);

        let page = service().list(&snapshot, 100, None).unwrap();
        assert_eq!(page.records.len(), 3);
        assert_eq!(page.next, None);
    }

    #[test]
    fn empty_snapshot_lists_empty_without_cursor() {
        let snapshot = Snapshot::empty();
        let page = service().list(&snapshot, 10, None).unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.next, None);
    }

    #[test]
    fn empty_snapshot_with_cursor_is_exhausted() {
        let snapshot = Snapshot::empty();
        let err = service().list(&snapshot, 10, Some(id(1).as_str())).unwrap_err();
        assert_eq!(err.kind(), QueryErrorKind::NotFound);
    }

    #[test]
    fn limit_two_walks_five_nodes() {
        let snapshot = snapshot_of(&[1, 2, 3, 4, 5]);
        let svc = service();

        let first = svc.list(&snapshot, 2, None).unwrap();
        assert_eq!(instances(&first), vec![1, 2]);
        assert_eq!(first.next, Some(id(2).as_str()));

        let second = svc.list(&snapshot, 2, first.next).unwrap();
        assert_eq!(instances(&second), vec![3, 4]);
        assert_eq!(second.next, Some(id(4).as_str()));

        let third = svc.list(&snapshot, 2, second.next).unwrap();
        assert_eq!(instances(&third), vec![5]);
        assert_eq!(third.next, None);
    }

    #[test]
    fn cursor_repair_for_removed_node() {
        let snapshot = snapshot_of(&[1, 2, 3, 5, 8]);
        let svc = service();

        let page = svc.list(&snapshot, 2, Some(id(4).as_str())).unwrap();
        assert_eq!(instances(&page), vec![5, 8]);
        assert_eq!(page.next, None);

        let page = svc.list(&snapshot, 2, Some(id(0).as_str())).unwrap();
        assert_eq!(instances(&page), vec![1, 2]);
        assert_eq!(page.next, Some(id(2).as_str()));

        let err = svc.list(&snapshot, 2, Some(id(9).as_str())).unwrap_err();
        assert_eq!(
            err,
            QueryError::CursorExhausted {
                after_id: id(9)
            }
        );
    }

    #[test]
    fn cursor_on_last_record_is_exhausted() {
        let snapshot = snapshot_of(&[1, 2]);
        let err = service().list(&snapshot, 2, Some(id(2).as_str())).unwrap_err();
        assert_eq!(err.kind(), QueryErrorKind::NotFound);
    }

    #[test]
    fn cursor_with_same_instance_but_other_region_skips_equal_keys() {
        let snapshot = snapshot_of(&[1, 3, 5]);
        let page = service().list(&snapshot, 10, Some("3.stor.elsewhere")).unwrap();
        assert_eq!(instances(&page), vec![5]);
    }

    #[test]
    fn malformed_cursor_is_a_validation_error() {
        let snapshot = snapshot_of(&[1, 2]);
        let err = service().list(&snapshot, 2, Some("nope")).unwrap_err();
        assert_eq!(
            err,
            QueryError::MalformedCursor {
                id: "nope".to_string()
            }
        );
        assert_eq!(err.kind(), QueryErrorKind::Validation);
    }

    #[test]
    fn resolve_cursor_positions() {
        let snapshot = snapshot_of(&[1, 2, 3, 5, 8]);
        assert_eq!(resolve_cursor(&snapshot, &id(1)), Ok(1));
        assert_eq!(resolve_cursor(&snapshot, &id(4)), Ok(3));
        assert_eq!(resolve_cursor(&snapshot, &id(0)), Ok(0));
        assert_eq!(resolve_cursor(&snapshot, &id(8)), Ok(5));
        assert_eq!(resolve_cursor(&snapshot, &id(u64::MAX)), Ok(5));
    }

    // ---- lookup / execute ----

    #[test]
    fn lookup_distinguishes_filtered_from_missing() {
        let eligible = snapshot_of(&[1, 2]);
        let operator = snapshot_of(&[1, 2, 3]);
        let svc = service();

        assert_eq!(svc.lookup(&eligible, Some(&operator), &id(2)).unwrap().id, id(2));
        assert_eq!(
            svc.lookup(&eligible, Some(&operator), &id(3)).unwrap_err(),
            QueryError::FilteredOut { id: id(3) }
        );
        assert_eq!(
            svc.lookup(&eligible, Some(&operator), &id(4)).unwrap_err(),
            QueryError::NotFound { id: id(4) }
        );
        assert_eq!(
            svc.lookup(&operator, None, &id(4)).unwrap_err(),
            QueryError::NotFound { id: id(4) }
        );
    }

    #[test]
    fn execute_only_id_returns_single_record_page() {
        let snapshot = snapshot_of(&[1, 2, 3]);
        let request = ListRequest::Only { id: id(2) };
        let page = service().execute(&snapshot, None, &request).unwrap();
        assert_eq!(instances(&page), vec![2]);
        assert_eq!(page.next, None);
    }

    proptest! {
        #[test]
        fn following_cursors_reproduces_snapshot(
            set in proptest::collection::btree_set(0u64..5_000, 0..300),
            limit in 1usize..50,
        ) {
            let all: Vec<u64> = set.into_iter().collect();
            let snapshot = snapshot_of(&all);
            let svc = service();

            let mut seen = Vec::new();
            let mut cursor: Option<String> = None;
            loop {
                let page = svc.list(&snapshot, limit, cursor.as_deref()).unwrap();
                prop_assert!(page.records.len() <= limit);
                seen.extend(instances(&page));
                match page.next {
                    Some(next) => cursor = Some(next.to_string()),
                    None => break,
                }
            }
            prop_assert_eq!(seen, all);
        }

        #[test]
        fn absent_cursor_resumes_at_insertion_point(
            set in proptest::collection::btree_set(0u64..1_000, 1..100),
            cursor in 0u64..1_100,
        ) {
            let all: Vec<u64> = set.into_iter().collect();
            let snapshot = snapshot_of(&all);
            let start = resolve_cursor(&snapshot, &id(cursor)).unwrap();
            let expected = all.iter().position(|k| *k > cursor).unwrap_or(all.len());
            prop_assert_eq!(start, expected);
        }
    }
}
