//! Immutable, sorted snapshots of the storage fleet.
//!
//! A refresh produces two snapshots from one raw record set:
//!
//! - the **eligible** snapshot: nodes at or below the ordinary write ceiling
//! - the **operator** snapshot: every fetched node (the fetch already applied
//!   the looser operator ceiling)
//!
//! Both are sorted ascending by the numeric instance component of the node id
//! and are never modified after [`build_snapshots`] returns.

use serde::Serialize;
use tracing::{trace, warn};

use crate::record::{RecordError, StorageNodeRecord};

/// Utilization ceilings, in percent, for the two tiers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Ceiling for ordinary writes.
    pub utilization: f64,
    /// Looser ceiling reserved for operator-initiated writes.
    pub operator_utilization: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            utilization: 90.0,
            operator_utilization: 92.0,
        }
    }
}

/// Sorted, immutable sequence of storage node records.
///
/// Keeps the parsed instance number of every record alongside it so cursor
/// resolution can binary-search without re-parsing ids.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    records: Vec<StorageNodeRecord>,
    #[serde(skip)]
    keys: Vec<u64>,
}

impl Snapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sorts `records` by instance number and freezes them.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::MalformedId`] for the first record whose id has
    /// no numeric instance component.
    pub fn from_records(records: Vec<StorageNodeRecord>) -> Result<Self, RecordError> {
        let mut keyed = records
            .into_iter()
            .map(|record| Ok((record.instance_number()?, record)))
            .collect::<Result<Vec<_>, RecordError>>()?;
        // Stable sort: with duplicate instance numbers the store order survives.
        keyed.sort_by_key(|(key, _)| *key);

        let (keys, records): (Vec<u64>, Vec<StorageNodeRecord>) = keyed.into_iter().unzip();
        let snapshot = Self { records, keys };
        snapshot.report_duplicate_keys();
        Ok(snapshot)
    }

    /// Records in ascending instance order.
    #[must_use]
    pub fn records(&self) -> &[StorageNodeRecord] {
        &self.records
    }

    /// Instance numbers, parallel to [`records`](Self::records).
    #[must_use]
    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Position of the record whose id equals `id`, if present.
    ///
    /// Runs in `O(log n)`: the instance number narrows the search to the
    /// (normally single-element) run of equal keys.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        let key = crate::record::instance_number(id).ok()?;
        let start = self.keys.partition_point(|k| *k < key);
        let end = self.keys.partition_point(|k| *k <= key);
        (start..end).find(|&i| self.records[i].id == id)
    }

    /// Looks up a record by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&StorageNodeRecord> {
        self.position(id).map(|i| &self.records[i])
    }

    fn report_duplicate_keys(&self) {
        for (i, pair) in self.keys.windows(2).enumerate() {
            if pair[0] == pair[1] {
                warn!(
                    instance = pair[0],
                    first = %self.records[i].id,
                    second = %self.records[i + 1].id,
                    "storage nodes share an instance number; relative order is unspecified"
                );
            }
        }
    }
}

/// The eligible/operator pair installed by a single refresh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotPair {
    /// Nodes at or below the ordinary write ceiling.
    pub eligible: Snapshot,
    /// Nodes at or below the operator write ceiling.
    pub operator: Snapshot,
    /// Monotonic install counter; 0 for the empty pair served before the
    /// first successful refresh.
    pub generation: u64,
    /// Epoch millis at which the pair was installed, if ever.
    pub refreshed_at: Option<u64>,
}

impl SnapshotPair {
    /// The empty pair served during warm-up.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the snapshot for the given tier.
    #[must_use]
    pub fn tier(&self, tier: Tier) -> &Snapshot {
        match tier {
            Tier::Eligible => &self.eligible,
            Tier::Operator => &self.operator,
        }
    }
}

/// Selects one of the two snapshots in a [`SnapshotPair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Eligible,
    Operator,
}

impl Tier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Eligible => "eligible",
            Tier::Operator => "operator",
        }
    }
}

/// Partitions and sorts a raw record set into `(eligible, operator)`.
///
/// Every record lands in the operator snapshot; records with
/// `percent_used <= thresholds.utilization` also land in the eligible one.
/// Empty tiers are valid and only logged.
///
/// # Errors
///
/// Returns [`RecordError::MalformedId`] if any record id cannot be parsed.
/// A malformed record fails the whole build.
pub fn build_snapshots(
    records: Vec<StorageNodeRecord>,
    thresholds: Thresholds,
) -> Result<(Snapshot, Snapshot), RecordError> {
    let eligible: Vec<StorageNodeRecord> = records
        .iter()
        .filter(|r| r.percent_used <= thresholds.utilization)
        .cloned()
        .collect();

    let eligible = Snapshot::from_records(eligible)?;
    let operator = Snapshot::from_records(records)?;

    if eligible.is_empty() {
        warn!("could not find any storage nodes under the utilization ceiling");
    }
    if operator.is_empty() {
        warn!("could not find any storage nodes for operator requests");
    }

    trace!(
        eligible = eligible.len(),
        operator = operator.len(),
        "snapshots built"
    );
    Ok((eligible, operator))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn node(instance: u64, pct: f64) -> StorageNodeRecord {
        StorageNodeRecord::new(format!("{instance}.stor.us-east.example.com"), pct, 1_000)
    }

    fn ids(snapshot: &Snapshot) -> Vec<u64> {
        snapshot.keys().to_vec()
    }

    #[test]
    fn sorts_numerically_not_lexically() {
        let records = vec![node(10, 1.0), node(2, 1.0), node(1, 1.0), node(100, 1.0)];
        let (eligible, operator) = build_snapshots(records, Thresholds::default()).unwrap();
        assert_eq!(ids(&eligible), vec![1, 2, 10, 100]);
        assert_eq!(ids(&operator), vec![1, 2, 10, 100]);
    }

    #[test]
    fn partitions_by_utilization_ceiling() {
        let records = vec![node(1, 50.0), node(2, 90.0), node(3, 91.0), node(4, 92.0)];
        let thresholds = Thresholds {
            utilization: 90.0,
            operator_utilization: 92.0,
        };
        let (eligible, operator) = build_snapshots(records, thresholds).unwrap();
        // The ceiling is inclusive.
        assert_eq!(ids(&eligible), vec![1, 2]);
        assert_eq!(ids(&operator), vec![1, 2, 3, 4]);
    }

    #[test]
    fn empty_input_yields_empty_snapshots() {
        let (eligible, operator) = build_snapshots(Vec::new(), Thresholds::default()).unwrap();
        assert!(eligible.is_empty());
        assert!(operator.is_empty());
    }

    #[test]
    fn all_above_ceiling_yields_empty_eligible() {
        let (eligible, operator) =
            build_snapshots(vec![node(1, 91.0), node(2, 92.0)], Thresholds::default()).unwrap();
        assert!(eligible.is_empty());
        assert_eq!(operator.len(), 2);
    }

    #[test]
    fn malformed_id_fails_the_build() {
        let records = vec![node(1, 1.0), StorageNodeRecord::new("bogus.stor.x", 1.0, 1)];
        let err = build_snapshots(records, Thresholds::default()).unwrap_err();
        assert_eq!(
            err,
            RecordError::MalformedId {
                id: "bogus.stor.x".to_string()
            }
        );
    }

    #[test]
    fn duplicate_instance_numbers_are_tolerated() {
        let records = vec![
            StorageNodeRecord::new("3.stor.a.example.com", 1.0, 1),
            node(1, 1.0),
            StorageNodeRecord::new("3.stor.b.example.com", 1.0, 1),
        ];
        let (eligible, _) = build_snapshots(records, Thresholds::default()).unwrap();
        assert_eq!(ids(&eligible), vec![1, 3, 3]);
        assert_eq!(eligible.position("3.stor.b.example.com"), Some(2));
        assert_eq!(eligible.position("3.stor.a.example.com"), Some(1));
    }

    #[test]
    fn position_and_get() {
        let snapshot = Snapshot::from_records(vec![node(5, 1.0), node(1, 1.0), node(3, 1.0)]).unwrap();
        assert_eq!(snapshot.position("3.stor.us-east.example.com"), Some(1));
        assert_eq!(snapshot.position("4.stor.us-east.example.com"), None);
        assert_eq!(snapshot.position("3.stor.elsewhere"), None);
        assert_eq!(snapshot.position("not-an-id"), None);
        assert_eq!(
            snapshot.get("5.stor.us-east.example.com").map(|r| r.id.as_str()),
            Some("5.stor.us-east.example.com")
        );
    }

    #[test]
    fn snapshot_serializes_as_plain_array() {
        let snapshot = Snapshot::from_records(vec![node(2, 1.0), node(1, 1.0)]).unwrap();
        let value = serde_json::to_value(&snapshot).unwrap();
        let array = value.as_array().expect("array");
        assert_eq!(array.len(), 2);
        assert_eq!(array[0]["manta_storage_id"], "1.stor.us-east.example.com");
    }

    #[test]
    fn pair_selects_tier() {
        let pair = SnapshotPair {
            eligible: Snapshot::from_records(vec![node(1, 1.0)]).unwrap(),
            operator: Snapshot::from_records(vec![node(1, 1.0), node(2, 91.0)]).unwrap(),
            generation: 1,
            refreshed_at: Some(10),
        };
        assert_eq!(pair.tier(Tier::Eligible).len(), 1);
        assert_eq!(pair.tier(Tier::Operator).len(), 2);
        assert_eq!(Tier::Operator.as_str(), "operator");
    }

    proptest! {
        #[test]
        fn eligible_is_subset_and_both_strictly_ascending(
            entries in proptest::collection::btree_map(0u64..10_000, 0.0f64..100.0, 0..200),
            utilization in 0.0f64..100.0,
            slack in 0.0f64..10.0,
        ) {
            let thresholds = Thresholds { utilization, operator_utilization: utilization + slack };
            // The fetch applies the operator ceiling before building.
            let records: Vec<_> = entries
                .iter()
                .filter(|(_, pct)| **pct <= thresholds.operator_utilization)
                .map(|(instance, pct)| node(*instance, *pct))
                .collect();

            let (eligible, operator) = build_snapshots(records, thresholds).unwrap();

            prop_assert!(eligible.keys().windows(2).all(|w| w[0] < w[1]));
            prop_assert!(operator.keys().windows(2).all(|w| w[0] < w[1]));
            for record in eligible.records() {
                prop_assert!(record.percent_used <= thresholds.utilization);
                prop_assert!(operator.get(&record.id).is_some());
            }
            for record in operator.records() {
                if record.percent_used <= thresholds.utilization {
                    prop_assert!(eligible.get(&record.id).is_some());
                }
            }
        }
    }
}
