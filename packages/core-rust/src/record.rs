//! Storage node utilization records.
//!
//! Each storage node periodically writes one record describing its current
//! utilization into the backing store. The record's id has the shape
//! `<instance>.stor.<region>.<domain>`; the leading numeric instance is the
//! stable ordering key for every snapshot served by this crate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors raised while interpreting a storage node record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("malformed storage node id '{id}': leading segment is not an instance number")]
    MalformedId { id: String },
}

/// One storage node as last reported into the backing store.
///
/// Field names follow the storage bucket's wire format. Anything beyond the
/// three fields the cache interprets is kept in `extra` and passed through
/// verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNodeRecord {
    /// Globally unique node id, `<instance>.stor.<region>.<domain>`.
    #[serde(rename = "manta_storage_id", alias = "id")]
    pub id: String,
    /// Most recent utilization percentage.
    #[serde(rename = "percentUsed")]
    pub percent_used: f64,
    /// Epoch milliseconds at which the node last wrote this record.
    pub timestamp: u64,
    /// Opaque fields (capacity, datacenter label, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StorageNodeRecord {
    /// Creates a record with no opaque fields.
    #[must_use]
    pub fn new(id: impl Into<String>, percent_used: f64, timestamp: u64) -> Self {
        Self {
            id: id.into(),
            percent_used,
            timestamp,
            extra: Map::new(),
        }
    }

    /// Adds an opaque pass-through field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Parses this record's ordering key.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::MalformedId`] if the id has no numeric
    /// leading segment.
    pub fn instance_number(&self) -> Result<u64, RecordError> {
        instance_number(&self.id)
    }
}

/// Parses the leading instance number from a storage node id.
///
/// `"12.stor.us-east.example.com"` yields `12`. Leading/trailing garbage in
/// the first segment (`"12a.stor..."`, `".stor..."`) is rejected.
///
/// # Errors
///
/// Returns [`RecordError::MalformedId`] if the first `.`-separated segment
/// is not a plain run of ASCII digits.
pub fn instance_number(id: &str) -> Result<u64, RecordError> {
    id.split('.')
        .next()
        .filter(|segment| !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|segment| segment.parse::<u64>().ok())
        .ok_or_else(|| RecordError::MalformedId { id: id.to_string() })
}
