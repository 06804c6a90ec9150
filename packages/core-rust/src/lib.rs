//! storinfo core: storage node records, tiered snapshots, and paginated queries.

pub mod clock;
pub mod query;
pub mod record;
pub mod snapshot;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use query::{ListRequest, Page, PageLimits, PageQueryService, QueryError, QueryErrorKind};
pub use record::{instance_number, RecordError, StorageNodeRecord};
pub use snapshot::{build_snapshots, Snapshot, SnapshotPair, Thresholds, Tier};
