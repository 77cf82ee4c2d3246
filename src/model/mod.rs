//! Snapshot and diff data model
//!
//! - Snapshots and the entities captured in them
//! - Attribute values with semantic equality
//! - Diff runs, change records and field-level differences

pub mod diff;
pub mod snapshot;
pub mod value;

pub use diff::{
    AttributeScope, ChangeCounts, ChangeRecord, ChangeType, DiffRun, FieldDifference, RunStatus,
};
pub use snapshot::{newest_first, Entity, EntityLevel, SnapshotStatus, SyncSnapshot};
pub use value::{attribute_map_from_json, attribute_map_to_json, AttrValue, AttributeMap};
