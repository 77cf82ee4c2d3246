//! Snapshot and Diff Storage
//!
//! Two contracts sit here:
//! - `SnapshotStore`: write-once snapshots and their entities, produced by
//!   the extractor and read by the diff engine
//! - `DiffStore`: diff runs and their change records, written by the
//!   coordinator and read by the viewer
//!
//! Both are implemented in memory (`MemoryStore`) and on PostgreSQL (`PgStore`).

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::ApiResult;
use crate::model::{
    ChangeRecord, ChangeType, DiffRun, Entity, EntityLevel, SnapshotStatus, SyncSnapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

/// Snapshots never pruned below this many completed ones per connection
pub const MIN_RETAINED_SNAPSHOTS: usize = 2;

/// Optional filters for change record queries
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeFilter {
    pub level: Option<EntityLevel>,
    pub change_type: Option<ChangeType>,
}

impl ChangeFilter {
    pub fn matches(&self, record: &ChangeRecord) -> bool {
        self.level.map_or(true, |l| record.level == l)
            && self.change_type.map_or(true, |c| record.change_type == c)
    }
}

/// Persistence for snapshots and their entities
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Register a new snapshot in `running` state
    async fn begin_snapshot(
        &self,
        connection_id: &str,
        captured_at: DateTime<Utc>,
    ) -> ApiResult<SyncSnapshot>;

    /// Attach entities to a snapshot that is still running
    async fn append_entities(&self, snapshot_id: Uuid, entities: Vec<Entity>) -> ApiResult<usize>;

    /// Move a running snapshot to its terminal state
    async fn finish_snapshot(
        &self,
        snapshot_id: Uuid,
        status: SnapshotStatus,
        error: Option<String>,
    ) -> ApiResult<SyncSnapshot>;

    async fn get_snapshot(&self, snapshot_id: Uuid) -> ApiResult<Option<SyncSnapshot>>;

    /// Whether any snapshot, in any state, was ever recorded for the connection
    async fn connection_exists(&self, connection_id: &str) -> ApiResult<bool>;

    /// Completed snapshots, newest first (ties by snapshot id descending)
    async fn list_completed_snapshots(&self, connection_id: &str) -> ApiResult<Vec<SyncSnapshot>>;

    /// Latest completed snapshot, computed on every call
    async fn latest_completed_snapshot(
        &self,
        connection_id: &str,
    ) -> ApiResult<Option<SyncSnapshot>> {
        Ok(self
            .list_completed_snapshots(connection_id)
            .await?
            .into_iter()
            .next())
    }

    async fn list_entities(&self, snapshot_id: Uuid, level: EntityLevel) -> ApiResult<Vec<Entity>>;

    /// Delete terminal snapshots beyond the newest `keep` completed ones
    async fn prune_snapshots(&self, connection_id: &str, keep: usize) -> ApiResult<usize>;
}

/// Persistence for diff runs and change records
#[async_trait]
pub trait DiffStore: Send + Sync {
    /// Persist a `running` run. Fails with a conflict while another
    /// non-stale run for the same connection is still running.
    async fn create_run(&self, run: &DiffRun, stale_after: Duration) -> ApiResult<()>;

    /// Store the completed run together with all of its change records in
    /// one atomic step.
    async fn commit_run(&self, run: &DiffRun, records: &[ChangeRecord]) -> ApiResult<()>;

    /// Store the failed state and error detail of a run
    async fn fail_run(&self, run: &DiffRun) -> ApiResult<()>;

    async fn get_run(&self, diff_run_id: Uuid) -> ApiResult<Option<DiffRun>>;

    /// Runs for a connection, newest first
    async fn list_runs(&self, connection_id: &str, limit: usize) -> ApiResult<Vec<DiffRun>>;

    /// Most recent run for a connection
    async fn latest_run(&self, connection_id: &str) -> ApiResult<Option<DiffRun>> {
        Ok(self.list_runs(connection_id, 1).await?.into_iter().next())
    }

    /// Change records of a run ordered by level, then qualified key
    async fn list_changes(
        &self,
        diff_run_id: Uuid,
        filter: ChangeFilter,
    ) -> ApiResult<Vec<ChangeRecord>>;
}

/// Everything the service needs from a backend
pub trait MetadataStore: SnapshotStore + DiffStore {}

impl<T: SnapshotStore + DiffStore> MetadataStore for T {}

/// Store a complete snapshot in one call (begin, append, finish).
pub async fn save_snapshot<S: SnapshotStore + ?Sized>(
    store: &S,
    connection_id: &str,
    captured_at: DateTime<Utc>,
    entities: Vec<Entity>,
) -> ApiResult<SyncSnapshot> {
    let snapshot = store.begin_snapshot(connection_id, captured_at).await?;
    match store.append_entities(snapshot.id, entities).await {
        Ok(count) => {
            tracing::debug!(snapshot_id = %snapshot.id, entities = count, "Snapshot entities stored");
            store
                .finish_snapshot(snapshot.id, SnapshotStatus::Completed, None)
                .await
        }
        Err(e) => {
            store
                .finish_snapshot(snapshot.id, SnapshotStatus::Failed, Some(e.to_string()))
                .await?;
            Err(e)
        }
    }
}
