//! Diff Run Coordinator
//!
//! Drives one comparison between two completed snapshots of a connection:
//! selects the pair, loads the entities of all three levels, classifies
//! every key and commits the run with its change records in one step.
//!
//! Runs are serialized per connection twice over: an in-process lock table
//! rejects a second run from the same service instance, and the store
//! rejects a run while another non-stale one is still `running`. Lock table
//! entries only live while a run holds them.

use crate::config::DiffSettings;
use crate::differ::AttributeDiffer;
use crate::error::{precondition_error, ApiResult, AppError};
use crate::model::{
    ChangeCounts, ChangeRecord, ChangeType, DiffRun, Entity, EntityLevel, SyncSnapshot,
};
use crate::reconcile::{index_entities, reconcile};
use crate::store::{DiffStore, MetadataStore, SnapshotStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Every classification produced for one pair of snapshots, `unchanged`
/// included, ordered by level and then by qualified key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffComputation {
    pub records: Vec<ChangeRecord>,
    pub counts: ChangeCounts,
}

impl DiffComputation {
    /// Records that describe an actual change
    pub fn changes(&self) -> impl Iterator<Item = &ChangeRecord> {
        self.records.iter().filter(|r| r.change_type.is_change())
    }

    pub fn records_for(&self, level: EntityLevel) -> impl Iterator<Item = &ChangeRecord> {
        self.records.iter().filter(move |r| r.level == level)
    }

    /// Look a record up by its rendered qualified key
    pub fn find(&self, level: EntityLevel, key: &str) -> Option<&ChangeRecord> {
        self.records_for(level)
            .find(|r| r.qualified_key.to_string() == key)
    }
}

/// Connection ID -> in-process run lock
type LockTable = Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>;

fn lock_table(table: &LockTable) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Held for the duration of one run; removes its table entry on release
/// unless another caller is holding a handle to the same lock.
struct ConnectionLock {
    connection_id: String,
    table: LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ConnectionLock {
    fn drop(&mut self) {
        let mut locks = lock_table(&self.table);
        drop(self.guard.take());
        let idle = locks
            .get(&self.connection_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.connection_id);
        }
    }
}

pub struct DiffCoordinator {
    store: Arc<dyn MetadataStore>,
    differ: AttributeDiffer,
    settings: DiffSettings,
    locks: LockTable,
}

impl DiffCoordinator {
    pub fn new(store: Arc<dyn MetadataStore>, settings: DiffSettings) -> Self {
        Self {
            store,
            differ: AttributeDiffer::new(&settings),
            settings,
            locks: LockTable::default(),
        }
    }

    /// Diff the two most recent completed snapshots of a connection.
    pub async fn run_latest(&self, connection_id: &str) -> ApiResult<DiffRun> {
        let _guard = self.lock_connection(connection_id)?;

        if !self.store.connection_exists(connection_id).await? {
            warn!(connection_id, "Diff rejected: unknown connection");
            return Err(AppError::UnknownConnection(connection_id.to_string()));
        }

        let completed = self.store.list_completed_snapshots(connection_id).await?;
        let (newer, older) = match completed.as_slice() {
            [newer, older, ..] => (newer.clone(), older.clone()),
            _ => {
                warn!(
                    connection_id,
                    completed = completed.len(),
                    "Diff rejected: not enough completed snapshots"
                );
                return Err(precondition_error(format!(
                    "connection {} has {} completed snapshot(s), at least 2 are required",
                    connection_id,
                    completed.len()
                )));
            }
        };
        ensure_ordered(connection_id, &older, &newer)?;

        self.execute(connection_id, &older, &newer).await
    }

    /// Diff an explicit pair of snapshots of a connection.
    pub async fn run_between(
        &self,
        connection_id: &str,
        older_snapshot_id: Uuid,
        newer_snapshot_id: Uuid,
    ) -> ApiResult<DiffRun> {
        let _guard = self.lock_connection(connection_id)?;

        if !self.store.connection_exists(connection_id).await? {
            warn!(connection_id, "Diff rejected: unknown connection");
            return Err(AppError::UnknownConnection(connection_id.to_string()));
        }

        let older = self.completed_snapshot(connection_id, older_snapshot_id).await?;
        let newer = self.completed_snapshot(connection_id, newer_snapshot_id).await?;
        ensure_ordered(connection_id, &older, &newer)?;

        self.execute(connection_id, &older, &newer).await
    }

    /// Classify every schema, table and column of two entity sets.
    ///
    /// Pure: nothing is read from or written to the store.
    pub fn compare(
        &self,
        diff_run_id: Uuid,
        older: Vec<Entity>,
        newer: Vec<Entity>,
    ) -> ApiResult<DiffComputation> {
        let mut older = split_by_level(older);
        let mut newer = split_by_level(newer);
        let mut computation = DiffComputation::default();

        for level in EntityLevel::ALL {
            let records = self.compare_level(
                diff_run_id,
                level,
                older.remove(&level).unwrap_or_default(),
                newer.remove(&level).unwrap_or_default(),
            )?;
            for record in &records {
                computation.counts.record(level, record.change_type);
            }
            debug!(
                %diff_run_id,
                level = level.as_str(),
                keys = records.len(),
                changed = computation.counts.for_level(level),
                "Level compared"
            );
            computation.records.extend(records);
        }

        Ok(computation)
    }

    fn compare_level(
        &self,
        diff_run_id: Uuid,
        level: EntityLevel,
        older: Vec<Entity>,
        newer: Vec<Entity>,
    ) -> ApiResult<Vec<ChangeRecord>> {
        let mut older = index_entities(level, older)?;
        let mut newer = index_entities(level, newer)?;
        let partition = reconcile(&older, &newer);

        let mut records = Vec::with_capacity(partition.len());
        for key in partition.added {
            let entity = newer.remove(&key);
            records.push(ChangeRecord::new(diff_run_id, key, ChangeType::Added, None, entity, vec![]));
        }
        for key in partition.removed {
            let entity = older.remove(&key);
            records.push(ChangeRecord::new(diff_run_id, key, ChangeType::Removed, entity, None, vec![]));
        }
        for key in partition.common {
            let (Some(old), Some(new)) = (older.remove(&key), newer.remove(&key)) else {
                continue;
            };
            let (change_type, differences) = self.differ.diff(&old, &new);
            records.push(ChangeRecord::new(
                diff_run_id,
                key,
                change_type,
                Some(old),
                Some(new),
                differences,
            ));
        }

        records.sort_by(|a, b| a.qualified_key.cmp(&b.qualified_key));
        Ok(records)
    }

    fn lock_connection(&self, connection_id: &str) -> ApiResult<ConnectionLock> {
        let mut locks = lock_table(&self.locks);
        let lock = locks.entry(connection_id.to_string()).or_default().clone();
        match lock.try_lock_owned() {
            Ok(guard) => Ok(ConnectionLock {
                connection_id: connection_id.to_string(),
                table: self.locks.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                warn!(connection_id, "Diff rejected: another run is in progress");
                Err(AppError::Conflict(format!(
                    "a diff run is already in progress for connection {}",
                    connection_id
                )))
            }
        }
    }

    async fn completed_snapshot(
        &self,
        connection_id: &str,
        snapshot_id: Uuid,
    ) -> ApiResult<SyncSnapshot> {
        let snapshot = self
            .store
            .get_snapshot(snapshot_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Snapshot {} not found", snapshot_id)))?;

        if snapshot.connection_id != connection_id {
            return Err(precondition_error(format!(
                "snapshot {} belongs to connection {}, not {}",
                snapshot_id, snapshot.connection_id, connection_id
            )));
        }
        if !snapshot.is_completed() {
            return Err(precondition_error(format!(
                "snapshot {} is {}, only completed snapshots can be compared",
                snapshot_id,
                snapshot.status.as_str()
            )));
        }
        Ok(snapshot)
    }

    async fn execute(
        &self,
        connection_id: &str,
        older: &SyncSnapshot,
        newer: &SyncSnapshot,
    ) -> ApiResult<DiffRun> {
        let mut run = DiffRun::new(connection_id, older.id, newer.id);
        run.start()?;
        self.store
            .create_run(&run, self.settings.stale_run_after)
            .await?;

        info!(
            connection_id,
            diff_run_id = %run.id,
            older_snapshot_id = %older.id,
            newer_snapshot_id = %newer.id,
            "Diff run started"
        );

        let outcome = match self.load_and_compare(run.id, older, newer).await {
            Ok(computation) => self.commit(&run, computation).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(completed) => {
                info!(
                    connection_id,
                    diff_run_id = %completed.id,
                    schemas_changed = completed.counts.schemas_changed,
                    tables_changed = completed.counts.tables_changed,
                    columns_changed = completed.counts.columns_changed,
                    "Diff run completed"
                );
                Ok(completed)
            }
            Err(cause) => {
                let reason = cause.to_string();
                error!(connection_id, diff_run_id = %run.id, error = %reason, "Diff run failed");

                run.fail(reason.clone())?;
                if let Err(e) = self.store.fail_run(&run).await {
                    error!(diff_run_id = %run.id, error = %e, "Could not record failed diff run");
                }
                Err(AppError::RunFailed {
                    diff_run_id: run.id,
                    reason,
                })
            }
        }
    }

    async fn load_and_compare(
        &self,
        diff_run_id: Uuid,
        older: &SyncSnapshot,
        newer: &SyncSnapshot,
    ) -> ApiResult<DiffComputation> {
        let store = &self.store;
        let (older_schemas, older_tables, older_columns, newer_schemas, newer_tables, newer_columns) =
            tokio::try_join!(
                store.list_entities(older.id, EntityLevel::Schema),
                store.list_entities(older.id, EntityLevel::Table),
                store.list_entities(older.id, EntityLevel::Column),
                store.list_entities(newer.id, EntityLevel::Schema),
                store.list_entities(newer.id, EntityLevel::Table),
                store.list_entities(newer.id, EntityLevel::Column),
            )?;

        let older_entities = [older_schemas, older_tables, older_columns].concat();
        let newer_entities = [newer_schemas, newer_tables, newer_columns].concat();
        self.compare(diff_run_id, older_entities, newer_entities)
    }

    async fn commit(&self, run: &DiffRun, computation: DiffComputation) -> ApiResult<DiffRun> {
        let mut completed = run.clone();
        completed.complete(computation.counts)?;

        let records: Vec<ChangeRecord> = if self.settings.persist_unchanged {
            computation.records
        } else {
            computation
                .records
                .into_iter()
                .filter(|r| r.change_type.is_change())
                .collect()
        };

        self.store.commit_run(&completed, &records).await?;
        Ok(completed)
    }
}

/// The older snapshot must be captured strictly before the newer one.
fn ensure_ordered(connection_id: &str, older: &SyncSnapshot, newer: &SyncSnapshot) -> ApiResult<()> {
    if older.captured_at < newer.captured_at {
        return Ok(());
    }
    warn!(
        connection_id,
        older_snapshot_id = %older.id,
        newer_snapshot_id = %newer.id,
        "Diff rejected: snapshots out of order"
    );
    Err(precondition_error(format!(
        "older snapshot {} must be captured before newer snapshot {}",
        older.id, newer.id
    )))
}

fn split_by_level(entities: Vec<Entity>) -> HashMap<EntityLevel, Vec<Entity>> {
    let mut by_level: HashMap<EntityLevel, Vec<Entity>> = HashMap::new();
    for entity in entities {
        by_level.entry(entity.level).or_default().push(entity);
    }
    by_level
}
