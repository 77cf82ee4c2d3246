//! In-memory snapshot and diff store
//!
//! Backs local development and the test suite. Snapshots and diff results
//! each live behind a single lock so that every multi-row write (appending
//! entities, committing a run with its records) is observed all at once or
//! not at all.

use super::{ChangeFilter, DiffStore, SnapshotStore, MIN_RETAINED_SNAPSHOTS};
use crate::error::{ApiResult, AppError};
use crate::model::{
    newest_first, ChangeRecord, DiffRun, Entity, EntityLevel, RunStatus, SnapshotStatus,
    SyncSnapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct SnapshotTables {
    snapshots: HashMap<Uuid, SyncSnapshot>,
    /// Snapshot ID -> entities in insertion order
    entities: HashMap<Uuid, Vec<Entity>>,
}

#[derive(Default)]
struct DiffTables {
    runs: HashMap<Uuid, DiffRun>,
    /// Diff run ID -> change records ordered by level, then key
    changes: HashMap<Uuid, Vec<ChangeRecord>>,
}

/// Store keeping everything in process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    snapshots: Arc<RwLock<SnapshotTables>>,
    diffs: Arc<RwLock<DiffTables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn begin_snapshot(
        &self,
        connection_id: &str,
        captured_at: DateTime<Utc>,
    ) -> ApiResult<SyncSnapshot> {
        let snapshot = SyncSnapshot::new(connection_id, captured_at);

        let mut tables = self.snapshots.write().await;
        tables.entities.insert(snapshot.id, Vec::new());
        tables.snapshots.insert(snapshot.id, snapshot.clone());

        tracing::info!(
            "Started snapshot {} for connection {}",
            snapshot.id,
            connection_id
        );
        Ok(snapshot)
    }

    async fn append_entities(&self, snapshot_id: Uuid, entities: Vec<Entity>) -> ApiResult<usize> {
        let mut tables = self.snapshots.write().await;

        let status = tables
            .snapshots
            .get(&snapshot_id)
            .map(|s| s.status)
            .ok_or_else(|| AppError::NotFound(format!("Snapshot {} not found", snapshot_id)))?;
        if status != SnapshotStatus::Running {
            return Err(AppError::InvalidTransition(format!(
                "snapshot {} is {} and no longer accepts entities",
                snapshot_id,
                status.as_str()
            )));
        }

        let count = entities.len();
        tables.entities.entry(snapshot_id).or_default().extend(entities);
        Ok(count)
    }

    async fn finish_snapshot(
        &self,
        snapshot_id: Uuid,
        status: SnapshotStatus,
        error: Option<String>,
    ) -> ApiResult<SyncSnapshot> {
        let mut tables = self.snapshots.write().await;
        let snapshot = tables
            .snapshots
            .get_mut(&snapshot_id)
            .ok_or_else(|| AppError::NotFound(format!("Snapshot {} not found", snapshot_id)))?;

        snapshot.status = snapshot.status.transition(status)?;
        snapshot.error = error;

        tracing::info!(
            "Snapshot {} for connection {} is {}",
            snapshot_id,
            snapshot.connection_id,
            status.as_str()
        );
        Ok(snapshot.clone())
    }

    async fn get_snapshot(&self, snapshot_id: Uuid) -> ApiResult<Option<SyncSnapshot>> {
        let tables = self.snapshots.read().await;
        Ok(tables.snapshots.get(&snapshot_id).cloned())
    }

    async fn connection_exists(&self, connection_id: &str) -> ApiResult<bool> {
        let tables = self.snapshots.read().await;
        Ok(tables
            .snapshots
            .values()
            .any(|s| s.connection_id == connection_id))
    }

    async fn list_completed_snapshots(&self, connection_id: &str) -> ApiResult<Vec<SyncSnapshot>> {
        let tables = self.snapshots.read().await;
        let mut list: Vec<_> = tables
            .snapshots
            .values()
            .filter(|s| s.connection_id == connection_id && s.is_completed())
            .cloned()
            .collect();
        list.sort_by(newest_first);
        Ok(list)
    }

    async fn list_entities(&self, snapshot_id: Uuid, level: EntityLevel) -> ApiResult<Vec<Entity>> {
        let tables = self.snapshots.read().await;
        if !tables.snapshots.contains_key(&snapshot_id) {
            return Err(AppError::NotFound(format!("Snapshot {} not found", snapshot_id)));
        }

        Ok(tables
            .entities
            .get(&snapshot_id)
            .map(|entities| {
                entities
                    .iter()
                    .filter(|e| e.level == level)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn prune_snapshots(&self, connection_id: &str, keep: usize) -> ApiResult<usize> {
        let keep = keep.max(MIN_RETAINED_SNAPSHOTS);
        let mut tables = self.snapshots.write().await;

        let mut completed: Vec<_> = tables
            .snapshots
            .values()
            .filter(|s| s.connection_id == connection_id && s.is_completed())
            .cloned()
            .collect();
        completed.sort_by(newest_first);
        let retained: HashSet<Uuid> = completed.iter().take(keep).map(|s| s.id).collect();

        let to_remove: Vec<Uuid> = tables
            .snapshots
            .values()
            .filter(|s| {
                s.connection_id == connection_id
                    && s.status.is_terminal()
                    && !retained.contains(&s.id)
            })
            .map(|s| s.id)
            .collect();

        for id in &to_remove {
            tables.snapshots.remove(id);
            tables.entities.remove(id);
        }

        if !to_remove.is_empty() {
            tracing::info!(
                "Pruned {} old snapshots for connection {}",
                to_remove.len(),
                connection_id
            );
        }
        Ok(to_remove.len())
    }
}

#[async_trait]
impl DiffStore for MemoryStore {
    async fn create_run(&self, run: &DiffRun, stale_after: Duration) -> ApiResult<()> {
        if run.status != RunStatus::Running {
            return Err(AppError::InvalidTransition(format!(
                "diff run {} must be running when created, found {}",
                run.id, run.status
            )));
        }

        let mut tables = self.diffs.write().await;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());
        let blocking = tables.runs.values().find(|r| {
            r.connection_id == run.connection_id
                && r.status == RunStatus::Running
                && r.started_at > cutoff
        });
        if let Some(existing) = blocking {
            return Err(AppError::Conflict(format!(
                "diff run {} is already running for connection {}",
                existing.id, run.connection_id
            )));
        }

        tables.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn commit_run(&self, run: &DiffRun, records: &[ChangeRecord]) -> ApiResult<()> {
        let mut tables = self.diffs.write().await;
        let stored = tables
            .runs
            .get(&run.id)
            .ok_or_else(|| AppError::NotFound(format!("Diff run {} not found", run.id)))?;
        stored.status.transition(RunStatus::Completed)?;

        if let Some(foreign) = records.iter().find(|r| r.diff_run_id != run.id) {
            return Err(AppError::DataIntegrity(format!(
                "change record for {} belongs to diff run {}",
                foreign.qualified_key, foreign.diff_run_id
            )));
        }

        let mut committed = run.clone();
        committed.status = RunStatus::Completed;
        tables.runs.insert(run.id, committed);
        tables.changes.insert(run.id, records.to_vec());
        Ok(())
    }

    async fn fail_run(&self, run: &DiffRun) -> ApiResult<()> {
        let mut tables = self.diffs.write().await;
        let stored = tables
            .runs
            .get_mut(&run.id)
            .ok_or_else(|| AppError::NotFound(format!("Diff run {} not found", run.id)))?;

        stored.status = stored.status.transition(RunStatus::Failed)?;
        stored.error = run.error.clone();
        stored.completed_at = run.completed_at;
        stored.counts = Default::default();
        tables.changes.remove(&run.id);
        Ok(())
    }

    async fn get_run(&self, diff_run_id: Uuid) -> ApiResult<Option<DiffRun>> {
        let tables = self.diffs.read().await;
        Ok(tables.runs.get(&diff_run_id).cloned())
    }

    async fn list_runs(&self, connection_id: &str, limit: usize) -> ApiResult<Vec<DiffRun>> {
        let tables = self.diffs.read().await;
        let mut runs: Vec<_> = tables
            .runs
            .values()
            .filter(|r| r.connection_id == connection_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| b.id.cmp(&a.id)));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn list_changes(
        &self,
        diff_run_id: Uuid,
        filter: ChangeFilter,
    ) -> ApiResult<Vec<ChangeRecord>> {
        let tables = self.diffs.read().await;
        if !tables.runs.contains_key(&diff_run_id) {
            return Err(AppError::NotFound(format!("Diff run {} not found", diff_run_id)));
        }

        let mut records: Vec<_> = tables
            .changes
            .get(&diff_run_id)
            .map(|records| records.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| {
            a.level
                .cmp(&b.level)
                .then_with(|| a.qualified_key.cmp(&b.qualified_key))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::build_key;
    use crate::model::{ChangeCounts, ChangeType};
    use crate::store::save_snapshot;
    use pretty_assertions::assert_eq;

    fn running_run(connection_id: &str) -> DiffRun {
        let mut run = DiffRun::new(connection_id, Uuid::new_v4(), Uuid::new_v4());
        run.start().unwrap();
        run
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle() {
        let store = MemoryStore::new();
        let snapshot = store.begin_snapshot("warehouse", Utc::now()).await.unwrap();
        assert_eq!(snapshot.status, SnapshotStatus::Running);

        let appended = store
            .append_entities(
                snapshot.id,
                vec![Entity::schema("public"), Entity::table("public", "users")],
            )
            .await
            .unwrap();
        assert_eq!(appended, 2);

        // Not visible to diffing until completed
        assert!(store.latest_completed_snapshot("warehouse").await.unwrap().is_none());

        store
            .finish_snapshot(snapshot.id, SnapshotStatus::Completed, None)
            .await
            .unwrap();
        let latest = store.latest_completed_snapshot("warehouse").await.unwrap().unwrap();
        assert_eq!(latest.id, snapshot.id);

        let tables = store.list_entities(snapshot.id, EntityLevel::Table).await.unwrap();
        assert_eq!(tables, vec![Entity::table("public", "users")]);
    }

    #[tokio::test]
    async fn test_completed_snapshot_is_write_once() {
        let store = MemoryStore::new();
        let snapshot = save_snapshot(&store, "warehouse", Utc::now(), vec![Entity::schema("public")])
            .await
            .unwrap();

        let err = store
            .append_entities(snapshot.id, vec![Entity::schema("sales")])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));

        let err = store
            .finish_snapshot(snapshot.id, SnapshotStatus::Failed, Some("late".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_completed_snapshots_newest_first() {
        let store = MemoryStore::new();
        let base = Utc::now();
        let first = save_snapshot(&store, "warehouse", base, vec![]).await.unwrap();
        let second = save_snapshot(&store, "warehouse", base + chrono::Duration::minutes(5), vec![])
            .await
            .unwrap();
        let failed = store.begin_snapshot("warehouse", base + chrono::Duration::minutes(9)).await.unwrap();
        store
            .finish_snapshot(failed.id, SnapshotStatus::Failed, Some("timeout".into()))
            .await
            .unwrap();
        save_snapshot(&store, "other", base + chrono::Duration::hours(1), vec![])
            .await
            .unwrap();

        let ids: Vec<_> = store
            .list_completed_snapshots("warehouse")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);
        assert!(store.connection_exists("warehouse").await.unwrap());
        assert!(!store.connection_exists("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_keeps_at_least_two() {
        let store = MemoryStore::new();
        let base = Utc::now();
        for i in 0..4 {
            save_snapshot(&store, "warehouse", base + chrono::Duration::minutes(i), vec![])
                .await
                .unwrap();
        }
        let running = store.begin_snapshot("warehouse", base).await.unwrap();

        let removed = store.prune_snapshots("warehouse", 0).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.list_completed_snapshots("warehouse").await.unwrap().len(), 2);
        assert!(store.get_snapshot(running.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_second_running_run_conflicts() {
        let store = MemoryStore::new();
        let first = running_run("warehouse");
        store.create_run(&first, Duration::from_secs(3600)).await.unwrap();

        let second = running_run("warehouse");
        let err = store.create_run(&second, Duration::from_secs(3600)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));

        // Different connections never block each other
        store
            .create_run(&running_run("lake"), Duration::from_secs(3600))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_running_run_does_not_block() {
        let store = MemoryStore::new();
        let mut abandoned = running_run("warehouse");
        abandoned.started_at = Utc::now() - chrono::Duration::hours(2);
        store.create_run(&abandoned, Duration::from_secs(3600)).await.unwrap();

        store
            .create_run(&running_run("warehouse"), Duration::from_secs(3600))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commit_and_query_changes() {
        let store = MemoryStore::new();
        let mut run = running_run("warehouse");
        store.create_run(&run, Duration::from_secs(3600)).await.unwrap();

        let records = vec![
            ChangeRecord::new(
                run.id,
                build_key(EntityLevel::Column, &["public", "users"], "phone").unwrap(),
                ChangeType::Added,
                None,
                Some(Entity::column("public", "users", "phone")),
                vec![],
            ),
            ChangeRecord::new(
                run.id,
                build_key(EntityLevel::Table, &["public"], "orders").unwrap(),
                ChangeType::Removed,
                Some(Entity::table("public", "orders")),
                None,
                vec![],
            ),
        ];
        run.complete(ChangeCounts { schemas_changed: 0, tables_changed: 1, columns_changed: 1 })
            .unwrap();
        store.commit_run(&run, &records).await.unwrap();

        let stored = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.counts.total(), 2);

        let all = store.list_changes(run.id, ChangeFilter::default()).await.unwrap();
        let keys: Vec<_> = all.iter().map(|r| r.qualified_key.to_string()).collect();
        assert_eq!(keys, vec!["public.orders", "public.users.phone"]);

        let columns = store
            .list_changes(
                run.id,
                ChangeFilter { level: Some(EntityLevel::Column), change_type: None },
            )
            .await
            .unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns[0].change_type, ChangeType::Added);

        // Terminal runs cannot be committed or failed again
        assert!(store.commit_run(&run, &records).await.is_err());
        assert!(store.fail_run(&run).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_run_keeps_no_records() {
        let store = MemoryStore::new();
        let mut run = running_run("warehouse");
        store.create_run(&run, Duration::from_secs(3600)).await.unwrap();
        run.fail("storage unavailable").unwrap();
        store.fail_run(&run).await.unwrap();

        let stored = store.latest_run("warehouse").await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("storage unavailable"));
        assert!(store
            .list_changes(run.id, ChangeFilter::default())
            .await
            .unwrap()
            .is_empty());

        // A failed run no longer blocks the connection
        store
            .create_run(&running_run("warehouse"), Duration::from_secs(3600))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .list_changes(Uuid::new_v4(), ChangeFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
