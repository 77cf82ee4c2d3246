//! PostgreSQL snapshot and diff store
//!
//! Attribute bags and change payloads are stored as JSONB. Multi-row writes
//! run inside a single transaction; run creation additionally takes a
//! transaction-scoped advisory lock keyed by connection so that two service
//! instances cannot both start a run for the same connection.

use super::{ChangeFilter, DiffStore, SnapshotStore, MIN_RETAINED_SNAPSHOTS};
use crate::db::queries;
use crate::error::{ApiResult, AppError};
use crate::keys::key_from_parts;
use crate::model::{
    attribute_map_from_json, attribute_map_to_json, ChangeCounts, ChangeRecord, ChangeType,
    DiffRun, Entity, EntityLevel, FieldDifference, RunStatus, SnapshotStatus, SyncSnapshot,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use std::time::Duration;
use tokio_postgres::Row;
use uuid::Uuid;

/// Store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn snapshot_from_row(row: &Row) -> ApiResult<SyncSnapshot> {
    let status: String = row.try_get("status")?;
    Ok(SyncSnapshot {
        id: row.try_get("snapshot_id")?,
        connection_id: row.try_get("connection_id")?,
        captured_at: row.try_get("captured_at")?,
        status: status.parse()?,
        error: row.try_get("error_message")?,
    })
}

fn entity_from_row(row: &Row) -> ApiResult<Entity> {
    let level: String = row.try_get("level")?;
    let attributes: serde_json::Value = row.try_get("attributes")?;
    let custom_attributes: serde_json::Value = row.try_get("custom_attributes")?;

    Ok(Entity {
        level: level
            .parse()
            .map_err(|_| AppError::DataIntegrity(format!("stored entity has level '{}'", level)))?,
        schema_name: row.try_get("schema_name")?,
        table_name: row.try_get("table_name")?,
        name: row.try_get("name")?,
        attributes: attribute_map_from_json(attributes),
        custom_attributes: attribute_map_from_json(custom_attributes),
    })
}

fn run_from_row(row: &Row) -> ApiResult<DiffRun> {
    let status: String = row.try_get("status")?;
    let schemas_changed: i64 = row.try_get("schemas_changed")?;
    let tables_changed: i64 = row.try_get("tables_changed")?;
    let columns_changed: i64 = row.try_get("columns_changed")?;

    Ok(DiffRun {
        id: row.try_get("diff_run_id")?,
        connection_id: row.try_get("connection_id")?,
        older_snapshot_id: row.try_get("older_snapshot_id")?,
        newer_snapshot_id: row.try_get("newer_snapshot_id")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        status: status.parse()?,
        counts: ChangeCounts {
            schemas_changed: schemas_changed.max(0) as u64,
            tables_changed: tables_changed.max(0) as u64,
            columns_changed: columns_changed.max(0) as u64,
        },
        error: row.try_get("error_message")?,
    })
}

fn change_from_row(row: &Row) -> ApiResult<ChangeRecord> {
    let schema_name: String = row.try_get("schema_name")?;
    let table_name: Option<String> = row.try_get("table_name")?;
    let column_name: Option<String> = row.try_get("column_name")?;
    let change_type: String = row.try_get("change_type")?;
    let older: Option<serde_json::Value> = row.try_get("older_payload")?;
    let newer: Option<serde_json::Value> = row.try_get("newer_payload")?;
    let differences: Option<serde_json::Value> = row.try_get("differences")?;

    let key = key_from_parts(&schema_name, table_name.as_deref(), column_name.as_deref())?;
    let change_type: ChangeType = change_type
        .parse()
        .map_err(|_| AppError::DataIntegrity(format!("stored change type '{}'", change_type)))?;
    let differences: Vec<FieldDifference> = match differences {
        Some(value) => serde_json::from_value(value)?,
        None => Vec::new(),
    };

    Ok(ChangeRecord::new(
        row.try_get("diff_run_id")?,
        key,
        change_type,
        older.map(serde_json::from_value).transpose()?,
        newer.map(serde_json::from_value).transpose()?,
        differences,
    ))
}

fn payload(entity: &Option<Entity>) -> ApiResult<Option<serde_json::Value>> {
    Ok(entity.as_ref().map(serde_json::to_value).transpose()?)
}

fn count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn begin_snapshot(
        &self,
        connection_id: &str,
        captured_at: DateTime<Utc>,
    ) -> ApiResult<SyncSnapshot> {
        let snapshot = SyncSnapshot::new(connection_id, captured_at);
        let client = self.pool.get().await?;
        client
            .execute(
                queries::INSERT_SNAPSHOT,
                &[
                    &snapshot.id,
                    &snapshot.connection_id,
                    &snapshot.captured_at,
                    &snapshot.status.as_str(),
                ],
            )
            .await?;

        tracing::info!(
            "Started snapshot {} for connection {}",
            snapshot.id,
            connection_id
        );
        Ok(snapshot)
    }

    async fn append_entities(&self, snapshot_id: Uuid, entities: Vec<Entity>) -> ApiResult<usize> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(queries::LOCK_SNAPSHOT, &[&snapshot_id])
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Snapshot {} not found", snapshot_id)))?;
        let status: SnapshotStatus = row.try_get::<_, String>(0)?.parse()?;
        if status != SnapshotStatus::Running {
            return Err(AppError::InvalidTransition(format!(
                "snapshot {} is {} and no longer accepts entities",
                snapshot_id,
                status.as_str()
            )));
        }

        let statement = tx.prepare_cached(queries::INSERT_ENTITY).await?;
        for entity in &entities {
            let attributes = attribute_map_to_json(&entity.attributes);
            let custom_attributes = attribute_map_to_json(&entity.custom_attributes);
            tx.execute(
                &statement,
                &[
                    &snapshot_id,
                    &entity.level.as_str(),
                    &entity.schema_name,
                    &entity.table_name,
                    &entity.name,
                    &attributes,
                    &custom_attributes,
                ],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(entities.len())
    }

    async fn finish_snapshot(
        &self,
        snapshot_id: Uuid,
        status: SnapshotStatus,
        error: Option<String>,
    ) -> ApiResult<SyncSnapshot> {
        SnapshotStatus::Running.transition(status)?;

        let client = self.pool.get().await?;
        match client
            .query_opt(queries::FINISH_SNAPSHOT, &[&snapshot_id, &status.as_str(), &error])
            .await?
        {
            Some(row) => {
                let snapshot = snapshot_from_row(&row)?;
                tracing::info!(
                    "Snapshot {} for connection {} is {}",
                    snapshot_id,
                    snapshot.connection_id,
                    status.as_str()
                );
                Ok(snapshot)
            }
            None => match self.get_snapshot(snapshot_id).await? {
                Some(existing) => Err(AppError::InvalidTransition(format!(
                    "snapshot cannot move from {} to {}",
                    existing.status.as_str(),
                    status.as_str()
                ))),
                None => Err(AppError::NotFound(format!("Snapshot {} not found", snapshot_id))),
            },
        }
    }

    async fn get_snapshot(&self, snapshot_id: Uuid) -> ApiResult<Option<SyncSnapshot>> {
        let client = self.pool.get().await?;
        client
            .query_opt(queries::GET_SNAPSHOT, &[&snapshot_id])
            .await?
            .map(|row| snapshot_from_row(&row))
            .transpose()
    }

    async fn connection_exists(&self, connection_id: &str) -> ApiResult<bool> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(queries::CONNECTION_EXISTS, &[&connection_id])
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn list_completed_snapshots(&self, connection_id: &str) -> ApiResult<Vec<SyncSnapshot>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(queries::LIST_COMPLETED_SNAPSHOTS, &[&connection_id])
            .await?;
        rows.iter().map(snapshot_from_row).collect()
    }

    async fn list_entities(&self, snapshot_id: Uuid, level: EntityLevel) -> ApiResult<Vec<Entity>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(queries::LIST_ENTITIES, &[&snapshot_id, &level.as_str()])
            .await?;
        if rows.is_empty() && self.get_snapshot(snapshot_id).await?.is_none() {
            return Err(AppError::NotFound(format!("Snapshot {} not found", snapshot_id)));
        }
        rows.iter().map(entity_from_row).collect()
    }

    async fn prune_snapshots(&self, connection_id: &str, keep: usize) -> ApiResult<usize> {
        let keep = count(keep.max(MIN_RETAINED_SNAPSHOTS) as u64);
        let client = self.pool.get().await?;
        let removed = client
            .execute(queries::PRUNE_SNAPSHOTS, &[&connection_id, &keep])
            .await?;

        if removed > 0 {
            tracing::info!(
                "Pruned {} old snapshots for connection {}",
                removed,
                connection_id
            );
        }
        Ok(removed as usize)
    }
}

#[async_trait]
impl DiffStore for PgStore {
    async fn create_run(&self, run: &DiffRun, stale_after: Duration) -> ApiResult<()> {
        if run.status != RunStatus::Running {
            return Err(AppError::InvalidTransition(format!(
                "diff run {} must be running when created, found {}",
                run.id, run.status
            )));
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::zero());

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        tx.execute(queries::LOCK_CONNECTION, &[&run.connection_id])
            .await?;

        let active: i64 = tx
            .query_one(queries::COUNT_ACTIVE_RUNS, &[&run.connection_id, &cutoff])
            .await?
            .try_get(0)?;
        if active > 0 {
            return Err(AppError::Conflict(format!(
                "a diff run is already running for connection {}",
                run.connection_id
            )));
        }

        tx.execute(
            queries::INSERT_RUN,
            &[
                &run.id,
                &run.connection_id,
                &run.older_snapshot_id,
                &run.newer_snapshot_id,
                &run.started_at,
                &run.status.as_str(),
            ],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn commit_run(&self, run: &DiffRun, records: &[ChangeRecord]) -> ApiResult<()> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let updated = tx
            .execute(
                queries::COMPLETE_RUN,
                &[
                    &run.id,
                    &run.completed_at.unwrap_or_else(Utc::now),
                    &count(run.counts.schemas_changed),
                    &count(run.counts.tables_changed),
                    &count(run.counts.columns_changed),
                ],
            )
            .await?;
        if updated == 0 {
            return Err(AppError::InvalidTransition(format!(
                "diff run {} is not running and cannot be completed",
                run.id
            )));
        }

        let statement = tx.prepare_cached(queries::INSERT_CHANGE).await?;
        for record in records {
            if record.diff_run_id != run.id {
                return Err(AppError::DataIntegrity(format!(
                    "change record for {} belongs to diff run {}",
                    record.qualified_key, record.diff_run_id
                )));
            }

            let differences = record
                .differences
                .as_ref()
                .map(serde_json::to_value)
                .transpose()?;
            tx.execute(
                &statement,
                &[
                    &run.id,
                    &record.level.as_str(),
                    &record.qualified_key.to_string(),
                    &record.schema_name,
                    &record.table_name,
                    &record.column_name,
                    &record.change_type.as_str(),
                    &payload(&record.older)?,
                    &payload(&record.newer)?,
                    &differences,
                ],
            )
            .await?;
        }

        // Dropping the transaction on any error above rolls everything back
        tx.commit().await?;
        Ok(())
    }

    async fn fail_run(&self, run: &DiffRun) -> ApiResult<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                queries::FAIL_RUN,
                &[&run.id, &run.completed_at.unwrap_or_else(Utc::now), &run.error],
            )
            .await?;
        if updated == 0 {
            return Err(AppError::InvalidTransition(format!(
                "diff run {} is not running and cannot be failed",
                run.id
            )));
        }
        Ok(())
    }

    async fn get_run(&self, diff_run_id: Uuid) -> ApiResult<Option<DiffRun>> {
        let sql = queries::get_run();
        let client = self.pool.get().await?;
        client
            .query_opt(sql.as_str(), &[&diff_run_id])
            .await?
            .map(|row| run_from_row(&row))
            .transpose()
    }

    async fn list_runs(&self, connection_id: &str, limit: usize) -> ApiResult<Vec<DiffRun>> {
        let sql = queries::list_runs();
        let client = self.pool.get().await?;
        let rows = client
            .query(sql.as_str(), &[&connection_id, &count(limit as u64)])
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn list_changes(
        &self,
        diff_run_id: Uuid,
        filter: ChangeFilter,
    ) -> ApiResult<Vec<ChangeRecord>> {
        let client = self.pool.get().await?;
        let exists: bool = client
            .query_one(queries::RUN_EXISTS, &[&diff_run_id])
            .await?
            .try_get(0)?;
        if !exists {
            return Err(AppError::NotFound(format!("Diff run {} not found", diff_run_id)));
        }

        let level = filter.level.map(|l| l.as_str());
        let change_type = filter.change_type.map(|c| c.as_str());
        let rows = client
            .query(queries::LIST_CHANGES, &[&diff_run_id, &level, &change_type])
            .await?;
        rows.iter().map(change_from_row).collect()
    }
}
