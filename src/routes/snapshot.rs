//! Snapshot API Routes
//!
//! Extractor hand-off (ingest) and snapshot lookups.

use crate::error::{not_found_error, validation_error, ApiResult};
use crate::model::{Entity, SnapshotStatus};
use crate::models::{
    IngestSnapshotRequest, PruneData, PruneQuery, SnapshotData, SnapshotListData,
    SuccessResponse,
};
use crate::state::SharedState;
use crate::store::{save_snapshot, SnapshotStore};
use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

/// Store one extraction for a connection
pub async fn ingest_snapshot(
    State(state): State<SharedState>,
    Path(connection_id): Path<String>,
    Json(payload): Json<IngestSnapshotRequest>,
) -> ApiResult<Json<SuccessResponse<SnapshotData>>> {
    // Validate input
    payload.validate().map_err(|e| validation_error(e.to_string()))?;
    if connection_id.trim().is_empty() {
        return Err(validation_error("Connection id is required"));
    }

    let captured_at = payload.captured_at.unwrap_or_else(Utc::now);

    if let Some(reason) = payload.error {
        let snapshot = state.store.begin_snapshot(&connection_id, captured_at).await?;
        let snapshot = state
            .store
            .finish_snapshot(snapshot.id, SnapshotStatus::Failed, Some(reason))
            .await?;
        return Ok(Json(SuccessResponse::with_data(
            "Failed extraction recorded",
            SnapshotData { snapshot, entity_count: Some(0) },
        )));
    }

    let entities: Vec<Entity> = payload.entities.into_iter().map(Entity::from).collect();
    // Reject malformed paths up front; duplicates are left for the diff run to report
    for entity in &entities {
        entity.qualified_key()?;
    }
    let entity_count = entities.len();

    let snapshot = save_snapshot(state.store.as_ref(), &connection_id, captured_at, entities).await?;

    tracing::info!(
        "Stored snapshot {} for connection {} ({} entities)",
        snapshot.id,
        connection_id,
        entity_count
    );

    Ok(Json(SuccessResponse::with_data(
        format!("Snapshot {} stored", snapshot.id),
        SnapshotData { snapshot, entity_count: Some(entity_count) },
    )))
}

/// List completed snapshots for a connection, newest first
pub async fn list_snapshots(
    State(state): State<SharedState>,
    Path(connection_id): Path<String>,
) -> ApiResult<Json<SuccessResponse<SnapshotListData>>> {
    let snapshots = state.store.list_completed_snapshots(&connection_id).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("{} completed snapshots", snapshots.len()),
        SnapshotListData { snapshots },
    )))
}

/// Get the latest completed snapshot for a connection
pub async fn get_latest_snapshot(
    State(state): State<SharedState>,
    Path(connection_id): Path<String>,
) -> ApiResult<Json<SuccessResponse<SnapshotData>>> {
    let snapshot = state
        .store
        .latest_completed_snapshot(&connection_id)
        .await?
        .ok_or_else(|| not_found_error("No completed snapshots for this connection"))?;

    Ok(Json(SuccessResponse::with_data(
        "Latest completed snapshot",
        SnapshotData { snapshot, entity_count: None },
    )))
}

/// Get a snapshot by id, whatever its status
pub async fn get_snapshot(
    State(state): State<SharedState>,
    Path(snapshot_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<SnapshotData>>> {
    let snapshot = state
        .store
        .get_snapshot(snapshot_id)
        .await?
        .ok_or_else(|| not_found_error(format!("Snapshot {} not found", snapshot_id)))?;

    Ok(Json(SuccessResponse::with_data(
        format!("Snapshot is {}", snapshot.status.as_str()),
        SnapshotData { snapshot, entity_count: None },
    )))
}

/// Delete old snapshots, keeping the newest `keep` completed ones (never fewer than 2)
pub async fn prune_snapshots(
    State(state): State<SharedState>,
    Path(connection_id): Path<String>,
    query: Result<Query<PruneQuery>, QueryRejection>,
) -> ApiResult<Json<SuccessResponse<PruneData>>> {
    let Query(query) = query?;
    let removed = state
        .store
        .prune_snapshots(&connection_id, query.keep.unwrap_or(10))
        .await?;

    Ok(Json(SuccessResponse::with_data(
        format!("Pruned {} snapshots", removed),
        PruneData { removed },
    )))
}
