//! Diff API Routes
//!
//! Starting diff runs and the viewer's read-only queries.

use crate::error::{not_found_error, validation_error, ApiResult};
use crate::models::{
    ChangeListData, DiffRunData, DiffRunListData, ListRunsQuery, StartDiffQuery,
    SuccessResponse,
};
use crate::state::SharedState;
use crate::store::{ChangeFilter, DiffStore};
use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    Json,
};
use uuid::Uuid;

const DEFAULT_RUN_LIMIT: usize = 20;
const MAX_RUN_LIMIT: usize = 200;

/// Start a diff run: the two latest completed snapshots, or an explicit pair
pub async fn start_diff(
    State(state): State<SharedState>,
    Path(connection_id): Path<String>,
    query: Result<Query<StartDiffQuery>, QueryRejection>,
) -> ApiResult<Json<SuccessResponse<DiffRunData>>> {
    let Query(query) = query?;
    let run = match (query.older_snapshot_id, query.newer_snapshot_id) {
        (None, None) => state.coordinator.run_latest(&connection_id).await?,
        (Some(older), Some(newer)) => {
            state
                .coordinator
                .run_between(&connection_id, older, newer)
                .await?
        }
        _ => {
            return Err(validation_error(
                "olderSnapshotId and newerSnapshotId must be given together",
            ))
        }
    };

    Ok(Json(SuccessResponse::with_data(
        format!("Diff run completed with {} changes", run.total_changed()),
        DiffRunData::from(run),
    )))
}

/// List diff runs for a connection, newest first
pub async fn list_diff_runs(
    State(state): State<SharedState>,
    Path(connection_id): Path<String>,
    query: Result<Query<ListRunsQuery>, QueryRejection>,
) -> ApiResult<Json<SuccessResponse<DiffRunListData>>> {
    let Query(query) = query?;
    let limit = query.limit.unwrap_or(DEFAULT_RUN_LIMIT).clamp(1, MAX_RUN_LIMIT);
    let diff_runs = state.store.list_runs(&connection_id, limit).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("{} diff runs", diff_runs.len()),
        DiffRunListData { diff_runs },
    )))
}

/// Most recent diff run for a connection
pub async fn get_latest_diff_run(
    State(state): State<SharedState>,
    Path(connection_id): Path<String>,
) -> ApiResult<Json<SuccessResponse<DiffRunData>>> {
    let run = state
        .store
        .latest_run(&connection_id)
        .await?
        .ok_or_else(|| not_found_error("No diff runs for this connection"))?;

    Ok(Json(SuccessResponse::with_data(
        format!("Latest diff run is {}", run.status),
        DiffRunData::from(run),
    )))
}

pub async fn get_diff_run(
    State(state): State<SharedState>,
    Path(diff_run_id): Path<Uuid>,
) -> ApiResult<Json<SuccessResponse<DiffRunData>>> {
    let run = state
        .store
        .get_run(diff_run_id)
        .await?
        .ok_or_else(|| not_found_error(format!("Diff run {} not found", diff_run_id)))?;

    Ok(Json(SuccessResponse::with_data(
        format!("Diff run is {}", run.status),
        DiffRunData::from(run),
    )))
}

/// Change records of a run, optionally filtered by level and change type
pub async fn list_changes(
    State(state): State<SharedState>,
    Path(diff_run_id): Path<Uuid>,
    filter: Result<Query<ChangeFilter>, QueryRejection>,
) -> ApiResult<Json<SuccessResponse<ChangeListData>>> {
    let Query(filter) = filter?;
    let changes = state.store.list_changes(diff_run_id, filter).await?;

    Ok(Json(SuccessResponse::with_data(
        format!("{} change records", changes.len()),
        ChangeListData {
            diff_run_id,
            count: changes.len(),
            changes,
        },
    )))
}
