//! Data models and DTOs (Data Transfer Objects)
//!
//! Contains all request/response structures used by the API.

use crate::model::{
    attribute_map_from_json, ChangeRecord, DiffRun, Entity, EntityLevel, SyncSnapshot,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// One entity as produced by the extractor
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EntityPayload {
    pub level: EntityLevel,

    #[validate(length(min = 1, message = "Schema name is required"))]
    pub schema_name: String,

    #[serde(default)]
    pub table_name: Option<String>,

    #[validate(length(min = 1, message = "Entity name is required"))]
    pub name: String,

    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub custom_attributes: serde_json::Map<String, serde_json::Value>,
}

impl From<EntityPayload> for Entity {
    fn from(payload: EntityPayload) -> Self {
        Entity {
            level: payload.level,
            schema_name: payload.schema_name,
            table_name: payload.table_name,
            name: payload.name,
            attributes: attribute_map_from_json(serde_json::Value::Object(payload.attributes)),
            custom_attributes: attribute_map_from_json(serde_json::Value::Object(
                payload.custom_attributes,
            )),
        }
    }
}

/// Request to store one extraction of a connection's catalog
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IngestSnapshotRequest {
    /// Capture time (defaults to now)
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,

    /// Set when the extraction itself failed; the snapshot is then recorded as failed
    #[serde(default)]
    #[validate(length(min = 1, message = "Error detail cannot be empty"))]
    pub error: Option<String>,

    #[serde(default)]
    #[validate(nested)]
    pub entities: Vec<EntityPayload>,
}

/// Optional explicit snapshot pair for a diff run
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDiffQuery {
    pub older_snapshot_id: Option<Uuid>,
    pub newer_snapshot_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRunsQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneQuery {
    pub keep: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotData {
    pub snapshot: SyncSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_count: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotListData {
    pub snapshots: Vec<SyncSnapshot>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneData {
    pub removed: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRunData {
    pub diff_run: DiffRun,
    pub total_changed: u64,
}

impl From<DiffRun> for DiffRunData {
    fn from(diff_run: DiffRun) -> Self {
        Self {
            total_changed: diff_run.total_changed(),
            diff_run,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRunListData {
    pub diff_runs: Vec<DiffRun>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeListData {
    pub diff_run_id: Uuid,
    pub count: usize,
    pub changes: Vec<ChangeRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttrValue;
    use serde_json::json;

    #[test]
    fn test_entity_payload_conversion() {
        let payload: EntityPayload = serde_json::from_value(json!({
            "level": "column",
            "schemaName": "public",
            "tableName": "users",
            "name": "created_at",
            "attributes": {"dataType": "timestamptz", "ordinal": 3},
            "customAttributes": {"lastSyncRunAt": "2024-05-01T08:00:00Z"}
        }))
        .unwrap();

        let entity = Entity::from(payload);
        assert_eq!(entity.qualified_key().unwrap().to_string(), "public.users.created_at");
        assert_eq!(entity.attributes.get("ordinal"), Some(&AttrValue::Integer(3)));
        assert!(matches!(
            entity.custom_attributes.get("lastSyncRunAt"),
            Some(AttrValue::Timestamp(..))
        ));
    }

    #[test]
    fn test_ingest_validation() {
        let request: IngestSnapshotRequest = serde_json::from_value(json!({
            "entities": [{"level": "schema", "schemaName": "", "name": ""}]
        }))
        .unwrap();
        assert!(request.validate().is_err());

        let request: IngestSnapshotRequest = serde_json::from_value(json!({
            "entities": [{"level": "schema", "schemaName": "public", "name": "public"}]
        }))
        .unwrap();
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_success_response_flattens_data() {
        let body = serde_json::to_value(SuccessResponse::with_data(
            "Pruned",
            PruneData { removed: 3 },
        ))
        .unwrap();
        assert_eq!(body, json!({"success": true, "message": "Pruned", "removed": 3}));
    }
}
