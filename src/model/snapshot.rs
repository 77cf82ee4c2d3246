//! Snapshot and entity records
//!
//! A snapshot is one full extraction of a connection's catalog. Its entities
//! (schemas, tables, columns) are written once and never updated.

use super::value::{AttrValue, AttributeMap};
use crate::error::{ApiResult, AppError};
use crate::keys::{build_key, QualifiedKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Level of an entity in the schema -> table -> column hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityLevel {
    Schema,
    Table,
    Column,
}

impl EntityLevel {
    /// Levels in processing order
    pub const ALL: [EntityLevel; 3] = [EntityLevel::Schema, EntityLevel::Table, EntityLevel::Column];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityLevel::Schema => "schema",
            EntityLevel::Table => "table",
            EntityLevel::Column => "column",
        }
    }

    /// Number of path segments in a qualified key at this level
    pub fn depth(&self) -> usize {
        match self {
            EntityLevel::Schema => 1,
            EntityLevel::Table => 2,
            EntityLevel::Column => 3,
        }
    }
}

impl fmt::Display for EntityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityLevel {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schema" => Ok(EntityLevel::Schema),
            "table" => Ok(EntityLevel::Table),
            "column" => Ok(EntityLevel::Column),
            other => Err(AppError::BadRequest(format!("Unknown entity level '{}'", other))),
        }
    }
}

/// A schema, table or column captured in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub level: EntityLevel,
    /// Owning schema (equal to `name` for schema entities)
    pub schema_name: String,
    /// Owning table, set for column entities
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    pub name: String,
    #[serde(default)]
    pub attributes: AttributeMap,
    #[serde(default)]
    pub custom_attributes: AttributeMap,
}

impl Entity {
    pub fn schema(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            level: EntityLevel::Schema,
            schema_name: name.clone(),
            table_name: None,
            name,
            attributes: AttributeMap::new(),
            custom_attributes: AttributeMap::new(),
        }
    }

    pub fn table(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            level: EntityLevel::Table,
            schema_name: schema.into(),
            table_name: None,
            name: name.into(),
            attributes: AttributeMap::new(),
            custom_attributes: AttributeMap::new(),
        }
    }

    pub fn column(
        schema: impl Into<String>,
        table: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            level: EntityLevel::Column,
            schema_name: schema.into(),
            table_name: Some(table.into()),
            name: name.into(),
            attributes: AttributeMap::new(),
            custom_attributes: AttributeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_custom_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<AttrValue>,
    ) -> Self {
        self.custom_attributes.insert(key.into(), value.into());
        self
    }

    /// Derive the hierarchical identity used to match this entity across snapshots
    pub fn qualified_key(&self) -> ApiResult<QualifiedKey> {
        match self.level {
            EntityLevel::Schema => build_key(EntityLevel::Schema, &[], &self.name),
            EntityLevel::Table => build_key(EntityLevel::Table, &[&self.schema_name], &self.name),
            EntityLevel::Column => {
                let table = self.table_name.as_deref().unwrap_or_default();
                build_key(EntityLevel::Column, &[&self.schema_name, table], &self.name)
            }
        }
    }
}

/// Lifecycle of a snapshot extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    Running,
    Completed,
    Failed,
}

impl SnapshotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotStatus::Running => "running",
            SnapshotStatus::Completed => "completed",
            SnapshotStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SnapshotStatus::Running)
    }

    /// A snapshot leaves `running` exactly once.
    pub fn transition(self, next: SnapshotStatus) -> ApiResult<SnapshotStatus> {
        match (self, next) {
            (SnapshotStatus::Running, SnapshotStatus::Completed)
            | (SnapshotStatus::Running, SnapshotStatus::Failed) => Ok(next),
            (from, to) => Err(AppError::InvalidTransition(format!(
                "snapshot cannot move from {} to {}",
                from.as_str(),
                to.as_str()
            ))),
        }
    }
}

impl FromStr for SnapshotStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(SnapshotStatus::Running),
            "completed" => Ok(SnapshotStatus::Completed),
            "failed" => Ok(SnapshotStatus::Failed),
            other => Err(AppError::Internal(format!("Unknown snapshot status '{}'", other))),
        }
    }
}

/// One extraction of structural metadata for a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSnapshot {
    pub id: Uuid,
    pub connection_id: String,
    pub captured_at: DateTime<Utc>,
    pub status: SnapshotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncSnapshot {
    pub fn new(connection_id: impl Into<String>, captured_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id: connection_id.into(),
            captured_at,
            status: SnapshotStatus::Running,
            error: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == SnapshotStatus::Completed
    }
}

/// Newest-first ordering used when selecting snapshots: capture time
/// descending, ties broken by snapshot id descending.
pub fn newest_first(a: &SyncSnapshot, b: &SyncSnapshot) -> std::cmp::Ordering {
    b.captured_at
        .cmp(&a.captured_at)
        .then_with(|| b.id.cmp(&a.id))
}
