//! Diff run and change record types

use super::snapshot::{Entity, EntityLevel};
use super::value::AttrValue;
use crate::error::{ApiResult, AppError};
use crate::keys::QualifiedKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a diff run: `created -> running -> {completed, failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Created => "created",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Apply a transition, rejecting anything that would revive or skip a state.
    pub fn transition(self, next: RunStatus) -> ApiResult<RunStatus> {
        match (self, next) {
            (RunStatus::Created, RunStatus::Running)
            | (RunStatus::Running, RunStatus::Completed)
            | (RunStatus::Running, RunStatus::Failed) => Ok(next),
            (from, to) => Err(AppError::InvalidTransition(format!(
                "diff run cannot move from {} to {}",
                from.as_str(),
                to.as_str()
            ))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(RunStatus::Created),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(AppError::Internal(format!("Unknown diff run status '{}'", other))),
        }
    }
}

/// Per-level count of added + removed + modified entities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeCounts {
    pub schemas_changed: u64,
    pub tables_changed: u64,
    pub columns_changed: u64,
}

impl ChangeCounts {
    pub fn record(&mut self, level: EntityLevel, change_type: ChangeType) {
        if !change_type.is_change() {
            return;
        }
        match level {
            EntityLevel::Schema => self.schemas_changed += 1,
            EntityLevel::Table => self.tables_changed += 1,
            EntityLevel::Column => self.columns_changed += 1,
        }
    }

    pub fn for_level(&self, level: EntityLevel) -> u64 {
        match level {
            EntityLevel::Schema => self.schemas_changed,
            EntityLevel::Table => self.tables_changed,
            EntityLevel::Column => self.columns_changed,
        }
    }

    pub fn total(&self) -> u64 {
        self.schemas_changed + self.tables_changed + self.columns_changed
    }
}

/// One comparison between two snapshots of the same connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRun {
    pub id: Uuid,
    pub connection_id: String,
    pub older_snapshot_id: Uuid,
    pub newer_snapshot_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    #[serde(flatten)]
    pub counts: ChangeCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DiffRun {
    pub fn new(connection_id: impl Into<String>, older_snapshot_id: Uuid, newer_snapshot_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id: connection_id.into(),
            older_snapshot_id,
            newer_snapshot_id,
            started_at: Utc::now(),
            completed_at: None,
            status: RunStatus::Created,
            counts: ChangeCounts::default(),
            error: None,
        }
    }

    pub fn start(&mut self) -> ApiResult<()> {
        self.status = self.status.transition(RunStatus::Running)?;
        self.started_at = Utc::now();
        Ok(())
    }

    pub fn complete(&mut self, counts: ChangeCounts) -> ApiResult<()> {
        self.status = self.status.transition(RunStatus::Completed)?;
        self.counts = counts;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Failed runs keep zero counts: nothing they computed is kept.
    pub fn fail(&mut self, reason: impl Into<String>) -> ApiResult<()> {
        self.status = self.status.transition(RunStatus::Failed)?;
        self.counts = ChangeCounts::default();
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn total_changed(&self) -> u64 {
        self.counts.total()
    }
}

/// Classification of one key within a diff run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    Unchanged,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Added => "added",
            ChangeType::Removed => "removed",
            ChangeType::Modified => "modified",
            ChangeType::Unchanged => "unchanged",
        }
    }

    pub fn is_change(&self) -> bool {
        !matches!(self, ChangeType::Unchanged)
    }
}

impl FromStr for ChangeType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(ChangeType::Added),
            "removed" => Ok(ChangeType::Removed),
            "modified" => Ok(ChangeType::Modified),
            "unchanged" => Ok(ChangeType::Unchanged),
            other => Err(AppError::BadRequest(format!("Unknown change type '{}'", other))),
        }
    }
}

/// Which attribute bag a difference was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AttributeScope {
    Attributes,
    CustomAttributes,
}

/// A top-level attribute whose value differs between the two snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDifference {
    pub scope: AttributeScope,
    pub field: String,
    /// `None` when the key is absent on the older side
    pub old_value: Option<AttrValue>,
    /// `None` when the key is absent on the newer side
    pub new_value: Option<AttrValue>,
}

/// Persisted outcome for one qualified key within a diff run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub diff_run_id: Uuid,
    pub level: EntityLevel,
    pub qualified_key: QualifiedKey,
    pub schema_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
    pub change_type: ChangeType,
    /// Entity as captured in the older snapshot (absent when added)
    pub older: Option<Entity>,
    /// Entity as captured in the newer snapshot (absent when removed)
    pub newer: Option<Entity>,
    /// Field-level deltas (present only when modified)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub differences: Option<Vec<FieldDifference>>,
}

impl ChangeRecord {
    pub fn new(
        diff_run_id: Uuid,
        key: QualifiedKey,
        change_type: ChangeType,
        older: Option<Entity>,
        newer: Option<Entity>,
        differences: Vec<FieldDifference>,
    ) -> Self {
        let level = key.level();
        Self {
            diff_run_id,
            level,
            schema_name: key.schema().to_string(),
            table_name: key.table().map(str::to_string),
            column_name: key.column().map(str::to_string),
            qualified_key: key,
            change_type,
            older,
            newer,
            differences: (change_type == ChangeType::Modified).then_some(differences),
        }
    }
}
