//! Qualified key builder
//!
//! Derives the hierarchical identity (`schema`, `schema.table`,
//! `schema.table.column`) used to join entities across two snapshots.
//! Identifiers are matched exactly: no case folding, no trimming.

use crate::error::{ApiResult, AppError};
use crate::model::EntityLevel;
use serde::{Serialize, Serializer};
use std::fmt;

/// Path separator used when a key is rendered as text
pub const KEY_SEPARATOR: char = '.';

/// Hierarchical identity of an entity.
///
/// Equality, hashing and ordering work on the segment tuple, so names that
/// themselves contain the separator never collide with a deeper path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedKey {
    segments: Vec<String>,
}

impl QualifiedKey {
    pub fn level(&self) -> EntityLevel {
        match self.segments.len() {
            1 => EntityLevel::Schema,
            2 => EntityLevel::Table,
            _ => EntityLevel::Column,
        }
    }

    pub fn schema(&self) -> &str {
        &self.segments[0]
    }

    pub fn table(&self) -> Option<&str> {
        self.segments.get(1).map(String::as_str)
    }

    pub fn column(&self) -> Option<&str> {
        self.segments.get(2).map(String::as_str)
    }

    /// Simple (last segment) name of the entity
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for QualifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", KEY_SEPARATOR)?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

impl Serialize for QualifiedKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Build the qualified key for an entity at `level`.
///
/// `ancestors` holds the enclosing names from the outermost inwards (empty
/// for a schema, `[schema]` for a table, `[schema, table]` for a column).
/// Any empty segment is rejected since it would let two structurally
/// different entities share a key.
pub fn build_key(level: EntityLevel, ancestors: &[&str], name: &str) -> ApiResult<QualifiedKey> {
    if ancestors.len() + 1 != level.depth() {
        return Err(AppError::InvalidKey(format!(
            "{} key needs {} ancestor segment(s), got {}",
            level,
            level.depth() - 1,
            ancestors.len()
        )));
    }

    let mut segments = Vec::with_capacity(level.depth());
    for (position, segment) in ancestors.iter().copied().chain(std::iter::once(name)).enumerate() {
        if segment.is_empty() {
            return Err(AppError::InvalidKey(format!(
                "empty path segment at position {} of {} key (name '{}')",
                position + 1,
                level,
                name
            )));
        }
        segments.push(segment.to_string());
    }

    Ok(QualifiedKey { segments })
}

/// Rebuild a key from its decomposed components as stored alongside change records.
pub fn key_from_parts(
    schema: &str,
    table: Option<&str>,
    column: Option<&str>,
) -> ApiResult<QualifiedKey> {
    match (table, column) {
        (None, None) => build_key(EntityLevel::Schema, &[], schema),
        (Some(table), None) => build_key(EntityLevel::Table, &[schema], table),
        (Some(table), Some(column)) => build_key(EntityLevel::Column, &[schema, table], column),
        (None, Some(column)) => Err(AppError::InvalidKey(format!(
            "column '{}' has no owning table",
            column
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_hierarchical_keys() {
        let key = build_key(EntityLevel::Column, &["public", "orders"], "status").unwrap();
        assert_eq!(key.to_string(), "public.orders.status");
        assert_eq!(key.level(), EntityLevel::Column);
        assert_eq!(key.schema(), "public");
        assert_eq!(key.table(), Some("orders"));
        assert_eq!(key.column(), Some("status"));
        assert_eq!(key.name(), "status");
    }

    #[test]
    fn test_rejects_empty_segments() {
        assert!(build_key(EntityLevel::Schema, &[], "").is_err());
        assert!(build_key(EntityLevel::Table, &[""], "users").is_err());
        assert!(build_key(EntityLevel::Column, &["public", ""], "id").is_err());
    }

    #[test]
    fn test_rejects_wrong_segment_count() {
        assert!(build_key(EntityLevel::Table, &[], "users").is_err());
        assert!(build_key(EntityLevel::Schema, &["public"], "users").is_err());
    }

    #[test]
    fn test_case_and_whitespace_are_significant() {
        let lower = build_key(EntityLevel::Table, &["public"], "users").unwrap();
        let upper = build_key(EntityLevel::Table, &["public"], "Users").unwrap();
        let padded = build_key(EntityLevel::Table, &["public"], "users ").unwrap();
        assert_ne!(lower, upper);
        assert_ne!(lower, padded);
    }

    #[test]
    fn test_dotted_names_do_not_collide() {
        let dotted_schema = build_key(EntityLevel::Table, &["a.b"], "c").unwrap();
        let dotted_table = build_key(EntityLevel::Table, &["a"], "b.c").unwrap();
        assert_eq!(dotted_schema.to_string(), dotted_table.to_string());
        assert_ne!(dotted_schema, dotted_table);
    }

    #[test]
    fn test_round_trips_through_parts() {
        let key = build_key(EntityLevel::Table, &["sales"], "orders").unwrap();
        let rebuilt = key_from_parts(key.schema(), key.table(), key.column()).unwrap();
        assert_eq!(key, rebuilt);
        assert!(key_from_parts("sales", None, Some("id")).is_err());
    }
}
