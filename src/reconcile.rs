//! Reconciler
//!
//! Partitions the keys of one entity level into added, removed and common
//! sets. Output vectors are sorted ascending by key so that results are
//! deterministic for tests and stable for downstream pagination.

use crate::error::{ApiResult, AppError};
use crate::keys::QualifiedKey;
use crate::model::{Entity, EntityLevel};
use std::collections::HashMap;

/// Entities of a single level indexed by qualified key
pub type KeyedEntities = HashMap<QualifiedKey, Entity>;

/// Outcome of reconciling two keyed entity sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// In the newer set only
    pub added: Vec<QualifiedKey>,
    /// In the older set only
    pub removed: Vec<QualifiedKey>,
    /// In both sets
    pub common: Vec<QualifiedKey>,
}

impl Reconciliation {
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.common.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Key every entity of `level`, failing on duplicates or misplaced levels.
///
/// A duplicate key within one snapshot means the extractor broke the
/// uniqueness invariant; it is reported instead of silently deduplicated.
pub fn index_entities(level: EntityLevel, entities: Vec<Entity>) -> ApiResult<KeyedEntities> {
    let mut keyed = HashMap::with_capacity(entities.len());

    for entity in entities {
        if entity.level != level {
            return Err(AppError::DataIntegrity(format!(
                "{} entity '{}' found among {} entities",
                entity.level, entity.name, level
            )));
        }

        let key = entity.qualified_key()?;
        if keyed.contains_key(&key) {
            return Err(AppError::DataIntegrity(format!(
                "duplicate {} key '{}' within one snapshot",
                level, key
            )));
        }
        keyed.insert(key, entity);
    }

    Ok(keyed)
}

/// Classify every key of `older` and `newer` by hash-set membership.
pub fn reconcile(older: &KeyedEntities, newer: &KeyedEntities) -> Reconciliation {
    let mut result = Reconciliation::default();

    for key in older.keys() {
        if newer.contains_key(key) {
            result.common.push(key.clone());
        } else {
            result.removed.push(key.clone());
        }
    }

    result.added = newer
        .keys()
        .filter(|key| !older.contains_key(*key))
        .cloned()
        .collect();

    result.added.sort();
    result.removed.sort();
    result.common.sort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    fn columns(table: &str, names: &[&str]) -> KeyedEntities {
        let entities = names
            .iter()
            .map(|name| Entity::column("public", table, *name))
            .collect();
        index_entities(EntityLevel::Column, entities).unwrap()
    }

    fn rendered(keys: &[QualifiedKey]) -> Vec<String> {
        keys.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_partitions_keys() {
        let older = columns("users", &["id", "email", "created_at"]);
        let newer = columns("users", &["phone", "id", "created_at"]);

        let result = reconcile(&older, &newer);

        assert_eq!(rendered(&result.added), vec!["public.users.phone"]);
        assert_eq!(rendered(&result.removed), vec!["public.users.email"]);
        assert_eq!(
            rendered(&result.common),
            vec!["public.users.created_at", "public.users.id"]
        );
    }

    #[test]
    fn test_partition_is_disjoint_and_complete() {
        let older = columns("orders", &["a", "b", "c", "d"]);
        let newer = columns("orders", &["c", "d", "e", "f", "g"]);
        let result = reconcile(&older, &newer);

        let added: HashSet<_> = result.added.iter().collect();
        let removed: HashSet<_> = result.removed.iter().collect();
        let common: HashSet<_> = result.common.iter().collect();
        assert!(added.is_disjoint(&removed));
        assert!(added.is_disjoint(&common));
        assert!(removed.is_disjoint(&common));

        let union: HashSet<_> = older.keys().chain(newer.keys()).collect();
        assert_eq!(result.len(), union.len());
    }

    #[test]
    fn test_output_is_sorted() {
        let older = columns("t", &[]);
        let newer = columns("t", &["zeta", "alpha", "Mid", "beta"]);
        let result = reconcile(&older, &newer);
        assert_eq!(
            rendered(&result.added),
            vec!["public.t.Mid", "public.t.alpha", "public.t.beta", "public.t.zeta"]
        );
    }

    #[test]
    fn test_duplicate_keys_are_rejected() {
        let entities = vec![
            Entity::table("public", "users"),
            Entity::table("public", "users").with_attribute("tableType", "VIEW"),
        ];
        let err = index_entities(EntityLevel::Table, entities).unwrap_err();
        assert!(matches!(err, AppError::DataIntegrity(_)));
    }

    #[test]
    fn test_misplaced_level_is_rejected() {
        let entities = vec![Entity::schema("public")];
        assert!(index_entities(EntityLevel::Table, entities).is_err());
    }

    #[test]
    fn test_empty_sides() {
        let result = reconcile(&KeyedEntities::new(), &KeyedEntities::new());
        assert!(result.is_empty());
    }
}
