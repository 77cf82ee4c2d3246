//! Attribute Differ
//!
//! Field-level comparison of two versions of the same entity. Both attribute
//! bags are decomposed one level deep: a change anywhere inside a nested value
//! is reported against its top-level key.

use crate::config::DiffSettings;
use crate::model::{AttributeMap, AttributeScope, ChangeType, Entity, FieldDifference};
use std::collections::BTreeSet;

/// Compares entities present in both snapshots
#[derive(Debug, Clone, Default)]
pub struct AttributeDiffer {
    ignored_attributes: BTreeSet<String>,
    ignored_custom_attributes: BTreeSet<String>,
}

impl AttributeDiffer {
    pub fn new(settings: &DiffSettings) -> Self {
        Self {
            ignored_attributes: settings.ignored_attributes.clone(),
            ignored_custom_attributes: settings.ignored_custom_attributes.clone(),
        }
    }

    /// Classify `newer` against `older` as modified or unchanged.
    ///
    /// Added and removed are decided by the reconciler; this only runs on keys
    /// present on both sides.
    pub fn diff(&self, older: &Entity, newer: &Entity) -> (ChangeType, Vec<FieldDifference>) {
        let mut differences = Vec::new();

        diff_maps(
            AttributeScope::Attributes,
            &older.attributes,
            &newer.attributes,
            &self.ignored_attributes,
            &mut differences,
        );
        diff_maps(
            AttributeScope::CustomAttributes,
            &older.custom_attributes,
            &newer.custom_attributes,
            &self.ignored_custom_attributes,
            &mut differences,
        );

        if differences.is_empty() {
            (ChangeType::Unchanged, differences)
        } else {
            (ChangeType::Modified, differences)
        }
    }
}

fn diff_maps(
    scope: AttributeScope,
    older: &AttributeMap,
    newer: &AttributeMap,
    ignored: &BTreeSet<String>,
    out: &mut Vec<FieldDifference>,
) {
    let fields: BTreeSet<&String> = older.keys().chain(newer.keys()).collect();

    for field in fields {
        if ignored.contains(field) {
            continue;
        }

        // A missing key and an explicit null are the same thing
        let old_value = older.get(field).filter(|v| !v.is_null());
        let new_value = newer.get(field).filter(|v| !v.is_null());

        let same = match (old_value, new_value) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        };

        if !same {
            out.push(FieldDifference {
                scope,
                field: field.clone(),
                old_value: old_value.cloned(),
                new_value: new_value.cloned(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttrValue;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn differ() -> AttributeDiffer {
        AttributeDiffer::new(&DiffSettings::default())
    }

    #[test]
    fn test_identical_entities_are_unchanged() {
        let a = Entity::column("public", "users", "id")
            .with_attribute("dataType", "integer")
            .with_attribute("nullable", false)
            .with_attribute("database", AttrValue::from(json!({"uniqueAttributes": {"qualifiedName": "t/pg/db"}})));
        let (change, diffs) = differ().diff(&a, &a.clone());
        assert_eq!(change, ChangeType::Unchanged);
        assert!(diffs.is_empty());
    }

    #[test]
    fn test_unsigned_bigint_change_is_modified() {
        let old = Entity::column("shop", "counters", "hits")
            .with_attribute("maxValue", AttrValue::from(json!(u64::MAX)));
        let new = Entity::column("shop", "counters", "hits")
            .with_attribute("maxValue", AttrValue::from(json!(u64::MAX - 1)));

        let (change, diffs) = differ().diff(&old, &new);
        assert_eq!(change, ChangeType::Modified);
        assert_eq!(diffs.len(), 1);
    }

    #[test]
    fn test_integer_near_float_precision_is_modified() {
        let old = Entity::column("shop", "counters", "hits")
            .with_attribute("defaultValue", AttrValue::from(json!(9007199254740993i64)));
        let new = Entity::column("shop", "counters", "hits")
            .with_attribute("defaultValue", AttrValue::from(json!(9007199254740992.0)));

        let (change, _) = differ().diff(&old, &new);
        assert_eq!(change, ChangeType::Modified);
    }

    #[test]
    fn test_reformatted_timestamp_is_unchanged() {
        let old = Entity::table("public", "users").with_attribute("createdAt", "2024-01-01 00:00:00+00");
        let new = Entity::table("public", "users").with_attribute("createdAt", "2024-01-01T00:00:00Z");

        let (change, _) = differ().diff(&old, &new);
        assert_eq!(change, ChangeType::Unchanged);
    }

    #[test]
    fn test_changed_scalar_is_reported() {
        let old = Entity::column("sales", "orders", "status").with_attribute("data_type", "varchar(20)");
        let new = Entity::column("sales", "orders", "status").with_attribute("data_type", "varchar(50)");

        let (change, diffs) = differ().diff(&old, &new);

        assert_eq!(change, ChangeType::Modified);
        assert_eq!(
            diffs,
            vec![FieldDifference {
                scope: AttributeScope::Attributes,
                field: "data_type".to_string(),
                old_value: Some(AttrValue::from("varchar(20)")),
                new_value: Some(AttrValue::from("varchar(50)")),
            }]
        );
    }

    #[test]
    fn test_nested_change_reported_at_top_level() {
        let old = Entity::table("public", "users")
            .with_attribute("schema", AttrValue::from(json!({"uniqueAttributes": {"qualifiedName": "a"}})));
        let new = Entity::table("public", "users")
            .with_attribute("schema", AttrValue::from(json!({"uniqueAttributes": {"qualifiedName": "b"}})));

        let (change, diffs) = differ().diff(&old, &new);
        assert_eq!(change, ChangeType::Modified);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].field, "schema");
    }

    #[test]
    fn test_one_sided_keys() {
        let old = Entity::table("public", "users").with_attribute("comment", "people");
        let new = Entity::table("public", "users").with_attribute("rowEstimate", 10i64);

        let (_, diffs) = differ().diff(&old, &new);
        let fields: Vec<_> = diffs
            .iter()
            .map(|d| (d.field.as_str(), d.old_value.is_some(), d.new_value.is_some()))
            .collect();
        assert_eq!(fields, vec![("comment", true, false), ("rowEstimate", false, true)]);
    }

    #[test]
    fn test_null_equals_missing() {
        let old = Entity::table("public", "users").with_attribute("comment", AttrValue::Null);
        let new = Entity::table("public", "users");
        assert_eq!(differ().diff(&old, &new).0, ChangeType::Unchanged);
    }

    #[test]
    fn test_custom_attributes_alone_make_it_modified() {
        let old = Entity::schema("public").with_custom_attribute("owner", "data-eng");
        let new = Entity::schema("public").with_custom_attribute("owner", "platform");

        let (change, diffs) = differ().diff(&old, &new);
        assert_eq!(change, ChangeType::Modified);
        assert_eq!(diffs[0].scope, AttributeScope::CustomAttributes);
    }

    #[test]
    fn test_timestamp_representation_is_not_a_change() {
        let old = Entity::table("public", "events").with_attribute("createdAt", "2024-05-01T08:00:00Z");
        let new = Entity::table("public", "events").with_attribute("createdAt", "2024-05-01 10:00:00+02");
        assert_eq!(differ().diff(&old, &new).0, ChangeType::Unchanged);
    }

    #[test]
    fn test_volatile_fields_are_skipped() {
        let old = Entity::table("public", "users")
            .with_custom_attribute("lastSyncRunAt", 1_700_000_000_000i64)
            .with_custom_attribute("lastSyncRun", "sync-1");
        let new = Entity::table("public", "users")
            .with_custom_attribute("lastSyncRunAt", 1_700_000_900_000i64)
            .with_custom_attribute("lastSyncRun", "sync-2");

        assert_eq!(differ().diff(&old, &new).0, ChangeType::Unchanged);

        let strict = AttributeDiffer::new(&DiffSettings::strict());
        let (change, diffs) = strict.diff(&old, &new);
        assert_eq!(change, ChangeType::Modified);
        assert_eq!(diffs.len(), 2);
    }
}
