//! Field values and row representation.
//!
//! `FieldValue` is the dynamic column value shared by the cache, the
//! coalescer, and the adapters. It is hashable and carries a stable,
//! injective string encoding so that equal logical values always map to
//! the same cache/map key.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A single column value.
///
/// The variant set is deliberately restricted to types with total equality
/// and a canonical encoding; floating point columns are out of scope for
/// point-lookup keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FieldValue {
    /// SQL NULL.
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// Returns true for `FieldValue::Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Text(_) => "text",
            Self::Uuid(_) => "uuid",
            Self::Timestamp(_) => "timestamp",
        }
    }

    /// Stable, injective string encoding.
    ///
    /// Each variant carries a distinct tag and text is length-prefixed, so
    /// two different values can never encode to the same string. This is
    /// the encoding embedded in cache keys and used for batch slot
    /// identity.
    pub fn stable_encode(&self) -> String {
        match self {
            Self::Null => "n".to_string(),
            Self::Bool(b) => format!("b:{}", if *b { 1 } else { 0 }),
            Self::Int(i) => format!("i:{i}"),
            Self::Text(s) => format!("s{}:{}", s.len(), s),
            Self::Uuid(u) => format!("u:{u}"),
            Self::Timestamp(ts) => format!("t:{}", ts.to_rfc3339_opts(SecondsFormat::Nanos, true)),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        Self::Timestamp(v)
    }
}

/// A raw database row: ordered column name to value map.
///
/// Rows are what adapters return and what the construction pipeline turns
/// into domain objects. The map is ordered so serialized rows are stable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityRow {
    columns: BTreeMap<String, FieldValue>,
}

impl EntityRow {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.columns.insert(column.into(), value.into());
        self
    }

    /// Insert a column value.
    pub fn set(&mut self, column: impl Into<String>, value: impl Into<FieldValue>) {
        self.columns.insert(column.into(), value.into());
    }

    /// Get a column value, if present.
    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.columns.get(column)
    }

    /// Get a column value that is present and non-null.
    pub fn get_non_null(&self, column: &str) -> Option<&FieldValue> {
        self.columns.get(column).filter(|v| !v.is_null())
    }

    /// Whether the row has the column at all (possibly null).
    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Iterate over (column, value) pairs in column order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.columns.iter()
    }

    /// Merge another row's columns over this one, returning the result.
    ///
    /// Used to compute the post-update shape of a row from the previous
    /// row and a change set.
    pub fn merged_with(&self, changes: &EntityRow) -> EntityRow {
        let mut merged = self.clone();
        for (column, value) in changes.iter() {
            merged.columns.insert(column.clone(), value.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_encode_tags_are_distinct() {
        let values = [
            FieldValue::Null,
            FieldValue::Bool(true),
            FieldValue::Int(1),
            FieldValue::Text("1".to_string()),
            FieldValue::Uuid(Uuid::nil()),
            FieldValue::Timestamp(Utc::now()),
        ];
        for (i, a) in values.iter().enumerate() {
            for (j, b) in values.iter().enumerate() {
                if i != j {
                    assert_ne!(a.stable_encode(), b.stable_encode());
                }
            }
        }
    }

    #[test]
    fn test_text_encoding_is_length_prefixed() {
        let a = FieldValue::Text("ab".to_string());
        let b = FieldValue::Text("a".to_string());
        assert_eq!(a.stable_encode(), "s2:ab");
        assert_eq!(b.stable_encode(), "s1:a");
    }

    #[test]
    fn test_row_builder_and_getters() {
        let row = EntityRow::new()
            .with("id", Uuid::nil())
            .with("name", "alice")
            .with("age", 30i64)
            .with("deleted_at", FieldValue::Null);

        assert_eq!(row.len(), 4);
        assert_eq!(row.get("name"), Some(&FieldValue::Text("alice".into())));
        assert!(row.contains("deleted_at"));
        assert!(row.get_non_null("deleted_at").is_none());
        assert!(row.get_non_null("age").is_some());
        assert!(row.get("missing").is_none());
    }

    #[test]
    fn test_row_merged_with_overrides_and_extends() {
        let before = EntityRow::new().with("id", 1i64).with("name", "old");
        let changes = EntityRow::new().with("name", "new").with("extra", true);

        let merged = before.merged_with(&changes);
        assert_eq!(merged.get("id"), Some(&FieldValue::Int(1)));
        assert_eq!(merged.get("name"), Some(&FieldValue::Text("new".into())));
        assert_eq!(merged.get("extra"), Some(&FieldValue::Bool(true)));
    }

    #[test]
    fn test_row_survives_json_round_trip() {
        let row = EntityRow::new()
            .with("id", Uuid::nil())
            .with("name", "alice")
            .with("deleted_at", FieldValue::Null)
            .with("created_at", Utc::now());

        let json = serde_json::to_string(&row).expect("serialize");
        let decoded: EntityRow = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, row);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn field_value_strategy() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            Just(FieldValue::Null),
            any::<bool>().prop_map(FieldValue::Bool),
            any::<i64>().prop_map(FieldValue::Int),
            ".*".prop_map(FieldValue::Text),
            any::<[u8; 16]>().prop_map(|b| FieldValue::Uuid(Uuid::from_bytes(b))),
        ]
    }

    proptest! {
        /// Property: stable encoding is injective over field values.
        #[test]
        fn prop_stable_encode_injective(a in field_value_strategy(), b in field_value_strategy()) {
            if a == b {
                prop_assert_eq!(a.stable_encode(), b.stable_encode());
            } else {
                prop_assert_ne!(a.stable_encode(), b.stable_encode());
            }
        }
    }
}
