//! Load key and load value model.
//!
//! A `LoadKey` identifies which field (or ordered set of fields) a point
//! lookup matches on; a `LoadValue` carries the concrete value(s) being
//! matched. Both serialize stably so they can act as cache and batch-slot
//! keys, and composite values always encode their components in the
//! key's declared field order.

use crate::field::{EntityRow, FieldValue};
use serde::{Deserialize, Serialize};

/// Separator between composite components in stable encodings.
///
/// Components are variant-tagged and length-prefixed, so the separator
/// cannot be forged by field contents.
const COMPONENT_SEPARATOR: char = '\u{1f}';

/// Tag distinguishing coalescer families for single vs. composite loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadMethodType {
    SingleField,
    CompositeField,
}

/// Identifies the field(s) a point lookup matches against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadKey {
    /// Lookup by a single field.
    Single { field: String },
    /// Lookup by an ordered group of fields.
    Composite { fields: Vec<String> },
}

impl LoadKey {
    /// Single-field key.
    pub fn single(field: impl Into<String>) -> Self {
        Self::Single {
            field: field.into(),
        }
    }

    /// Composite key over fields in their declared order.
    pub fn composite(fields: Vec<String>) -> Self {
        Self::Composite { fields }
    }

    /// The load-method tag scoping separate coalescer families.
    pub fn load_method_type(&self) -> LoadMethodType {
        match self {
            Self::Single { .. } => LoadMethodType::SingleField,
            Self::Composite { .. } => LoadMethodType::CompositeField,
        }
    }

    /// Field names in declared order.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::Single { field } => vec![field.as_str()],
            Self::Composite { fields } => fields.iter().map(String::as_str).collect(),
        }
    }

    /// Stable cache-key fragment for this key.
    pub fn serialized(&self) -> String {
        match self {
            Self::Single { field } => format!("f:{field}"),
            Self::Composite { fields } => format!("c:{}", fields.join("+")),
        }
    }

    /// Extract this key's value tuple from a full row.
    ///
    /// Returns `None` when any component field is absent or null; such
    /// rows cannot be addressed by this key.
    pub fn extract_value(&self, row: &EntityRow) -> Option<LoadValue> {
        match self {
            Self::Single { field } => row
                .get_non_null(field)
                .cloned()
                .map(LoadValue::Single),
            Self::Composite { fields } => {
                let mut components = Vec::with_capacity(fields.len());
                for field in fields {
                    components.push(row.get_non_null(field)?.clone());
                }
                Some(LoadValue::Composite(components))
            }
        }
    }

    /// Whether a value has the right shape for this key.
    pub fn matches_value(&self, value: &LoadValue) -> bool {
        match (self, value) {
            (Self::Single { .. }, LoadValue::Single(_)) => true,
            (Self::Composite { fields }, LoadValue::Composite(components)) => {
                fields.len() == components.len()
            }
            _ => false,
        }
    }
}

/// The concrete value(s) matched by a `LoadKey`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadValue {
    Single(FieldValue),
    Composite(Vec<FieldValue>),
}

impl LoadValue {
    /// Single value.
    pub fn single(value: impl Into<FieldValue>) -> Self {
        Self::Single(value.into())
    }

    /// Composite value tuple, components in the key's declared order.
    pub fn composite(components: Vec<FieldValue>) -> Self {
        Self::Composite(components)
    }

    /// Stable, injective string encoding.
    ///
    /// Equal logical tuples always produce equal encodings regardless of
    /// how the value was constructed, because components are encoded in
    /// the fixed declared order they were supplied in.
    pub fn stable_encode(&self) -> String {
        match self {
            Self::Single(value) => value.stable_encode(),
            Self::Composite(components) => {
                let encoded: Vec<String> =
                    components.iter().map(FieldValue::stable_encode).collect();
                format!(
                    "({})",
                    encoded.join(&COMPONENT_SEPARATOR.to_string())
                )
            }
        }
    }
}

impl From<FieldValue> for LoadValue {
    fn from(value: FieldValue) -> Self {
        Self::Single(value)
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn component_strategy() -> impl Strategy<Value = FieldValue> {
        prop_oneof![
            any::<i64>().prop_map(FieldValue::Int),
            ".*".prop_map(FieldValue::Text),
            any::<bool>().prop_map(FieldValue::Bool),
        ]
    }

    fn tuple_strategy() -> impl Strategy<Value = Vec<FieldValue>> {
        proptest::collection::vec(component_strategy(), 1..4)
    }

    proptest! {
        /// Property: composite encoding is injective over value tuples,
        /// including tuples whose text components contain the separator.
        #[test]
        fn prop_composite_encoding_injective(a in tuple_strategy(), b in tuple_strategy()) {
            let va = LoadValue::composite(a.clone());
            let vb = LoadValue::composite(b.clone());
            if a == b {
                prop_assert_eq!(va.stable_encode(), vb.stable_encode());
            } else {
                prop_assert_ne!(va.stable_encode(), vb.stable_encode());
            }
        }
    }
}
