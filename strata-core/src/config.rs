//! Entity schema configuration.
//!
//! `EntityConfiguration` is the immutable schema descriptor the
//! application hands to the data-access layer: table identity, id field,
//! field definitions, declared composite field groups, and the cache key
//! version used by the invalidation scheme. The core only reads it.

use crate::error::{EntityError, EntityResult};
use std::collections::BTreeMap;

/// Definition of a single entity field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    /// Column name in the underlying table.
    pub column_name: String,
    /// Whether point lookups by this field are cached.
    pub cacheable: bool,
}

impl FieldDefinition {
    /// Uncached field backed by the column of the same name.
    pub fn plain(column_name: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            cacheable: false,
        }
    }

    /// Cached field backed by the column of the same name.
    pub fn cached(column_name: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            cacheable: true,
        }
    }
}

/// Immutable schema descriptor for one entity table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityConfiguration {
    table_name: String,
    id_field: String,
    fields: BTreeMap<String, FieldDefinition>,
    composite_field_groups: Vec<Vec<String>>,
    cache_key_version: u32,
    cacheable: bool,
}

impl EntityConfiguration {
    /// Start building a configuration for the given table.
    pub fn builder(table_name: impl Into<String>) -> EntityConfigurationBuilder {
        EntityConfigurationBuilder::new(table_name)
    }

    /// Table name.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Name of the id field.
    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// Field definition by name.
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.get(name)
    }

    /// All declared field names.
    pub fn field_names(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Declared composite field groups, each in its fixed declared order.
    pub fn composite_field_groups(&self) -> &[Vec<String>] {
        &self.composite_field_groups
    }

    /// Cache key version embedded in every cache key for this table.
    pub fn cache_key_version(&self) -> u32 {
        self.cache_key_version
    }

    /// Whether this entity participates in the read-through cache at all.
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Whether point lookups by this single field are cached.
    pub fn is_field_cacheable(&self, name: &str) -> bool {
        self.cacheable
            && self
                .fields
                .get(name)
                .map(|f| f.cacheable)
                .unwrap_or(false)
    }
}

/// Builder for `EntityConfiguration` with declaration-time validation.
#[derive(Debug, Clone)]
pub struct EntityConfigurationBuilder {
    table_name: String,
    id_field: Option<String>,
    fields: BTreeMap<String, FieldDefinition>,
    composite_field_groups: Vec<Vec<String>>,
    cache_key_version: u32,
    cacheable: bool,
}

impl EntityConfigurationBuilder {
    fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            id_field: None,
            fields: BTreeMap::new(),
            composite_field_groups: Vec::new(),
            cache_key_version: 0,
            cacheable: true,
        }
    }

    /// Declare the id field. Implies a cacheable field definition.
    pub fn id_field(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.fields
            .insert(name.clone(), FieldDefinition::cached(name.clone()));
        self.id_field = Some(name);
        self
    }

    /// Declare a field.
    pub fn field(mut self, name: impl Into<String>, definition: FieldDefinition) -> Self {
        self.fields.insert(name.into(), definition);
        self
    }

    /// Declare a composite field group in its fixed order.
    pub fn composite_field_group(mut self, fields: Vec<String>) -> Self {
        self.composite_field_groups.push(fields);
        self
    }

    /// Set the cache key version.
    pub fn cache_key_version(mut self, version: u32) -> Self {
        self.cache_key_version = version;
        self
    }

    /// Disable the read-through cache for this entity entirely.
    pub fn uncacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    /// Validate and build the immutable configuration.
    pub fn build(self) -> EntityResult<EntityConfiguration> {
        let id_field = self.id_field.ok_or_else(|| EntityError::Validation {
            field: "id_field".to_string(),
            reason: format!("no id field declared for table {}", self.table_name),
        })?;

        for group in &self.composite_field_groups {
            if group.len() < 2 {
                return Err(EntityError::Validation {
                    field: "composite_field_groups".to_string(),
                    reason: "composite field groups need at least two fields".to_string(),
                });
            }
            for field in group {
                if !self.fields.contains_key(field) {
                    return Err(EntityError::Validation {
                        field: field.clone(),
                        reason: format!(
                            "composite group references undeclared field on {}",
                            self.table_name
                        ),
                    });
                }
            }
        }

        Ok(EntityConfiguration {
            table_name: self.table_name,
            id_field,
            fields: self.fields,
            composite_field_groups: self.composite_field_groups,
            cache_key_version: self.cache_key_version,
            cacheable: self.cacheable,
        })
    }
}
