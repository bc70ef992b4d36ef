//! Database adapter contract.
//!
//! The adapter is the only component that talks to the relational store.
//! It must report structured `DatabaseError`s, never raw driver errors;
//! isolation-level semantics (read committed vs. serializable) are the
//! adapter's responsibility and are documented here, not enforced: under
//! read committed, concurrent conflicting writes may interleave between
//! a fetch and a dependent write.

use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

use strata_core::{EntityConfiguration, EntityResult, EntityRow, FieldValue, LoadKey, LoadValue};

use crate::context::QueryContext;

/// One `field = value` condition of a conjunction query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEqualityCondition {
    pub field: String,
    pub value: FieldValue,
}

impl FieldEqualityCondition {
    pub fn new(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Sort direction for an order-by modifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

/// Order-by modifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: OrderDirection,
}

/// Modifiers applied to non-point-lookup queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryModifiers {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order_by: Option<OrderBy>,
}

impl QueryModifiers {
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: OrderDirection) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }
}

/// A raw where-clause with positional bindings.
///
/// The clause dialect is adapter-defined; results of raw-predicate loads
/// are never cached, so the core treats the clause as opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPredicate {
    pub clause: String,
    pub bindings: Vec<FieldValue>,
}

impl RawPredicate {
    pub fn new(clause: impl Into<String>, bindings: Vec<FieldValue>) -> Self {
        Self {
            clause: clause.into(),
            bindings,
        }
    }
}

/// Storage access for one relational store.
///
/// All fetch methods are batched; transaction verbs are keyed by the
/// transaction id carried in the query context so nested scopes map to
/// savepoints in SQL implementations.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Fetch rows matching any of `values` on `key`, grouped per value.
    ///
    /// Values with no rows may be omitted from the returned map; the
    /// cache layer treats absence as an empty result.
    async fn fetch_many_where(
        &self,
        query_context: &QueryContext,
        config: &EntityConfiguration,
        key: &LoadKey,
        values: &[LoadValue],
    ) -> EntityResult<HashMap<LoadValue, Vec<EntityRow>>>;

    /// Fetch rows matching every condition of a conjunction.
    async fn fetch_many_by_field_equality_conjunction(
        &self,
        query_context: &QueryContext,
        config: &EntityConfiguration,
        conditions: &[FieldEqualityCondition],
        modifiers: &QueryModifiers,
    ) -> EntityResult<Vec<EntityRow>>;

    /// Fetch rows matching a raw predicate.
    async fn fetch_many_by_raw_predicate(
        &self,
        query_context: &QueryContext,
        config: &EntityConfiguration,
        predicate: &RawPredicate,
        modifiers: &QueryModifiers,
    ) -> EntityResult<Vec<EntityRow>>;

    /// Insert a row, returning the stored row (id assigned if absent).
    async fn insert(
        &self,
        query_context: &QueryContext,
        config: &EntityConfiguration,
        row: &EntityRow,
    ) -> EntityResult<EntityRow>;

    /// Apply a change set to the row with the given id.
    ///
    /// Returns the number of affected rows; updating a missing row is a
    /// zero-affected outcome, not an error. An empty change set is
    /// rejected with `EntityError::EmptyWrite`.
    async fn update(
        &self,
        query_context: &QueryContext,
        config: &EntityConfiguration,
        id: &FieldValue,
        changes: &EntityRow,
    ) -> EntityResult<u64>;

    /// Delete the row with the given id, returning the affected count.
    async fn delete(
        &self,
        query_context: &QueryContext,
        config: &EntityConfiguration,
        id: &FieldValue,
    ) -> EntityResult<u64>;

    /// Open a transaction (or a nested savepoint when `parent` is set).
    async fn begin_transaction(&self, id: Uuid, parent: Option<Uuid>) -> EntityResult<()>;

    /// Commit the transaction (release the savepoint).
    async fn commit_transaction(&self, id: Uuid) -> EntityResult<()>;

    /// Roll the transaction back (rewind to the savepoint).
    async fn rollback_transaction(&self, id: Uuid) -> EntityResult<()>;
}
