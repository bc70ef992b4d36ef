//! In-memory database adapter.
//!
//! Table store with snapshot-based transactions, used by tests and as
//! the reference for what a relational adapter must do. Transactions
//! snapshot the whole store on begin and restore it on rollback, which
//! matches savepoint rewind for a single-writer store. Fetches are
//! counted so tests can assert coalescing and cache behavior.
//!
//! The raw-predicate dialect is deliberately tiny: `column = ?` terms
//! joined by `AND`, with positional bindings. Anything else is a
//! validation error.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

use strata_core::{
    ConstraintKind, DatabaseError, EntityConfiguration, EntityError, EntityResult, EntityRow,
    FieldValue, LoadKey, LoadValue,
};

use crate::adapter::{
    DatabaseAdapter, FieldEqualityCondition, OrderDirection, QueryModifiers, RawPredicate,
};
use crate::context::QueryContext;

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, Vec<EntityRow>>,
    /// Open transactions, oldest first. Each holds the store as it was
    /// at begin.
    snapshots: Vec<(Uuid, HashMap<String, Vec<EntityRow>>)>,
}

/// In-memory `DatabaseAdapter` with snapshot transactions.
#[derive(Default)]
pub struct InMemoryDatabaseAdapter {
    state: RwLock<StoreState>,
    fetch_calls: AtomicUsize,
}

impl InMemoryDatabaseAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batched fetch calls served so far.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of rows currently stored in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.state
            .read()
            .map(|state| state.tables.get(table).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn lock_error() -> EntityError {
        EntityError::from(DatabaseError::Unknown {
            reason: "store lock poisoned".to_string(),
        })
    }

    fn apply_modifiers(mut rows: Vec<EntityRow>, modifiers: &QueryModifiers) -> Vec<EntityRow> {
        if let Some(order) = &modifiers.order_by {
            rows.sort_by(|a, b| {
                let ordering = a.get(&order.field).cmp(&b.get(&order.field));
                match order.direction {
                    OrderDirection::Ascending => ordering,
                    OrderDirection::Descending => ordering.reverse(),
                }
            });
        }
        let offset = modifiers.offset.unwrap_or(0);
        let mut rows: Vec<EntityRow> = rows.into_iter().skip(offset).collect();
        if let Some(limit) = modifiers.limit {
            rows.truncate(limit);
        }
        rows
    }

    fn parse_predicate(
        predicate: &RawPredicate,
    ) -> EntityResult<Vec<FieldEqualityCondition>> {
        let mut conditions = Vec::new();
        let mut bindings = predicate.bindings.iter();
        for term in predicate.clause.split(" AND ") {
            let (column, placeholder) =
                term.split_once('=')
                    .ok_or_else(|| EntityError::Validation {
                        field: predicate.clause.clone(),
                        reason: "unsupported predicate term, expected 'column = ?'".to_string(),
                    })?;
            if placeholder.trim() != "?" {
                return Err(EntityError::Validation {
                    field: predicate.clause.clone(),
                    reason: "only positional '?' bindings are supported".to_string(),
                });
            }
            let value = bindings.next().ok_or_else(|| EntityError::Validation {
                field: predicate.clause.clone(),
                reason: "more placeholders than bindings".to_string(),
            })?;
            conditions.push(FieldEqualityCondition::new(
                column.trim().to_string(),
                value.clone(),
            ));
        }
        if bindings.next().is_some() {
            return Err(EntityError::Validation {
                field: predicate.clause.clone(),
                reason: "more bindings than placeholders".to_string(),
            });
        }
        Ok(conditions)
    }

    fn matches_conditions(row: &EntityRow, conditions: &[FieldEqualityCondition]) -> bool {
        conditions
            .iter()
            .all(|condition| row.get(&condition.field) == Some(&condition.value))
    }
}

#[async_trait]
impl DatabaseAdapter for InMemoryDatabaseAdapter {
    async fn fetch_many_where(
        &self,
        _query_context: &QueryContext,
        config: &EntityConfiguration,
        key: &LoadKey,
        values: &[LoadValue],
    ) -> EntityResult<HashMap<LoadValue, Vec<EntityRow>>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().map_err(|_| Self::lock_error())?;
        let rows = state
            .tables
            .get(config.table_name())
            .map(Vec::as_slice)
            .unwrap_or_default();

        let mut results: HashMap<LoadValue, Vec<EntityRow>> = HashMap::new();
        for row in rows {
            if let Some(row_value) = key.extract_value(row) {
                if values.contains(&row_value) {
                    results.entry(row_value).or_default().push(row.clone());
                }
            }
        }
        Ok(results)
    }

    async fn fetch_many_by_field_equality_conjunction(
        &self,
        _query_context: &QueryContext,
        config: &EntityConfiguration,
        conditions: &[FieldEqualityCondition],
        modifiers: &QueryModifiers,
    ) -> EntityResult<Vec<EntityRow>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().map_err(|_| Self::lock_error())?;
        let rows = state
            .tables
            .get(config.table_name())
            .map(Vec::as_slice)
            .unwrap_or_default();
        let matched: Vec<EntityRow> = rows
            .iter()
            .filter(|row| Self::matches_conditions(row, conditions))
            .cloned()
            .collect();
        Ok(Self::apply_modifiers(matched, modifiers))
    }

    async fn fetch_many_by_raw_predicate(
        &self,
        query_context: &QueryContext,
        config: &EntityConfiguration,
        predicate: &RawPredicate,
        modifiers: &QueryModifiers,
    ) -> EntityResult<Vec<EntityRow>> {
        let conditions = Self::parse_predicate(predicate)?;
        self.fetch_many_by_field_equality_conjunction(
            query_context,
            config,
            &conditions,
            modifiers,
        )
        .await
    }

    async fn insert(
        &self,
        _query_context: &QueryContext,
        config: &EntityConfiguration,
        row: &EntityRow,
    ) -> EntityResult<EntityRow> {
        let mut stored = row.clone();
        if stored.get_non_null(config.id_field()).is_none() {
            stored.set(config.id_field(), Uuid::now_v7());
        }
        let id = stored
            .get(config.id_field())
            .cloned()
            .unwrap_or(FieldValue::Null);

        let mut state = self.state.write().map_err(|_| Self::lock_error())?;
        let table = state
            .tables
            .entry(config.table_name().to_string())
            .or_default();
        let duplicate = table
            .iter()
            .any(|existing| existing.get(config.id_field()) == Some(&id));
        if duplicate {
            return Err(EntityError::from(DatabaseError::ConstraintViolation {
                kind: ConstraintKind::Unique,
                constraint: Some(format!("{}_pkey", config.table_name())),
            }));
        }
        table.push(stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        _query_context: &QueryContext,
        config: &EntityConfiguration,
        id: &FieldValue,
        changes: &EntityRow,
    ) -> EntityResult<u64> {
        if changes.is_empty() {
            return Err(EntityError::EmptyWrite {
                table: config.table_name().to_string(),
            });
        }
        let mut state = self.state.write().map_err(|_| Self::lock_error())?;
        let mut affected = 0u64;
        if let Some(table) = state.tables.get_mut(config.table_name()) {
            for row in table.iter_mut() {
                if row.get(config.id_field()) == Some(id) {
                    *row = row.merged_with(changes);
                    affected += 1;
                }
            }
        }
        Ok(affected)
    }

    async fn delete(
        &self,
        _query_context: &QueryContext,
        config: &EntityConfiguration,
        id: &FieldValue,
    ) -> EntityResult<u64> {
        let mut state = self.state.write().map_err(|_| Self::lock_error())?;
        let mut affected = 0u64;
        if let Some(table) = state.tables.get_mut(config.table_name()) {
            let before = table.len();
            table.retain(|row| row.get(config.id_field()) != Some(id));
            affected = (before - table.len()) as u64;
        }
        Ok(affected)
    }

    async fn begin_transaction(&self, id: Uuid, _parent: Option<Uuid>) -> EntityResult<()> {
        let mut state = self.state.write().map_err(|_| Self::lock_error())?;
        let snapshot = state.tables.clone();
        state.snapshots.push((id, snapshot));
        Ok(())
    }

    async fn commit_transaction(&self, id: Uuid) -> EntityResult<()> {
        let mut state = self.state.write().map_err(|_| Self::lock_error())?;
        let position = state
            .snapshots
            .iter()
            .position(|(snapshot_id, _)| *snapshot_id == id)
            .ok_or_else(|| EntityError::Transaction {
                reason: format!("unknown transaction {id}"),
            })?;
        state.snapshots.remove(position);
        Ok(())
    }

    async fn rollback_transaction(&self, id: Uuid) -> EntityResult<()> {
        let mut state = self.state.write().map_err(|_| Self::lock_error())?;
        let position = state
            .snapshots
            .iter()
            .position(|(snapshot_id, _)| *snapshot_id == id)
            .ok_or_else(|| EntityError::Transaction {
                reason: format!("unknown transaction {id}"),
            })?;
        // Rewinding to this snapshot also abandons any snapshots taken
        // inside the scope being rolled back.
        let (_, snapshot) = state.snapshots.remove(position);
        state.snapshots.truncate(position);
        state.tables = snapshot;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn user_config() -> EntityConfiguration {
        EntityConfiguration::builder("users")
            .id_field("id")
            .build()
            .expect("valid config")
    }

    fn ctx() -> QueryContext {
        QueryContext::NonTransactional
    }

    #[tokio::test]
    async fn insert_assigns_an_id_when_absent() {
        let adapter = InMemoryDatabaseAdapter::new();
        let config = user_config();

        let stored = adapter
            .insert(&ctx(), &config, &EntityRow::new().with("name", "ada"))
            .await
            .expect("insert");
        assert!(matches!(stored.get("id"), Some(FieldValue::Uuid(_))));
        assert_eq!(adapter.row_count("users"), 1);
    }

    #[tokio::test]
    async fn duplicate_id_is_a_unique_constraint_violation() {
        let adapter = InMemoryDatabaseAdapter::new();
        let config = user_config();
        let id = Uuid::now_v7();

        adapter
            .insert(&ctx(), &config, &EntityRow::new().with("id", id))
            .await
            .expect("first insert");
        let result = adapter
            .insert(&ctx(), &config, &EntityRow::new().with("id", id))
            .await;
        assert!(matches!(
            result,
            Err(EntityError::Database(DatabaseError::ConstraintViolation {
                kind: ConstraintKind::Unique,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn fetch_groups_rows_per_requested_value() {
        let adapter = InMemoryDatabaseAdapter::new();
        let config = user_config();
        for (id, team) in [(1i64, 10i64), (2, 10), (3, 20)] {
            adapter
                .insert(
                    &ctx(),
                    &config,
                    &EntityRow::new().with("id", id).with("team_id", team),
                )
                .await
                .expect("insert");
        }

        let key = LoadKey::single("team_id");
        let results = adapter
            .fetch_many_where(
                &ctx(),
                &config,
                &key,
                &[LoadValue::single(10i64), LoadValue::single(99i64)],
            )
            .await
            .expect("fetch");
        assert_eq!(results[&LoadValue::single(10i64)].len(), 2);
        // Values with no rows are simply absent.
        assert!(!results.contains_key(&LoadValue::single(99i64)));
    }

    #[tokio::test]
    async fn conjunction_applies_order_offset_and_limit() {
        let adapter = InMemoryDatabaseAdapter::new();
        let config = user_config();
        for (id, rank) in [(1i64, 3i64), (2, 1), (3, 2)] {
            adapter
                .insert(
                    &ctx(),
                    &config,
                    &EntityRow::new()
                        .with("id", id)
                        .with("rank", rank)
                        .with("active", true),
                )
                .await
                .expect("insert");
        }

        let rows = adapter
            .fetch_many_by_field_equality_conjunction(
                &ctx(),
                &config,
                &[FieldEqualityCondition::new("active", true)],
                &QueryModifiers::default()
                    .order_by("rank", OrderDirection::Ascending)
                    .offset(1)
                    .limit(1),
            )
            .await
            .expect("fetch");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("rank"), Some(&FieldValue::Int(2)));
    }

    #[tokio::test]
    async fn raw_predicate_parses_equality_conjunctions() {
        let adapter = InMemoryDatabaseAdapter::new();
        let config = user_config();
        adapter
            .insert(
                &ctx(),
                &config,
                &EntityRow::new()
                    .with("id", 1i64)
                    .with("name", "ada")
                    .with("active", true),
            )
            .await
            .expect("insert");

        let rows = adapter
            .fetch_many_by_raw_predicate(
                &ctx(),
                &config,
                &RawPredicate::new(
                    "name = ? AND active = ?",
                    vec![FieldValue::Text("ada".into()), FieldValue::Bool(true)],
                ),
                &QueryModifiers::default(),
            )
            .await
            .expect("fetch");
        assert_eq!(rows.len(), 1);

        let malformed = adapter
            .fetch_many_by_raw_predicate(
                &ctx(),
                &config,
                &RawPredicate::new("name LIKE ?", vec![FieldValue::Text("a%".into())]),
                &QueryModifiers::default(),
            )
            .await;
        assert!(matches!(malformed, Err(EntityError::Validation { .. })));
    }

    #[tokio::test]
    async fn update_merges_changes_and_reports_affected() {
        let adapter = InMemoryDatabaseAdapter::new();
        let config = user_config();
        adapter
            .insert(
                &ctx(),
                &config,
                &EntityRow::new().with("id", 1i64).with("name", "ada"),
            )
            .await
            .expect("insert");

        let affected = adapter
            .update(
                &ctx(),
                &config,
                &FieldValue::Int(1),
                &EntityRow::new().with("name", "grace"),
            )
            .await
            .expect("update");
        assert_eq!(affected, 1);

        let missing = adapter
            .update(
                &ctx(),
                &config,
                &FieldValue::Int(404),
                &EntityRow::new().with("name", "nobody"),
            )
            .await
            .expect("update");
        assert_eq!(missing, 0);

        let empty = adapter
            .update(&ctx(), &config, &FieldValue::Int(1), &EntityRow::new())
            .await;
        assert_eq!(
            empty,
            Err(EntityError::EmptyWrite {
                table: "users".to_string()
            })
        );
    }

    #[tokio::test]
    async fn rollback_restores_the_snapshot() {
        let adapter = Arc::new(InMemoryDatabaseAdapter::new());
        let config = user_config();
        adapter
            .insert(&ctx(), &config, &EntityRow::new().with("id", 1i64))
            .await
            .expect("insert");

        let txn = Uuid::now_v7();
        adapter.begin_transaction(txn, None).await.expect("begin");
        adapter
            .insert(&ctx(), &config, &EntityRow::new().with("id", 2i64))
            .await
            .expect("insert");
        assert_eq!(adapter.row_count("users"), 2);

        adapter.rollback_transaction(txn).await.expect("rollback");
        assert_eq!(adapter.row_count("users"), 1);

        adapter.begin_transaction(txn, None).await.expect("begin");
        adapter
            .insert(&ctx(), &config, &EntityRow::new().with("id", 3i64))
            .await
            .expect("insert");
        adapter.commit_transaction(txn).await.expect("commit");
        assert_eq!(adapter.row_count("users"), 2);
    }
}
