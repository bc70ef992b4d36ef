//! The data manager: batched, cached entity loads and write-through
//! invalidation for one entity configuration.
//!
//! Point lookups route through a coalescer whose backing fetch goes
//! through the read-through cache (or straight to the adapter when the
//! entity or field is uncacheable). Conjunction and raw-predicate loads
//! always go direct and are never cached. Mutations invalidate every
//! load-key/value pair derivable from the affected row, across the
//! version skew window and across every coalescer that could hold a
//! pending batch for the pair.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use strata_cache::{CacheBackend, ReadThroughEntityCache};
use strata_core::{
    EntityConfiguration, EntityError, EntityResult, EntityRow, FieldValue, LoadEvent, LoadKey,
    LoadRoute, LoadValue, MetricsAdapter, MutationEvent, MutationKind,
};

use crate::adapter::{DatabaseAdapter, FieldEqualityCondition, QueryModifiers, RawPredicate};
use crate::coalescer::{BatchFetcher, CoalescerRegistry, CoalescerScope, LoadCoalescer};
use crate::context::{transaction_tree, QueryContext};

/// Coalescer fetch that goes through the read-through cache.
struct CacheThroughFetcher<D, C: CacheBackend> {
    db: Arc<D>,
    cache: ReadThroughEntityCache<C>,
    config: Arc<EntityConfiguration>,
    key: LoadKey,
    query_context: QueryContext,
}

#[async_trait]
impl<D, C> BatchFetcher for CacheThroughFetcher<D, C>
where
    D: DatabaseAdapter + 'static,
    C: CacheBackend + 'static,
{
    async fn fetch(
        &self,
        values: Vec<LoadValue>,
    ) -> EntityResult<HashMap<LoadValue, Vec<EntityRow>>> {
        self.cache
            .read_many_through(&self.key, &values, |missing| async move {
                self.db
                    .fetch_many_where(&self.query_context, &self.config, &self.key, &missing)
                    .await
            })
            .await
    }
}

/// Coalescer fetch that bypasses the cache for uncacheable keys.
struct DirectFetcher<D> {
    db: Arc<D>,
    config: Arc<EntityConfiguration>,
    key: LoadKey,
    query_context: QueryContext,
}

#[async_trait]
impl<D> BatchFetcher for DirectFetcher<D>
where
    D: DatabaseAdapter + 'static,
{
    async fn fetch(
        &self,
        values: Vec<LoadValue>,
    ) -> EntityResult<HashMap<LoadValue, Vec<EntityRow>>> {
        self.db
            .fetch_many_where(&self.query_context, &self.config, &self.key, &values)
            .await
    }
}

/// Batched, cached data access for one entity configuration.
pub struct DataManager<D, C: CacheBackend> {
    config: Arc<EntityConfiguration>,
    db: Arc<D>,
    cache: ReadThroughEntityCache<C>,
    metrics: Arc<dyn MetricsAdapter>,
    global_coalescers: CoalescerRegistry,
}

impl<D, C> DataManager<D, C>
where
    D: DatabaseAdapter + 'static,
    C: CacheBackend + 'static,
{
    pub fn new(
        config: Arc<EntityConfiguration>,
        db: Arc<D>,
        cache_backend: Arc<C>,
        metrics: Arc<dyn MetricsAdapter>,
    ) -> Self {
        let cache = ReadThroughEntityCache::new(Arc::clone(&config), cache_backend);
        Self {
            config,
            db,
            cache,
            metrics,
            global_coalescers: CoalescerRegistry::new(),
        }
    }

    /// The entity configuration this manager serves.
    pub fn config(&self) -> &Arc<EntityConfiguration> {
        &self.config
    }

    /// The database adapter underneath.
    pub fn database_adapter(&self) -> &Arc<D> {
        &self.db
    }

    /// The read-through cache underneath.
    pub fn cache(&self) -> &ReadThroughEntityCache<C> {
        &self.cache
    }

    fn validate_key(&self, key: &LoadKey) -> EntityResult<()> {
        for field in key.fields() {
            if self.config.field(field).is_none() {
                return Err(EntityError::Validation {
                    field: field.to_string(),
                    reason: format!(
                        "load key references undeclared field on table '{}'",
                        self.config.table_name()
                    ),
                });
            }
        }
        Ok(())
    }

    fn validate_values(&self, key: &LoadKey, values: &[LoadValue]) -> EntityResult<()> {
        for value in values {
            if !key.matches_value(value) {
                return Err(EntityError::Validation {
                    field: key.serialized(),
                    reason: "load value arity does not match the load key".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Whether lookups on `key` are served through the cache.
    fn key_is_cached(&self, key: &LoadKey) -> bool {
        match key {
            LoadKey::Single { field } => self.config.is_field_cacheable(field),
            LoadKey::Composite { fields } => {
                self.config.is_cacheable()
                    && self
                        .config
                        .composite_field_groups()
                        .iter()
                        .any(|group| group == fields)
            }
        }
    }

    fn make_fetcher(&self, query_context: &QueryContext, key: &LoadKey) -> Arc<dyn BatchFetcher> {
        if self.key_is_cached(key) {
            Arc::new(CacheThroughFetcher {
                db: Arc::clone(&self.db),
                cache: self.cache.clone(),
                config: Arc::clone(&self.config),
                key: key.clone(),
                query_context: query_context.clone(),
            })
        } else {
            Arc::new(DirectFetcher {
                db: Arc::clone(&self.db),
                config: Arc::clone(&self.config),
                key: key.clone(),
                query_context: query_context.clone(),
            })
        }
    }

    fn record_load(&self, key: &LoadKey, route: LoadRoute, requested: usize, loaded: usize) {
        self.metrics.record_load_event(LoadEvent {
            table: self.config.table_name().to_string(),
            method: key.load_method_type(),
            route,
            requested_values: requested,
        });
        self.metrics
            .increment_entities_loaded(self.config.table_name(), loaded);
    }

    /// Batched point lookup: rows grouped per requested value.
    ///
    /// Routes through the per-transaction coalescer inside a transaction,
    /// the global coalescer outside one. A transaction with batching
    /// disabled goes straight to the adapter; a completed transaction
    /// context yields empty results without touching storage.
    pub async fn load_many_by_key(
        &self,
        query_context: &QueryContext,
        key: &LoadKey,
        values: &[LoadValue],
    ) -> EntityResult<HashMap<LoadValue, Vec<EntityRow>>> {
        self.validate_key(key)?;
        self.validate_values(key, values)?;
        if values.is_empty() {
            return Ok(HashMap::new());
        }

        let (registry, scope) = match query_context.transaction() {
            Some(txn) if txn.is_completed() => {
                debug!(
                    table = self.config.table_name(),
                    "load on completed transaction context, resolving empty"
                );
                return Ok(values
                    .iter()
                    .map(|value| (value.clone(), Vec::new()))
                    .collect());
            }
            Some(txn) if !txn.batching_enabled() => {
                let mut results = self
                    .db
                    .fetch_many_where(query_context, &self.config, key, values)
                    .await?;
                for value in values {
                    results.entry(value.clone()).or_default();
                }
                let loaded = results.values().map(Vec::len).sum();
                self.record_load(key, LoadRoute::Direct, values.len(), loaded);
                return Ok(results);
            }
            Some(txn) => (
                txn.coalescers(),
                CoalescerScope::Transaction(Arc::downgrade(txn)),
            ),
            None => (&self.global_coalescers, CoalescerScope::Global),
        };

        let coalescer = registry.get_or_create(self.config.table_name(), key, || {
            LoadCoalescer::new(self.make_fetcher(query_context, key), scope)
        });
        let results = coalescer.load_many(values).await?;

        let route = if self.key_is_cached(key) {
            LoadRoute::Cached
        } else {
            LoadRoute::Uncached
        };
        let loaded = results.values().map(Vec::len).sum();
        self.record_load(key, route, values.len(), loaded);
        Ok(results)
    }

    /// Rows matching every condition of a conjunction. Never cached.
    pub async fn load_many_by_field_equality_conjunction(
        &self,
        query_context: &QueryContext,
        conditions: &[FieldEqualityCondition],
        modifiers: &QueryModifiers,
    ) -> EntityResult<Vec<EntityRow>> {
        for condition in conditions {
            if self.config.field(&condition.field).is_none() {
                return Err(EntityError::Validation {
                    field: condition.field.clone(),
                    reason: format!(
                        "conjunction references undeclared field on table '{}'",
                        self.config.table_name()
                    ),
                });
            }
        }
        let rows = self
            .db
            .fetch_many_by_field_equality_conjunction(
                query_context,
                &self.config,
                conditions,
                modifiers,
            )
            .await?;
        self.record_load(
            &LoadKey::single(self.config.id_field()),
            LoadRoute::Direct,
            conditions.len(),
            rows.len(),
        );
        Ok(rows)
    }

    /// Rows matching a raw predicate. Never cached.
    pub async fn load_many_by_raw_predicate(
        &self,
        query_context: &QueryContext,
        predicate: &RawPredicate,
        modifiers: &QueryModifiers,
    ) -> EntityResult<Vec<EntityRow>> {
        let rows = self
            .db
            .fetch_many_by_raw_predicate(query_context, &self.config, predicate, modifiers)
            .await?;
        self.record_load(
            &LoadKey::single(self.config.id_field()),
            LoadRoute::Direct,
            predicate.bindings.len(),
            rows.len(),
        );
        Ok(rows)
    }

    /// Every (load key, value) pair derivable from `row`: one per
    /// declared field present and non-null, one per composite group whose
    /// components are all present and non-null.
    pub fn invalidation_pairs_for_row(&self, row: &EntityRow) -> Vec<(LoadKey, LoadValue)> {
        let mut pairs = Vec::new();
        for field in self.config.field_names() {
            let key = LoadKey::single(field.clone());
            if let Some(value) = key.extract_value(row) {
                pairs.push((key, value));
            }
        }
        for group in self.config.composite_field_groups() {
            let key = LoadKey::composite(group.clone());
            if let Some(value) = key.extract_value(row) {
                pairs.push((key, value));
            }
        }
        pairs
    }

    /// Invalidate cache entries and global pending batches for the pairs.
    pub async fn invalidate_key_value_pairs(
        &self,
        pairs: &[(LoadKey, LoadValue)],
    ) -> EntityResult<()> {
        for (key, value) in pairs {
            self.cache
                .invalidate_many(key, std::slice::from_ref(value))
                .await?;
            self.global_coalescers
                .discard(self.config.table_name(), key, value);
        }
        Ok(())
    }

    /// Invalidate the pairs everywhere a transactional write can leak:
    /// the cache, the global coalescers, and every coalescer in the
    /// transaction tree (root, siblings, descendants).
    pub async fn invalidate_key_value_pairs_for_transaction(
        &self,
        query_context: &QueryContext,
        pairs: &[(LoadKey, LoadValue)],
    ) -> EntityResult<()> {
        self.invalidate_key_value_pairs(pairs).await?;
        if let Some(txn) = query_context.transaction() {
            for ctx in transaction_tree(txn) {
                for (key, value) in pairs {
                    ctx.coalescers()
                        .discard(self.config.table_name(), key, value);
                }
            }
        }
        Ok(())
    }

    /// Invalidate everything derivable from `row` under the context.
    pub async fn invalidate_row(
        &self,
        query_context: &QueryContext,
        row: &EntityRow,
    ) -> EntityResult<()> {
        let pairs = self.invalidation_pairs_for_row(row);
        if query_context.is_transactional() {
            self.invalidate_key_value_pairs_for_transaction(query_context, &pairs)
                .await
        } else {
            self.invalidate_key_value_pairs(&pairs).await
        }
    }

    /// Insert a row and invalidate its derivable pairs.
    pub async fn insert(
        &self,
        query_context: &QueryContext,
        row: &EntityRow,
    ) -> EntityResult<EntityRow> {
        let inserted = self.db.insert(query_context, &self.config, row).await?;
        self.invalidate_row(query_context, &inserted).await?;
        self.metrics.record_mutation_event(MutationEvent {
            table: self.config.table_name().to_string(),
            kind: MutationKind::Insert,
        });
        Ok(inserted)
    }

    /// Apply `changes` to the row previously loaded as `previous`.
    ///
    /// Invalidates both the pre-image and the post-image: a changed field
    /// value must evict the entry indexed by its old value as well as the
    /// one indexed by its new value. Returns the affected-row count.
    pub async fn update(
        &self,
        query_context: &QueryContext,
        previous: &EntityRow,
        changes: &EntityRow,
    ) -> EntityResult<u64> {
        if changes.is_empty() {
            return Err(EntityError::EmptyWrite {
                table: self.config.table_name().to_string(),
            });
        }
        let id = self.row_id(previous)?;
        let affected = self
            .db
            .update(query_context, &self.config, &id, changes)
            .await?;
        let after = previous.merged_with(changes);
        self.invalidate_row(query_context, previous).await?;
        self.invalidate_row(query_context, &after).await?;
        self.metrics.record_mutation_event(MutationEvent {
            table: self.config.table_name().to_string(),
            kind: MutationKind::Update,
        });
        Ok(affected)
    }

    /// Delete the row and invalidate its derivable pairs.
    pub async fn delete(&self, query_context: &QueryContext, row: &EntityRow) -> EntityResult<u64> {
        let id = self.row_id(row)?;
        let affected = self.db.delete(query_context, &self.config, &id).await?;
        self.invalidate_row(query_context, row).await?;
        self.metrics.record_mutation_event(MutationEvent {
            table: self.config.table_name().to_string(),
            kind: MutationKind::Delete,
        });
        Ok(affected)
    }

    fn row_id(&self, row: &EntityRow) -> EntityResult<FieldValue> {
        row.get_non_null(self.config.id_field())
            .cloned()
            .ok_or_else(|| EntityError::Validation {
                field: self.config.id_field().to_string(),
                reason: format!(
                    "row is missing its id field for table '{}'",
                    self.config.table_name()
                ),
            })
    }
}
