//! Read-through entity cache.
//!
//! Routes batched point lookups through the cache backend, fetches the
//! misses from the supplied fetcher in one call, back-fills the cache,
//! and negative-caches values the database does not have.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

use strata_core::{EntityConfiguration, EntityResult, EntityRow, LoadKey, LoadValue};

use crate::backend::{CacheBackend, CacheLoadResult, CachedEntry};
use crate::key::{cache_key, invalidation_keys};

/// Read-through cache for one entity configuration.
///
/// The cache key scheme (table, version, key, value) lives here; the
/// backend only sees computed keys. Backend errors fail the whole lookup
/// rather than silently forcing a database read: true misses are already
/// explicit in the contract, so an error can never be mistaken for one.
pub struct ReadThroughEntityCache<C: CacheBackend> {
    config: Arc<EntityConfiguration>,
    backend: Arc<C>,
}

impl<C: CacheBackend> ReadThroughEntityCache<C> {
    /// Create a cache over the given backend.
    pub fn new(config: Arc<EntityConfiguration>, backend: Arc<C>) -> Self {
        Self { config, backend }
    }

    /// The entity configuration this cache serves.
    pub fn config(&self) -> &Arc<EntityConfiguration> {
        &self.config
    }

    /// Get a reference to the backend.
    pub fn backend(&self) -> &C {
        &self.backend
    }

    /// Batched read-through lookup.
    ///
    /// Probes the backend once for every distinct value, invokes
    /// `fetch_missing` once for the values the cache did not have, then
    /// back-fills: fetched rows are cached, values the fetcher returned
    /// nothing for are negative-cached. The result maps every requested
    /// value to its rows (possibly empty); duplicates collapse into the
    /// map's single entry per value.
    pub async fn read_many_through<F, Fut>(
        &self,
        key: &LoadKey,
        values: &[LoadValue],
        fetch_missing: F,
    ) -> EntityResult<HashMap<LoadValue, Vec<EntityRow>>>
    where
        F: FnOnce(Vec<LoadValue>) -> Fut,
        Fut: Future<Output = EntityResult<HashMap<LoadValue, Vec<EntityRow>>>>,
    {
        // Dedupe by encoding while keeping first-seen order.
        let mut unique: Vec<(String, LoadValue)> = Vec::with_capacity(values.len());
        for value in values {
            let cache_key = cache_key(&self.config, key, value);
            if !unique.iter().any(|(k, _)| k == &cache_key) {
                unique.push((cache_key, value.clone()));
            }
        }

        let keys: Vec<String> = unique.iter().map(|(k, _)| k.clone()).collect();
        let mut cached = self.backend.get_many(&keys).await?;

        let mut results: HashMap<LoadValue, Vec<EntityRow>> = HashMap::new();
        let mut missing: Vec<LoadValue> = Vec::new();
        for (cache_key, value) in &unique {
            let probe = match cached.remove(cache_key) {
                Some(entry) => CacheLoadResult::from(entry),
                None => CacheLoadResult::Miss,
            };
            match probe {
                CacheLoadResult::Hit(rows) => {
                    results.insert(value.clone(), rows);
                }
                CacheLoadResult::Miss => missing.push(value.clone()),
            }
        }
        debug!(
            table = self.config.table_name(),
            hits = unique.len() - missing.len(),
            misses = missing.len(),
            "cache probe"
        );

        if missing.is_empty() {
            return Ok(results);
        }

        let mut fetched = fetch_missing(missing.clone()).await?;

        let mut rows_to_cache: Vec<(LoadValue, Vec<EntityRow>)> = Vec::new();
        let mut db_misses: Vec<LoadValue> = Vec::new();
        for value in missing {
            let rows = fetched.remove(&value).unwrap_or_default();
            if rows.is_empty() {
                db_misses.push(value.clone());
            } else {
                rows_to_cache.push((value.clone(), rows.clone()));
            }
            results.insert(value, rows);
        }

        if !rows_to_cache.is_empty() {
            self.cache_many(key, rows_to_cache).await?;
        }
        if !db_misses.is_empty() {
            self.cache_db_misses(key, &db_misses).await?;
        }

        Ok(results)
    }

    /// Cache fetched rows for the given values.
    pub async fn cache_many(
        &self,
        key: &LoadKey,
        entries: Vec<(LoadValue, Vec<EntityRow>)>,
    ) -> EntityResult<()> {
        let entries = entries
            .into_iter()
            .map(|(value, rows)| {
                (
                    cache_key(&self.config, key, &value),
                    CachedEntry::Rows(rows),
                )
            })
            .collect();
        self.backend.set_many(entries).await?;
        Ok(())
    }

    /// Negative-cache values the database had no rows for.
    pub async fn cache_db_misses(&self, key: &LoadKey, values: &[LoadValue]) -> EntityResult<()> {
        let entries = values
            .iter()
            .map(|value| (cache_key(&self.config, key, value), CachedEntry::Negative))
            .collect();
        self.backend.set_many(entries).await?;
        Ok(())
    }

    /// Invalidate the given values across the version skew window.
    ///
    /// Deletes keys for versions `{max(0, v - 1), v, v + 1}` so processes
    /// running with an adjacent configured version during a rolling
    /// deploy cannot keep serving or re-writing the stale entry.
    pub async fn invalidate_many(&self, key: &LoadKey, values: &[LoadValue]) -> EntityResult<()> {
        let mut keys = Vec::with_capacity(values.len() * 3);
        for value in values {
            keys.extend(invalidation_keys(&self.config, key, value));
        }
        debug!(
            table = self.config.table_name(),
            keys = keys.len(),
            "cache invalidation"
        );
        self.backend.delete_many(&keys).await?;
        Ok(())
    }
}

impl<C: CacheBackend> Clone for ReadThroughEntityCache<C> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            backend: Arc::clone(&self.backend),
        }
    }
}
