//! Metrics adapter contract.
//!
//! Observability only: implementations must not affect load or mutation
//! behavior. The data manager reports load events, mutation events, and
//! per-table load counts through this trait.

use crate::load_key::LoadMethodType;

/// How a batched load was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadRoute {
    /// Through the coalescer and read-through cache.
    Cached,
    /// Through the coalescer, cache disabled for this entity.
    Uncached,
    /// Straight to the database adapter (transactional batching disabled,
    /// conjunction or raw-predicate loads).
    Direct,
}

/// A completed batched load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadEvent {
    pub table: String,
    pub method: LoadMethodType,
    pub route: LoadRoute,
    pub requested_values: usize,
}

/// Kind of mutation applied to an entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Insert,
    Update,
    Delete,
}

/// A completed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationEvent {
    pub table: String,
    pub kind: MutationKind,
}

/// Sink for data-access metrics.
pub trait MetricsAdapter: Send + Sync {
    /// Record one batched load.
    fn record_load_event(&self, event: LoadEvent);

    /// Record one mutation.
    fn record_mutation_event(&self, event: MutationEvent);

    /// Bump the number of entities loaded for a table.
    fn increment_entities_loaded(&self, table: &str, count: usize);
}

/// Metrics sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricsAdapter;

impl MetricsAdapter for NoOpMetricsAdapter {
    fn record_load_event(&self, _event: LoadEvent) {}

    fn record_mutation_event(&self, _event: MutationEvent) {}

    fn increment_entities_loaded(&self, _table: &str, _count: usize) {}
}
