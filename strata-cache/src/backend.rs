//! Cache backend trait and cached entry representation.
//!
//! Backends are dumb key/value stores over the computed cache keys; the
//! key scheme and the read-through algorithm live in this crate, not in
//! the backend. Backend failures are failures: the contract never allows
//! an error to masquerade as a miss.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strata_core::error::CacheError;
use strata_core::EntityRow;

/// Result alias for backend operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// What is stored under one cache key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachedEntry {
    /// The rows matching the keyed value.
    Rows(Vec<EntityRow>),
    /// Explicit miss marker: the database was consulted and had nothing.
    /// Prevents repeated stampedes against a known-absent value.
    Negative,
}

/// Outcome of a cache probe for one value.
///
/// There is deliberately no error state here; backend errors surface as
/// `Err` on the whole call instead of degrading to a miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLoadResult {
    /// The cache had an entry (rows or a negative marker).
    Hit(Vec<EntityRow>),
    /// The cache had nothing; the database must be consulted.
    Miss,
}

impl From<CachedEntry> for CacheLoadResult {
    fn from(entry: CachedEntry) -> Self {
        match entry {
            CachedEntry::Rows(rows) => Self::Hit(rows),
            CachedEntry::Negative => Self::Hit(Vec::new()),
        }
    }
}

/// Pluggable cache store keyed by computed cache keys.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch entries for all keys in one call.
    ///
    /// Keys absent from the returned map are true misses.
    async fn get_many(&self, keys: &[String]) -> CacheResult<HashMap<String, CachedEntry>>;

    /// Store entries for all keys in one call.
    async fn set_many(&self, entries: Vec<(String, CachedEntry)>) -> CacheResult<()>;

    /// Delete all the given keys.
    async fn delete_many(&self, keys: &[String]) -> CacheResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_entry_is_an_empty_hit() {
        let result = CacheLoadResult::from(CachedEntry::Negative);
        assert_eq!(result, CacheLoadResult::Hit(Vec::new()));
    }

    #[test]
    fn test_rows_entry_keeps_rows() {
        let row = EntityRow::new().with("id", 1i64);
        let result = CacheLoadResult::from(CachedEntry::Rows(vec![row.clone()]));
        assert_eq!(result, CacheLoadResult::Hit(vec![row]));
    }
}
