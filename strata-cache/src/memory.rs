//! In-memory cache backend.
//!
//! A plain map guarded by a std RwLock; nothing here suspends. Entries
//! are stored as serialized JSON, the same shape a networked backend
//! would hold, so codec failures surface here too instead of only in
//! production. Intended for tests and single-process embedding. Tracks
//! hit/miss counters so callers can assert on cache behavior.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use strata_core::error::CacheError;

use crate::backend::{CacheBackend, CacheResult, CachedEntry};

/// Hit/miss counters for the in-memory backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryCacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Default)]
struct MemoryCacheState {
    entries: HashMap<String, String>,
    stats: MemoryCacheStats,
}

/// Cache backend storing JSON-encoded entries in process memory.
#[derive(Default)]
pub struct InMemoryCacheBackend {
    state: RwLock<MemoryCacheState>,
}

impl InMemoryCacheBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries (negative markers included).
    pub fn entry_count(&self) -> usize {
        self.state.read().expect("cache lock poisoned").entries.len()
    }

    /// Whether an exact key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.state
            .read()
            .expect("cache lock poisoned")
            .entries
            .contains_key(key)
    }

    /// Hit/miss counters.
    pub fn stats(&self) -> MemoryCacheStats {
        self.state.read().expect("cache lock poisoned").stats
    }

    /// Overwrite the raw payload stored under `key`.
    ///
    /// Test hook for simulating a corrupted or incompatible entry.
    pub fn poison_entry(&self, key: &str, payload: impl Into<String>) {
        self.state
            .write()
            .expect("cache lock poisoned")
            .entries
            .insert(key.to_string(), payload.into());
    }

    fn encode(entry: &CachedEntry) -> CacheResult<String> {
        serde_json::to_string(entry).map_err(|e| CacheError::Codec {
            reason: e.to_string(),
        })
    }

    fn decode(payload: &str) -> CacheResult<CachedEntry> {
        serde_json::from_str(payload).map_err(|e| CacheError::Codec {
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get_many(&self, keys: &[String]) -> CacheResult<HashMap<String, CachedEntry>> {
        let mut state = self.state.write().map_err(|_| CacheError::Backend {
            reason: "cache lock poisoned".to_string(),
        })?;

        let mut found = HashMap::new();
        for key in keys {
            if let Some(payload) = state.entries.get(key) {
                found.insert(key.clone(), Self::decode(payload)?);
            }
        }
        state.stats.hits += found.len() as u64;
        state.stats.misses += (keys.len() - found.len()) as u64;
        Ok(found)
    }

    async fn set_many(&self, entries: Vec<(String, CachedEntry)>) -> CacheResult<()> {
        let mut encoded = Vec::with_capacity(entries.len());
        for (key, entry) in &entries {
            encoded.push((key.clone(), Self::encode(entry)?));
        }
        let mut state = self.state.write().map_err(|_| CacheError::Backend {
            reason: "cache lock poisoned".to_string(),
        })?;
        for (key, payload) in encoded {
            state.entries.insert(key, payload);
        }
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<()> {
        let mut state = self.state.write().map_err(|_| CacheError::Backend {
            reason: "cache lock poisoned".to_string(),
        })?;
        for key in keys {
            state.entries.remove(key);
        }
        Ok(())
    }
}
