//! STRATA Cache - Read-Through Entity Cache
//!
//! Versioned cache key scheme, the cache backend trait, an in-memory
//! backend, and the read-through cache that batches probes, back-fills
//! misses, and negative-caches known-absent values. The data manager in
//! `strata-loader` sits on top of this crate.

pub mod backend;
pub mod key;
pub mod memory;
pub mod read_through;

pub use backend::{CacheBackend, CacheLoadResult, CacheResult, CachedEntry};
pub use key::{cache_key, cache_key_at_version, invalidation_keys, invalidation_versions};
pub use memory::{InMemoryCacheBackend, MemoryCacheStats};
pub use read_through::ReadThroughEntityCache;
