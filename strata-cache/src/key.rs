//! Versioned cache key scheme.
//!
//! Every cache key embeds the table name, the configured cache key
//! version, the load key, and the stable value encoding. The version is
//! what makes invalidation safe across rolling deploys: old and new
//! process instances may run with adjacent versions at the same time, so
//! an invalidation at version `v` must also clear `v - 1` and `v + 1`.

use strata_core::{EntityConfiguration, LoadKey, LoadValue};

/// Prefix shared by all STRATA cache keys.
const KEY_PREFIX: &str = "strata";

/// Compute the cache key for one (key, value) pair at a specific version.
pub fn cache_key_at_version(
    table: &str,
    version: u32,
    key: &LoadKey,
    value: &LoadValue,
) -> String {
    format!(
        "{KEY_PREFIX}:{table}:v{version}:{}:{}",
        key.serialized(),
        value.stable_encode()
    )
}

/// Compute the cache key for one (key, value) pair at the configured version.
pub fn cache_key(config: &EntityConfiguration, key: &LoadKey, value: &LoadValue) -> String {
    cache_key_at_version(config.table_name(), config.cache_key_version(), key, value)
}

/// The version set an invalidation at `version` must cover.
///
/// Returns `{max(0, version - 1), version, version + 1}`:
/// `invalidation_versions(0) = [0, 1]`, `(1) = [0, 1, 2]`, `(2) = [1, 2, 3]`.
pub fn invalidation_versions(version: u32) -> Vec<u32> {
    if version == 0 {
        vec![0, 1]
    } else {
        vec![version - 1, version, version + 1]
    }
}

/// Cache keys to delete when invalidating one (key, value) pair.
pub fn invalidation_keys(
    config: &EntityConfiguration,
    key: &LoadKey,
    value: &LoadValue,
) -> Vec<String> {
    invalidation_versions(config.cache_key_version())
        .into_iter()
        .map(|v| cache_key_at_version(config.table_name(), v, key, value))
        .collect()
}
