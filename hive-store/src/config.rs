//! Configuration of the local store.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Default number of unreserved chunks kept before garbage collection starts.
pub const DEFAULT_CACHE_CAPACITY: u64 = 1_000_000;
/// Default number of chunks in the reserve.
pub const DEFAULT_RESERVE_CAPACITY: u64 = 1 << 22;
/// Default number of sharky shards.
pub const DEFAULT_SHARDS: u16 = 32;
/// Default share of the cache capacity freed by a garbage collection pass.
pub const DEFAULT_GC_TARGET_FRACTION: f64 = 0.1;
/// Default time [`crate::LocalStore::close`] waits for background work.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration of a [`crate::LocalStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalStoreConfig {
    /// Data directory. `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    /// Number of garbage collectable chunks kept.
    pub cache_capacity: u64,
    /// Number of chunks in the reserve, used by the batch store to compute
    /// the radius.
    pub reserve_capacity: u64,
    /// Capacity of the in memory chunk cache in front of sharky, 0 disables it.
    pub lru_capacity: usize,
    /// Number of sharky shards.
    pub shards: u16,
    /// Share of `cache_capacity` a garbage collection pass frees below the
    /// capacity.
    pub gc_target_fraction: f64,
    /// How long close waits for the background workers.
    #[serde(with = "humantime_serde")]
    pub close_timeout: Duration,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            reserve_capacity: DEFAULT_RESERVE_CAPACITY,
            lru_capacity: 0,
            shards: DEFAULT_SHARDS,
            gc_target_fraction: DEFAULT_GC_TARGET_FRACTION,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl LocalStoreConfig {
    /// An in memory store with the given cache capacity.
    pub fn memory(cache_capacity: u64) -> Self {
        Self {
            cache_capacity,
            shards: 2,
            ..Default::default()
        }
    }

    /// The gc size a garbage collection pass stops at.
    pub fn gc_target(&self) -> u64 {
        let free = (self.cache_capacity as f64 * self.gc_target_fraction.clamp(0.0, 1.0)) as u64;
        self.cache_capacity - free
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gc_target() {
        let config = LocalStoreConfig::memory(100);
        assert_eq!(config.gc_target(), 90);
        let config = LocalStoreConfig {
            gc_target_fraction: 2.0,
            ..LocalStoreConfig::memory(100)
        };
        assert_eq!(config.gc_target(), 0);
    }
}
