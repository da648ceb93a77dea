use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::cache::pool::PoolKind;
use crate::error::{CResult, Error};

/// Backing memory reserved for a cache instance. The pool carves its arena
/// out of this reservation, so `pool.size` may not exceed `alloc.size`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AllocConfig {
    /// Total bytes reserved for item storage.
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Storage strategy: an overwriting ring or size-classed free lists.
    pub kind: PoolKind,

    /// Arena bytes. Must be a power of two (offsets are masked, not divided).
    pub size: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    /// Number of buckets. Must be a power of two.
    pub buckets: u64,

    /// Concurrent readers. Must be true; the table has no single-reader mode.
    pub concurrent_read: bool,

    /// Concurrent writers. Must be true; the table has no single-writer mode.
    pub concurrent_write: bool,
}

/// Construction parameters for a cache instance, grouped the way they are
/// laid out in a config file: `{"alloc": .., "pool": .., "table": ..}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub alloc: AllocConfig,
    pub pool: PoolConfig,
    pub table: TableConfig,
}

impl CacheConfig {
    /// Loads a config from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> CResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Checks the invariants construction relies on. The table only supports
    /// concurrent reads and writes: all workers on a machine share one cache,
    /// so a single-reader or single-writer table would be a misconfiguration,
    /// not a slower mode.
    pub fn validate(&self) -> CResult<()> {
        if !self.table.concurrent_read || !self.table.concurrent_write {
            return Err(Error::InvalidInput(
                "cache table requires concurrent_read and concurrent_write".to_string(),
            ));
        }
        if self.table.buckets == 0 || !self.table.buckets.is_power_of_two() {
            return Err(Error::InvalidInput(format!(
                "table.buckets must be a power of two, got {}",
                self.table.buckets
            )));
        }
        if self.pool.size == 0 || !self.pool.size.is_power_of_two() {
            return Err(Error::InvalidInput(format!(
                "pool.size must be a power of two, got {}",
                self.pool.size
            )));
        }
        if self.pool.size > self.alloc.size {
            return Err(Error::InvalidInput(format!(
                "pool.size {} exceeds alloc.size {}",
                self.pool.size, self.alloc.size
            )));
        }
        Ok(())
    }
}
