//! `txkv` is the client-side substrate of a distributed, cache-coherent
//! transactional key-value store. Worker threads co-located with the
//! application run many cooperative transactions; keys live on remote
//! memory nodes. To cut round-trips, each machine keeps a lossy local cache
//! of recently read and written records, and a distributed directory tracks
//! per-key ownership (one writer) and accessors (many cached readers) so
//! that writers can invalidate remote caches before mutating a key.
//!
//! The crate provides three tightly coupled pieces:
//!
//! - [`cache`]: a bucketed, log-allocated concurrent table with per-bucket
//!   version locks, a placeholder protocol for reserving slots ahead of a
//!   remote read, and callback-surfaced lossy eviction;
//! - [`directory`]: the ownership directory, maintained purely through
//!   one-sided remote READ / CAS / WRITE;
//! - [`tx`]: the transaction execute phase driving both, batching remote
//!   reads and lock acquisitions through the RPC fabric.
//!
//! The RPC transport, the key-to-node mapping table and the server-side
//! datastore are external collaborators, consumed through the seams in
//! [`rpc`] and [`mappings`].
//!
//! ## Getting started
//!
//! ```rust
//! use txkv::cache::pool::PoolKind;
//! use txkv::cache::{Cache, CacheResult};
//! use txkv::config::{AllocConfig, CacheConfig, PoolConfig, TableConfig};
//! use txkv::keyhash::cache_keyhash;
//!
//! fn main() -> Result<(), txkv::error::Error> {
//!     let config = CacheConfig {
//!         alloc: AllocConfig { size: 1 << 20 },
//!         pool: PoolConfig { kind: PoolKind::CircularLog, size: 1 << 20 },
//!         table: TableConfig { buckets: 256, concurrent_read: true, concurrent_write: true },
//!     };
//!     let cache = Cache::from_config(&config, Box::new(|key, value| {
//!         println!("evicted {:?} = {:?}", key, value);
//!     }))?;
//!
//!     // Reserve a slot, then install the value a remote read produced.
//!     let (caller, key) = (0, 7u64);
//!     let keyhash = cache_keyhash(key);
//!     let mut version = 0;
//!     let result = cache.placeholder(caller, keyhash, &key.to_le_bytes(), 16, &mut version);
//!     assert_eq!(result, CacheResult::Success);
//!     let result =
//!         cache.prepare_read(caller, keyhash, &key.to_le_bytes(), b"value", version, false);
//!     assert_eq!(result, CacheResult::Success);
//!
//!     let mut buf = [0u8; 16];
//!     let (mut len, mut ver) = (0, 0);
//!     let result = cache.get(keyhash, &key.to_le_bytes(), &mut buf, &mut len, &mut ver, false);
//!     assert_eq!(result, CacheResult::Success);
//!     assert_eq!(&buf[..len], b"value");
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod keyhash;
pub mod mappings;
pub mod rpc;
pub mod tx;

/// An opaque 8-byte key.
pub type Key = u64;

/// Identifies a worker thread or coroutine; the bucket lock uses it for
/// reentrancy across the calls of one transaction.
pub type CallerId = u32;

/// Identifies a machine in the cluster. Must stay below 63 so it fits the
/// directory's owner/accessor bitmask.
pub type MachineId = u32;
