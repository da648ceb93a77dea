//! A fixed-capacity, lossy, concurrent cache of remote records.
//!
//! The table is an array of buckets, each holding a handful of slots that
//! point into a log-allocated item pool. Buckets are the unit of locking and
//! versioning: mutations take the bucket lock, optimistic readers bracket
//! their work with the bucket version and retry on mismatch. The cache is
//! lossy by design. A full bucket silently displaces an old entry to admit a
//! new one; displaced entries that carry local modifications are surfaced
//! through an eviction callback so higher layers can write them through. The
//! remote primary always holds the authoritative record, so losing a cache
//! entry costs a round-trip, never correctness.

pub mod bucket;
mod item;
pub mod pool;
pub mod registry;
pub mod rpc;
pub mod table;

pub use registry::CacheRegistry;
pub use table::Cache;

/// Status codes shared by all cache operations. These are expected outcomes,
/// not errors: callers branch on them, and the transaction driver collapses
/// the failure kinds into its abort decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheResult {
    Success,
    Error,
    InsufficientSpace,
    Exists,
    NotFound,
    PartialValue,
    NotProcessed,
    NotSupported,
    TimedOut,
    Rejected,
    Locked,
    Invalidated,
}

impl std::fmt::Display for CacheResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CacheResult::Success => "Success",
            CacheResult::Error => "Error",
            CacheResult::InsufficientSpace => "Insufficient space",
            CacheResult::Exists => "Exists",
            CacheResult::NotFound => "Not found",
            CacheResult::PartialValue => "Partial value",
            CacheResult::NotProcessed => "Not processed",
            CacheResult::NotSupported => "Not supported",
            CacheResult::TimedOut => "Timed out",
            CacheResult::Rejected => "Rejected",
            CacheResult::Locked => "Locked",
            CacheResult::Invalidated => "Invalidated",
        };
        write!(f, "{}", s)
    }
}

/// Fired when a modified item is displaced from the cache, either by a
/// placeholder overwriting its slot or by an invalidation. Receives the
/// item's key and value bytes. Must not re-enter the cache: the bucket lock
/// is held while the callback runs.
pub type EvictionCallback = Box<dyn Fn(&[u8], &[u8]) + Send + Sync>;
