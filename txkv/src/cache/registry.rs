use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::Cache;
use crate::rpc::RpcReqType;

/// Routes each record type (the request-type tag of the RPC envelope) to the
/// cache instance serving it. Different record types usually carry different
/// object sizes, so each gets its own table and pool geometry.
#[derive(Default)]
pub struct CacheRegistry {
    caches: HashMap<RpcReqType, Arc<Cache>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a cache for a request type. Rejects (returns false) if one is
    /// already registered; the first registration wins.
    pub fn register(&mut self, req_type: RpcReqType, cache: Arc<Cache>) -> bool {
        if self.caches.contains_key(&req_type) {
            return false;
        }
        self.caches.insert(req_type, cache);
        true
    }

    /// The cache serving a request type, if any.
    pub fn get(&self, req_type: RpcReqType) -> Option<Arc<Cache>> {
        self.caches.get(&req_type).cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cache::pool::PoolKind;
    use crate::config::{AllocConfig, CacheConfig, PoolConfig, TableConfig};

    fn cache() -> Arc<Cache> {
        let config = CacheConfig {
            alloc: AllocConfig { size: 1 << 12 },
            pool: PoolConfig { kind: PoolKind::CircularLog, size: 1 << 12 },
            table: TableConfig { buckets: 8, concurrent_read: true, concurrent_write: true },
        };
        Arc::new(Cache::from_config(&config, Box::new(|_, _| {})).unwrap())
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = CacheRegistry::new();
        assert!(registry.register(1, cache()));
        assert!(registry.get(1).is_some());
        assert!(registry.get(2).is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = CacheRegistry::new();
        let first = cache();
        assert!(registry.register(1, first.clone()));
        assert!(!registry.register(1, cache()));
        // The original mapping is untouched.
        assert!(Arc::ptr_eq(&registry.get(1).unwrap(), &first));
    }
}
