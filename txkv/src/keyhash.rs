use crate::Key;

/// The cache keeps only the low 62 bits of a keyhash; the top two bits of
/// the hash field double as the request-type tag in the RPC envelope.
pub const CACHE_HASH_MASK: u64 = (1u64 << 62) - 1;

/// Keyhash used by the cache table to locate a bucket and slot tag.
pub fn cache_keyhash(key: Key) -> u64 {
    rapidhash::rapidhash(&key.to_le_bytes()) & CACHE_HASH_MASK
}

/// Keyhash used to locate a directory entry. The directory does not share
/// the RPC envelope, so the full 64-bit hash is kept.
pub fn dir_keyhash(key: Key) -> u64 {
    rapidhash::rapidhash(&key.to_le_bytes())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cache_hash_is_masked() {
        for key in [0u64, 1, 7, 42, u64::MAX] {
            assert_eq!(cache_keyhash(key), dir_keyhash(key) & CACHE_HASH_MASK);
            assert!(cache_keyhash(key) <= CACHE_HASH_MASK);
        }
    }

    #[test]
    fn hash_is_fixed() {
        // The hash locates data on remote machines, so it must be stable
        // across processes and runs.
        assert_eq!(cache_keyhash(7), cache_keyhash(7));
        assert_ne!(cache_keyhash(7), cache_keyhash(8));
    }
}
