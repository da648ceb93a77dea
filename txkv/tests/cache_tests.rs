//! Cache behavior under real keyhashes: collision-constructed displacement
//! and a randomized check that the cache never serves a wrong value, only
//! (at worst) a miss.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use txkv::cache::pool::PoolKind;
use txkv::cache::{Cache, CacheResult};
use txkv::config::{AllocConfig, CacheConfig, PoolConfig, TableConfig};
use txkv::keyhash::cache_keyhash;
use txkv::{CallerId, Key};

const BUCKETS: u64 = 4;
const BUCKET_SLOTS: usize = 7;

type Evictions = Arc<Mutex<Vec<(Vec<u8>, Vec<u8>)>>>;

fn cache(pool_size: u64) -> (Cache, Evictions) {
    let evicted: Evictions = Arc::new(Mutex::new(Vec::new()));
    let log = evicted.clone();
    let config = CacheConfig {
        alloc: AllocConfig { size: pool_size },
        pool: PoolConfig { kind: PoolKind::CircularLog, size: pool_size },
        table: TableConfig { buckets: BUCKETS, concurrent_read: true, concurrent_write: true },
    };
    let cache = Cache::from_config(
        &config,
        Box::new(move |key, value| {
            log.lock().unwrap().push((key.to_vec(), value.to_vec()));
        }),
    )
    .unwrap();
    (cache, evicted)
}

fn insert(cache: &Cache, caller: CallerId, key: Key, value: &[u8]) -> CacheResult {
    let keyhash = cache_keyhash(key);
    let mut version = 0;
    let result = cache.placeholder(caller, keyhash, &key.to_le_bytes(), value.len(), &mut version);
    if result != CacheResult::Success {
        return result;
    }
    cache.prepare_read(caller, keyhash, &key.to_le_bytes(), value, version, false)
}

fn make_modified(cache: &Cache, caller: CallerId, key: Key, value: &[u8]) {
    let keyhash = cache_keyhash(key);
    let version = cache.version(keyhash);
    assert_eq!(
        cache.prepare_write(caller, keyhash, &key.to_le_bytes(), value, version, false),
        CacheResult::Exists
    );
    assert_eq!(
        cache.commit_write(caller, keyhash, &key.to_le_bytes(), value),
        CacheResult::Success
    );
}

fn get(cache: &Cache, key: Key) -> Option<Vec<u8>> {
    let keyhash = cache_keyhash(key);
    let mut buf = [0u8; 512];
    let (mut len, mut version) = (0, 0);
    match cache.get(keyhash, &key.to_le_bytes(), &mut buf, &mut len, &mut version, false) {
        CacheResult::Success => Some(buf[..len].to_vec()),
        CacheResult::NotFound => None,
        other => panic!("unexpected get result {other}"),
    }
}

/// `count` keys all hashing into bucket 0, with pairwise distinct slot tags
/// so displacement decisions come from occupancy, not tag reuse.
fn colliding_keys(count: usize) -> Vec<Key> {
    let mut keys = Vec::new();
    let mut tags = std::collections::HashSet::new();
    for key in 0u64.. {
        let keyhash = cache_keyhash(key);
        if keyhash & (BUCKETS - 1) != 0 || !tags.insert(keyhash >> 46) {
            continue;
        }
        keys.push(key);
        if keys.len() == count {
            return keys;
        }
    }
    unreachable!()
}

#[test]
fn bucket_overflow_displaces_insertion_order_first() {
    let (cache, evicted) = cache(1 << 16);
    let keys = colliding_keys(BUCKET_SLOTS + 1);

    // Fill every slot of bucket 0 with modified entries.
    for (i, key) in keys[..BUCKET_SLOTS].iter().enumerate() {
        assert_eq!(insert(&cache, 1, *key, b"v"), CacheResult::Success);
        make_modified(&cache, 1, *key, format!("m{i}").as_bytes());
    }
    assert!(evicted.lock().unwrap().is_empty());
    for key in &keys[..BUCKET_SLOTS] {
        assert!(get(&cache, *key).is_some());
    }

    // The eighth key displaces exactly one victim: the first inserted.
    assert_eq!(insert(&cache, 1, keys[BUCKET_SLOTS], b"v8"), CacheResult::Success);
    {
        let evicted = evicted.lock().unwrap();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0], (keys[0].to_le_bytes().to_vec(), b"m0".to_vec()));
    }

    assert_eq!(get(&cache, keys[0]), None);
    assert_eq!(get(&cache, keys[BUCKET_SLOTS]), Some(b"v8".to_vec()));
    for (i, key) in keys[1..BUCKET_SLOTS].iter().enumerate() {
        assert_eq!(get(&cache, *key), Some(format!("m{}", i + 1).into_bytes()));
    }
}

#[test]
fn invalidated_bucket_surfaces_every_modified_entry() {
    let (cache, evicted) = cache(1 << 16);
    let keys = colliding_keys(4);

    for key in &keys {
        assert_eq!(insert(&cache, 1, *key, b"v"), CacheResult::Success);
    }
    // Only two of the four are modified.
    make_modified(&cache, 1, keys[0], b"m0");
    make_modified(&cache, 1, keys[2], b"m2");

    assert_eq!(cache.invalidate(9, cache_keyhash(keys[0])), CacheResult::Success);

    let mut seen: Vec<Vec<u8>> = evicted.lock().unwrap().iter().map(|(k, _)| k.clone()).collect();
    seen.sort();
    let mut expected =
        vec![keys[0].to_le_bytes().to_vec(), keys[2].to_le_bytes().to_vec()];
    expected.sort();
    assert_eq!(seen, expected);

    for key in &keys {
        assert_eq!(get(&cache, *key), None);
    }
}

/// The cache may lose entries at any time (bucket pressure, log wrap), but
/// it must never return bytes that were not the latest write for the key.
#[test]
fn random_ops_never_serve_stale_or_foreign_values() {
    let seed: u64 = rand::thread_rng().gen();
    println!("seed = {}", seed);
    let mut rng = StdRng::seed_from_u64(seed);

    // A pool this small wraps constantly, exercising lossy misses.
    let (cache, _) = cache(1 << 12);
    let mut model: HashMap<Key, Vec<u8>> = HashMap::new();

    for op in 0..2000 {
        let key = rng.gen_range(0..64u64);
        match rng.gen_range(0..3) {
            0 => {
                let value = format!("{key}@{op}").into_bytes();
                let keyhash = cache_keyhash(key);
                let mut version = 0;
                match cache.placeholder(1, keyhash, &key.to_le_bytes(), value.len(), &mut version)
                {
                    CacheResult::Success => {
                        if cache.prepare_read(1, keyhash, &key.to_le_bytes(), &value, version, false)
                            == CacheResult::Success
                        {
                            model.insert(key, value);
                        } else {
                            model.remove(&key);
                        }
                    }
                    CacheResult::Exists => {}
                    other => panic!("placeholder failed: {other}"),
                }
            }
            1 => {
                if cache.invalidate(1, cache_keyhash(key)) == CacheResult::Success {
                    // Every key in the same bucket is gone; the model cannot
                    // tell which, so drop them all.
                    let bucket = cache_keyhash(key) & (BUCKETS - 1);
                    model.retain(|k, _| cache_keyhash(*k) & (BUCKETS - 1) != bucket);
                }
            }
            _ => {
                if let Some(value) = get(&cache, key) {
                    match model.get(&key) {
                        Some(expected) => assert_eq!(&value, expected, "key {key}"),
                        None => panic!("cache served key {key} the model never stored"),
                    }
                }
            }
        }
    }
}
