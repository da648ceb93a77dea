use std::sync::atomic::Ordering;

use crate::cache::bucket::Bucket;
use crate::cache::item::{item_bytes, ItemView, MAX_KEY_LENGTH};
use crate::cache::pool::{Pool, PoolKind, INSUFFICIENT_SPACE, OFFSET_MASK};
use crate::cache::{CacheResult, EvictionCallback};
use crate::config::CacheConfig;
use crate::error::CResult;
use crate::CallerId;

/// The bucketed, log-allocated, lossy cache table.
///
/// Entries live in a fixed array of buckets; each bucket slot packs a 16-bit
/// tag with a 48-bit pool offset. An entry is born as a placeholder (pending,
/// no value) so that the bucket version captured at reservation time can
/// detect invalidations that land before the value does; `prepare_read` and
/// `prepare_write` finalize it. A full bucket displaces an existing entry to
/// admit a new one, preferring a slot with the new entry's tag, then an
/// empty slot, then the oldest. Displaced entries that carry local
/// modifications are handed to the eviction callback.
///
/// All mutating operations take a `caller_id` so that one transaction can
/// re-enter its own bucket locks across calls.
pub struct Cache {
    buckets: Box<[Bucket]>,
    bucket_mask: u64,
    pool: Pool,
    callback: EvictionCallback,
}

fn calc_tag(keyhash: u64) -> u16 {
    // Tag from the top of the 62-bit hash; bucket index comes from the
    // bottom. Zero is reserved for empty slots.
    let tag = (keyhash >> 46) as u16;
    if tag == 0 {
        1
    } else {
        tag
    }
}

fn make_item_vec(tag: u16, offset: u64) -> u64 {
    debug_assert!(offset <= OFFSET_MASK);
    ((tag as u64) << 48) | (offset & OFFSET_MASK)
}

fn vec_tag(item_vec: u64) -> u16 {
    (item_vec >> 48) as u16
}

fn vec_offset(item_vec: u64) -> u64 {
    item_vec & OFFSET_MASK
}

impl Cache {
    /// Builds a cache from its config groups and the eviction callback that
    /// will receive displaced modified entries.
    pub fn from_config(config: &CacheConfig, callback: EvictionCallback) -> CResult<Self> {
        config.validate()?;
        let pool = Pool::new(&config.pool)?;
        let buckets = (0..config.table.buckets)
            .map(|_| Bucket::new())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self { buckets, bucket_mask: config.table.buckets - 1, pool, callback })
    }

    fn bucket_for(&self, keyhash: u64) -> &Bucket {
        &self.buckets[(keyhash & self.bucket_mask) as usize]
    }

    fn item_at(&self, offset: u64) -> ItemView {
        unsafe { ItemView::from_raw(self.pool.item_ptr(offset)) }
    }

    /// Index of the slot holding `key`, if cached. Bucket lock must be held.
    fn find_item_index(&self, bucket: &Bucket, keyhash: u64, tag: u16, key: &[u8]) -> Option<usize> {
        for (index, slot) in bucket.item_vec.iter().enumerate() {
            let item_vec = slot.load(Ordering::Acquire);
            if item_vec == 0 || vec_tag(item_vec) != tag {
                continue;
            }
            let offset = vec_offset(item_vec);
            if !self.pool.is_valid(offset) {
                continue;
            }
            let item = self.item_at(offset);
            if item.keyhash() == keyhash && item.key() == key {
                return Some(index);
            }
        }
        None
    }

    /// Victim slot for a new entry: a slot sharing the tag (bounds the churn
    /// of ghost entries when the log is tight), else the first empty slot,
    /// else the slot with the oldest allocation.
    fn pick_victim(&self, bucket: &Bucket, tag: u16) -> usize {
        let mut empty = None;
        let mut oldest = 0;
        let mut oldest_offset = u64::MAX;
        for (index, slot) in bucket.item_vec.iter().enumerate() {
            let item_vec = slot.load(Ordering::Acquire);
            if item_vec == 0 {
                empty.get_or_insert(index);
                continue;
            }
            if vec_tag(item_vec) == tag {
                return index;
            }
            let offset = vec_offset(item_vec);
            if offset < oldest_offset {
                oldest_offset = offset;
                oldest = index;
            }
        }
        empty.unwrap_or(oldest)
    }

    /// Fires the eviction callback for a displaced slot if its item is still
    /// intact and modified, then returns the storage.
    fn evict_slot(&self, item_vec: u64, pool_locked: bool) {
        let offset = vec_offset(item_vec);
        if self.pool.is_valid(offset) {
            let item = self.item_at(offset);
            if item.is_modified() {
                (self.callback)(item.key(), item.value());
            }
        }
        match self.pool.kind() {
            PoolKind::CircularLog => self.pool.release(offset),
            PoolKind::SegregatedFit => {
                if pool_locked {
                    self.pool.release(offset);
                } else {
                    self.pool.lock();
                    self.pool.release(offset);
                    self.pool.unlock();
                }
            }
        }
    }

    /// Zeroes slots whose storage the log tail has overrun. Bucket lock must
    /// be held, so the sweep shares the version bump of the operation that
    /// advanced the tail.
    fn scrub_stale_slots(&self, bucket: &Bucket) {
        if self.pool.kind() != PoolKind::CircularLog {
            return;
        }
        for slot in &bucket.item_vec {
            let item_vec = slot.load(Ordering::Relaxed);
            if item_vec != 0 && !self.pool.is_valid(vec_offset(item_vec)) {
                slot.store(0, Ordering::Release);
            }
        }
    }

    /// Reserves a pending entry for `key` so a value fetched from the
    /// primary can be installed later, and records in `out_version` the
    /// bucket version the bucket will publish on unlock. A later
    /// `prepare_read`/`prepare_write` presenting that version proves no
    /// invalidation slipped in between.
    ///
    /// Returns `Exists` if the key is already cached, `Locked` if the bucket
    /// is held by another caller, `InsufficientSpace` if the pool cannot
    /// hold the reservation.
    pub fn placeholder(
        &self,
        caller_id: CallerId,
        keyhash: u64,
        key: &[u8],
        value_length: usize,
        out_version: &mut u64,
    ) -> CacheResult {
        debug_assert!(key.len() <= MAX_KEY_LENGTH);
        let bucket = self.bucket_for(keyhash);
        let tag = calc_tag(keyhash);

        if !bucket.try_lock(caller_id) {
            return CacheResult::Locked;
        }

        if self.find_item_index(bucket, keyhash, tag, key).is_some() {
            bucket.unlock(caller_id);
            return CacheResult::Exists;
        }

        let index = self.pick_victim(bucket, tag);
        let victim_vec = bucket.item_vec[index].load(Ordering::Acquire);

        // The pool stays locked until the new item bytes are written;
        // otherwise a concurrent allocation could overrun the location
        // before it is initialized.
        self.pool.lock();
        let new_offset = self.pool.allocate(item_bytes(key.len(), value_length));
        if new_offset == INSUFFICIENT_SPACE {
            self.pool.unlock();
            bucket.unlock(caller_id);
            return CacheResult::InsufficientSpace;
        }
        self.item_at(new_offset).init_pending(keyhash, key, value_length);
        if victim_vec != 0 {
            self.evict_slot(victim_vec, true);
        }
        self.pool.unlock();

        bucket.item_vec[index].store(make_item_vec(tag, new_offset), Ordering::Release);
        self.scrub_stale_slots(bucket);

        // Stamp the version the unlock below will publish.
        *out_version = bucket.get_next_version();
        bucket.unlock(caller_id);
        CacheResult::Success
    }

    /// Finalizes a placeholder with the value read from the primary. Fails
    /// with `Invalidated` when the bucket version moved past
    /// `expected_version`, i.e. an invalidation (or another displacement)
    /// landed after the placeholder.
    pub fn prepare_read(
        &self,
        caller_id: CallerId,
        keyhash: u64,
        key: &[u8],
        value: &[u8],
        expected_version: u64,
        deleted: bool,
    ) -> CacheResult {
        self.prepare(caller_id, keyhash, key, value, expected_version, deleted, false)
    }

    /// Like `prepare_read`, but on `Success` and `Exists` the bucket stays
    /// locked by `caller_id`, blocking write-write conflicts until the
    /// caller commits (`commit_write`/`commit_del`) or aborts
    /// (`abort_write`).
    pub fn prepare_write(
        &self,
        caller_id: CallerId,
        keyhash: u64,
        key: &[u8],
        value: &[u8],
        expected_version: u64,
        deleted: bool,
    ) -> CacheResult {
        self.prepare(caller_id, keyhash, key, value, expected_version, deleted, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn prepare(
        &self,
        caller_id: CallerId,
        keyhash: u64,
        key: &[u8],
        value: &[u8],
        expected_version: u64,
        deleted: bool,
        keep_locked: bool,
    ) -> CacheResult {
        debug_assert!(key.len() <= MAX_KEY_LENGTH);
        let bucket = self.bucket_for(keyhash);
        let tag = calc_tag(keyhash);

        bucket.lock(caller_id);

        // Checked under the lock so no invalidation can interleave: a
        // mismatch means the bucket changed after the placeholder was
        // stamped.
        if expected_version != bucket.get_version() {
            bucket.unlock(caller_id);
            return CacheResult::Invalidated;
        }

        let Some(index) = self.find_item_index(bucket, keyhash, tag, key) else {
            bucket.unlock(caller_id);
            return CacheResult::NotFound;
        };

        let item_vec = bucket.item_vec[index].load(Ordering::Acquire);
        let offset = vec_offset(item_vec);
        let needed = item_bytes(key.len(), value.len());

        self.pool.lock();

        let item = self.item_at(offset);
        if !item.is_pending() {
            // Already finalized by a concurrent operation.
            self.pool.unlock();
            if !keep_locked {
                bucket.unlock(caller_id);
            }
            return CacheResult::Exists;
        }

        if self.pool.is_valid(offset) && self.pool.item_capacity(offset) >= needed {
            item.finalize_value(value, deleted);
            self.pool.unlock();
            if !keep_locked {
                bucket.unlock(caller_id);
            }
            return CacheResult::Success;
        }

        // The reservation was overrun or is too small; rewrite elsewhere.
        let new_offset = self.pool.allocate(needed);
        if new_offset == INSUFFICIENT_SPACE {
            self.pool.unlock();
            bucket.unlock(caller_id);
            return CacheResult::InsufficientSpace;
        }
        self.item_at(new_offset).init_finalized(keyhash, key, value, deleted);
        self.pool.unlock();

        bucket.item_vec[index].store(make_item_vec(tag, new_offset), Ordering::Release);
        self.scrub_stale_slots(bucket);
        self.release_offset(offset);

        if !keep_locked {
            bucket.unlock(caller_id);
        }
        CacheResult::Success
    }

    fn release_offset(&self, offset: u64) {
        match self.pool.kind() {
            PoolKind::CircularLog => self.pool.release(offset),
            PoolKind::SegregatedFit => {
                self.pool.lock();
                self.pool.release(offset);
                self.pool.unlock();
            }
        }
    }

    /// Overwrites the value of a committed entry in place and marks it
    /// modified. The bucket must already be locked by `caller_id` from a
    /// successful `prepare_write`; the lock is consumed.
    pub fn commit_write(&self, caller_id: CallerId, keyhash: u64, key: &[u8], value: &[u8]) -> CacheResult {
        self.commit(caller_id, keyhash, key, value, false)
    }

    /// Marks an entry logically deleted with an empty value, so later cache
    /// reads observe its non-existence without a round-trip. The bucket must
    /// already be locked by `caller_id`; the lock is consumed.
    pub fn commit_del(&self, caller_id: CallerId, keyhash: u64, key: &[u8]) -> CacheResult {
        self.commit(caller_id, keyhash, key, &[], true)
    }

    fn commit(
        &self,
        caller_id: CallerId,
        keyhash: u64,
        key: &[u8],
        value: &[u8],
        deleted: bool,
    ) -> CacheResult {
        let bucket = self.bucket_for(keyhash);
        let tag = calc_tag(keyhash);

        if !bucket.is_locked_by(caller_id) {
            return CacheResult::Error;
        }

        let Some(index) = self.find_item_index(bucket, keyhash, tag, key) else {
            bucket.unlock(caller_id);
            return CacheResult::NotFound;
        };

        let item_vec = bucket.item_vec[index].load(Ordering::Acquire);
        let offset = vec_offset(item_vec);
        let needed = item_bytes(key.len(), value.len());

        // The overwrite decision must not race a tail wrap.
        self.pool.lock();

        let item = self.item_at(offset);
        if item.is_pending() {
            // Commits apply to finalized entries only.
            self.pool.unlock();
            bucket.unlock(caller_id);
            return CacheResult::Error;
        }

        if self.pool.is_valid(offset) && self.pool.item_capacity(offset) >= needed {
            item.update_value(value, deleted);
            self.pool.unlock();
            bucket.unlock(caller_id);
            return CacheResult::Success;
        }

        let new_offset = self.pool.allocate(needed);
        if new_offset == INSUFFICIENT_SPACE {
            self.pool.unlock();
            bucket.unlock(caller_id);
            return CacheResult::InsufficientSpace;
        }
        let new_item = self.item_at(new_offset);
        new_item.init_finalized(keyhash, key, value, deleted);
        new_item.mark_modified();
        self.pool.unlock();

        bucket.item_vec[index].store(make_item_vec(tag, new_offset), Ordering::Release);
        self.scrub_stale_slots(bucket);
        self.release_offset(offset);
        bucket.unlock(caller_id);
        CacheResult::Success
    }

    /// Releases a bucket locked by `prepare_write` without mutating it.
    pub fn abort_write(&self, caller_id: CallerId, keyhash: u64) -> CacheResult {
        let bucket = self.bucket_for(keyhash);
        assert!(
            bucket.is_locked_by(caller_id),
            "abort_write on a bucket the caller does not hold"
        );
        bucket.unlock(caller_id);
        CacheResult::Success
    }

    /// Drops every entry in the bucket containing `keyhash`, firing the
    /// eviction callback for intact modified entries, and advances the
    /// bucket incarnation. Returns `Locked` instead of waiting if the
    /// bucket is held by another caller.
    pub fn invalidate(&self, caller_id: CallerId, keyhash: u64) -> CacheResult {
        let bucket = self.bucket_for(keyhash);
        if !bucket.try_lock(caller_id) {
            return CacheResult::Locked;
        }

        for slot in &bucket.item_vec {
            let item_vec = slot.load(Ordering::Acquire);
            if item_vec == 0 {
                continue;
            }
            self.evict_slot(item_vec, false);
            slot.store(0, Ordering::Release);
        }

        bucket.bump_incarnation();
        bucket.unlock(caller_id);
        CacheResult::Success
    }

    /// Optimistic read. Copies the cached value into `out`, setting
    /// `value_length` to the full value size and `out_version` to the bucket
    /// version the read was consistent at. Pending and logically deleted
    /// entries read as `NotFound`; a too-small `out` yields `PartialValue`.
    ///
    /// `allow_mutation` is accepted for parity with table modes that reorder
    /// entries on access; the lossy table never mutates on read.
    pub fn get(
        &self,
        keyhash: u64,
        key: &[u8],
        out: &mut [u8],
        value_length: &mut usize,
        out_version: &mut u64,
        allow_mutation: bool,
    ) -> CacheResult {
        let _ = allow_mutation;
        let bucket = self.bucket_for(keyhash);
        let tag = calc_tag(keyhash);

        loop {
            let version = bucket.read_version_begin();

            let mut found = None;
            for slot in &bucket.item_vec {
                let item_vec = slot.load(Ordering::Acquire);
                if item_vec == 0 || vec_tag(item_vec) != tag {
                    continue;
                }
                let offset = vec_offset(item_vec);
                if !self.pool.is_valid(offset) {
                    continue;
                }
                let item = self.item_at(offset);
                if item.keyhash() == keyhash && item.key() == key {
                    found = Some((offset, item));
                    break;
                }
            }

            let Some((offset, item)) = found else {
                if bucket.read_version_end() == version {
                    return CacheResult::NotFound;
                }
                continue; // writer interleaved; retry
            };

            let pending = item.is_pending();
            let deleted = item.is_deleted();
            let full_length = item.value_length();
            let copied = item.copy_value_into(out);

            // Everything above was read without the lock; it only counts if
            // the version bracket held and the log did not wrap over the
            // item mid-copy.
            if bucket.read_version_end() != version {
                continue;
            }
            if !self.pool.is_valid(offset) {
                // Displaced by a tail wrap: a lossy miss.
                return CacheResult::NotFound;
            }
            if pending || deleted {
                return CacheResult::NotFound;
            }

            *value_length = full_length;
            *out_version = version;
            return if copied < full_length {
                CacheResult::PartialValue
            } else {
                CacheResult::Success
            };
        }
    }

    /// Published version of the bucket holding `keyhash`.
    pub fn version(&self, keyhash: u64) -> u64 {
        self.bucket_for(keyhash).get_version()
    }

    /// Incarnation snapshot of the bucket holding `keyhash`; advances on
    /// every invalidation.
    pub fn incarnation(&self, keyhash: u64) -> u32 {
        self.bucket_for(keyhash).incarnation()
    }
}
