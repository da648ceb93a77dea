use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

use crate::CallerId;

/// Slots per bucket.
pub const BUCKET_SIZE: usize = 7;

/// Stored in `locker_id` while the bucket is unlocked.
pub const INVALID_LOCKER_ID: CallerId = u32::MAX;

/// A fixed group of slots; the unit of locking and versioning.
///
/// The low bit of `version` is the lock flag: even means unlocked, odd means
/// locked. Unlocking increments the version, so every locked section
/// advances the generation by exactly one published (even) step. `locker_id`
/// names the current holder and makes the lock reentrant: a caller that
/// already holds the lock acquires it again for free, and a single unlock
/// releases it. Each slot word packs a 16-bit tag and a 48-bit pool offset;
/// zero means the slot is empty.
#[repr(align(64))]
pub(crate) struct Bucket {
    version: AtomicU64,
    locker_id: AtomicU32,
    incarnation: AtomicU32,
    pub(crate) item_vec: [AtomicU64; BUCKET_SIZE],
}

impl Bucket {
    pub(crate) fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            version: AtomicU64::new(0),
            locker_id: AtomicU32::new(INVALID_LOCKER_ID),
            incarnation: AtomicU32::new(0),
            item_vec: [ZERO; BUCKET_SIZE],
        }
    }

    /// Single lock attempt. Succeeds immediately when `caller_id` already
    /// holds the lock; the recursion is not counted, so one unlock releases
    /// the bucket no matter how many times the holder re-acquired it.
    pub(crate) fn try_lock(&self, caller_id: CallerId) -> bool {
        let v = self.version.load(Ordering::Acquire);
        if v & 1 == 1 {
            return self.locker_id.load(Ordering::Relaxed) == caller_id;
        }
        if self
            .version
            .compare_exchange(v, v | 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            debug_assert_eq!(self.locker_id.load(Ordering::Relaxed), INVALID_LOCKER_ID);
            self.locker_id.store(caller_id, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub(crate) fn lock(&self, caller_id: CallerId) {
        while !self.try_lock(caller_id) {
            std::hint::spin_loop();
        }
    }

    /// Releases the lock, restoring even parity and advancing the
    /// generation. Caller must hold the lock.
    pub(crate) fn unlock(&self, caller_id: CallerId) {
        assert_eq!(
            self.locker_id.load(Ordering::Relaxed),
            caller_id,
            "bucket unlocked by a caller that does not hold it"
        );
        self.locker_id.store(INVALID_LOCKER_ID, Ordering::Relaxed);
        let v = self.version.load(Ordering::Relaxed);
        debug_assert_eq!(v & 1, 1);
        // The holder is the only writer of `version` while the lock bit is
        // set; a plain store suffices.
        self.version.store(v.wrapping_add(1), Ordering::Release);
    }

    pub(crate) fn is_locked_by(&self, caller_id: CallerId) -> bool {
        self.version.load(Ordering::Acquire) & 1 == 1
            && self.locker_id.load(Ordering::Relaxed) == caller_id
    }

    /// Begins an optimistic read, waiting out any in-flight writer. Returns
    /// the (even) version to compare against [`Bucket::read_version_end`].
    pub(crate) fn read_version_begin(&self) -> u64 {
        loop {
            let v = self.version.load(Ordering::Acquire);
            if v & 1 == 0 {
                return v;
            }
            std::hint::spin_loop();
        }
    }

    /// Ends an optimistic read. If the returned version differs from the one
    /// `read_version_begin` produced, a writer intervened and everything
    /// read in between is suspect.
    pub(crate) fn read_version_end(&self) -> u64 {
        fence(Ordering::Acquire);
        self.version.load(Ordering::Acquire)
    }

    /// The published version, lock bit masked off.
    pub(crate) fn get_version(&self) -> u64 {
        self.version.load(Ordering::Acquire) & !1
    }

    /// The version that will be published when the current locked section
    /// unlocks. Used to stamp placeholders while holding the lock.
    pub(crate) fn get_next_version(&self) -> u64 {
        self.version.load(Ordering::Acquire).wrapping_add(1) & !1
    }

    pub(crate) fn incarnation(&self) -> u32 {
        self.incarnation.load(Ordering::Acquire)
    }

    /// Advances the incarnation. Called under the lock when the bucket's
    /// contents are invalidated wholesale.
    pub(crate) fn bump_incarnation(&self) {
        self.incarnation.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lock_parity_and_generation() {
        let b = Bucket::new();
        assert_eq!(b.get_version(), 0);

        assert!(b.try_lock(1));
        // Locked: raw version is odd, published version still masks to even.
        assert_eq!(b.get_version(), 0);
        assert_eq!(b.get_next_version(), 2);

        b.unlock(1);
        assert_eq!(b.get_version(), 2);
    }

    #[test]
    fn reentrant_for_holder_only() {
        let b = Bucket::new();
        assert!(b.try_lock(3));
        assert!(b.try_lock(3)); // same caller re-acquires for free
        assert!(!b.try_lock(4)); // different caller is refused
        assert!(b.is_locked_by(3));
        assert!(!b.is_locked_by(4));
        b.unlock(3); // a single unlock releases it
        assert!(b.try_lock(4));
        b.unlock(4);
    }

    #[test]
    #[should_panic(expected = "does not hold it")]
    fn unlock_by_non_owner_panics() {
        let b = Bucket::new();
        assert!(b.try_lock(1));
        b.unlock(2);
    }

    #[test]
    fn seqlock_read_detects_writer() {
        let b = Bucket::new();
        let v = b.read_version_begin();
        assert_eq!(b.read_version_end(), v); // no writer: bracket matches

        let v = b.read_version_begin();
        b.lock(9);
        b.unlock(9);
        assert_ne!(b.read_version_end(), v); // writer intervened
    }

    #[test]
    fn contended_try_lock_has_one_winner() {
        let b = Bucket::new();
        let won = std::sync::atomic::AtomicU32::new(0);
        std::thread::scope(|s| {
            for caller in 0..8u32 {
                let b = &b;
                let won = &won;
                s.spawn(move || {
                    if b.try_lock(caller) {
                        won.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(5));
                        b.unlock(caller);
                    }
                });
            }
        });
        assert!(won.load(Ordering::SeqCst) >= 1);
        assert_eq!(b.get_version() % 2, 0);
        assert_eq!(b.get_version() / 2, won.load(Ordering::SeqCst) as u64);
    }
}
