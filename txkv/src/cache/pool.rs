//! Log-allocated item storage.
//!
//! The pool hands out monotonically increasing byte offsets into a
//! power-of-two arena. Every allocation is prefixed with an 8-byte block
//! header recording its payload capacity. Two strategies share the same
//! interface:
//!
//! - [`PoolKind::CircularLog`]: the tail wraps over the oldest data, so
//!   allocation always succeeds (unless the request exceeds the arena) and
//!   `release` is a no-op. Overwritten items are detected afterwards via
//!   [`Pool::is_valid`], which is monotone: once an offset goes stale it
//!   stays stale.
//! - [`PoolKind::SegregatedFit`]: blocks are rounded to power-of-two size
//!   classes and recycled through free lists; the tail never wraps, so every
//!   live offset stays valid and `release` performs a real free.
//!
//! The pool carries one coarse lock. It only fences the allocate/release
//! window against concurrent `is_valid` checks on the overwrite paths;
//! callers on the circular no-op `release` path may skip it (branch on
//! [`Pool::kind`]).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde_derive::{Deserialize, Serialize};

use crate::cache::item::round_up8;
use crate::config::PoolConfig;
use crate::error::{CResult, Error};

/// Storage strategy tag, exposed so higher layers can skip pool locking on
/// paths where `release` does nothing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    CircularLog,
    SegregatedFit,
}

/// Returned by `allocate` when the request cannot be satisfied.
pub const INSUFFICIENT_SPACE: u64 = u64::MAX;

/// Offsets must fit the 48-bit slot field of the cache table.
pub(crate) const OFFSET_MASK: u64 = (1u64 << 48) - 1;

const BLOCK_HEADER_BYTES: u64 = 8;

/// Smallest segregated-fit class, and the largest class index such classes
/// up to a full 2^48 arena are representable.
const MIN_CLASS_BYTES: u64 = 32;
const NUM_CLASSES: usize = 44;

pub struct Pool {
    kind: PoolKind,
    size: u64,
    mask: u64,
    arena: UnsafeCell<Box<[u64]>>,
    /// Monotone allocation cursor, in bytes. Only the circular log lets it
    /// run past `size`.
    tail: AtomicU64,
    busy: AtomicBool,
    /// Segregated fit only: recycled block offsets, one list per size class.
    /// Manipulated only inside the lock()/unlock() window.
    free_lists: Mutex<Vec<Vec<u64>>>,
}

// The arena is raw shared storage; all access is serialized by bucket locks
// or validated by seqlock version brackets at the call sites.
unsafe impl Send for Pool {}
unsafe impl Sync for Pool {}

impl Pool {
    pub fn new(config: &PoolConfig) -> CResult<Self> {
        if config.size == 0 || !config.size.is_power_of_two() {
            return Err(Error::InvalidInput(format!(
                "pool size must be a power of two, got {}",
                config.size
            )));
        }
        if config.size > OFFSET_MASK {
            return Err(Error::InvalidInput(format!(
                "pool size {} exceeds the 48-bit offset space",
                config.size
            )));
        }
        Ok(Self {
            kind: config.kind,
            size: config.size,
            mask: config.size - 1,
            arena: UnsafeCell::new(vec![0u64; (config.size / 8) as usize].into_boxed_slice()),
            tail: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            free_lists: Mutex::new(vec![Vec::new(); NUM_CLASSES]),
        })
    }

    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Acquires the coarse pool lock. Held across allocate/release windows
    /// where a concurrent `is_valid` must not observe a half-made decision.
    pub fn lock(&self) {
        while self
            .busy
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    pub fn unlock(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Allocates `payload` bytes (rounded up to 8), returning the block
    /// offset or [`INSUFFICIENT_SPACE`]. Caller must hold the pool lock.
    pub fn allocate(&self, payload: u32) -> u64 {
        debug_assert!(self.busy.load(Ordering::Relaxed));
        match self.kind {
            PoolKind::CircularLog => self.allocate_circular(payload),
            PoolKind::SegregatedFit => self.allocate_segregated(payload),
        }
    }

    fn allocate_circular(&self, payload: u32) -> u64 {
        let total = BLOCK_HEADER_BYTES + round_up8(payload as usize) as u64;
        if total > self.size {
            return INSUFFICIENT_SPACE;
        }
        let mut tail = self.tail.load(Ordering::Relaxed);
        // Blocks never straddle the arena end; skip the remainder of the
        // ring segment if this one would. The skipped bytes are simply never
        // referenced.
        let segment_left = self.size - (tail & self.mask);
        if total > segment_left {
            tail += segment_left;
        }
        self.tail.store(tail + total, Ordering::Release);
        self.write_block_header(tail, (total - BLOCK_HEADER_BYTES) as u32);
        tail
    }

    fn allocate_segregated(&self, payload: u32) -> u64 {
        let rounded = class_bytes(payload);
        let mut free = self.free_lists.lock().expect("pool free lists poisoned");
        if let Some(offset) = free[class_index(rounded)].pop() {
            return offset;
        }
        let tail = self.tail.load(Ordering::Relaxed);
        if tail + rounded > self.size {
            return INSUFFICIENT_SPACE;
        }
        self.tail.store(tail + rounded, Ordering::Release);
        self.write_block_header(tail, (rounded - BLOCK_HEADER_BYTES) as u32);
        tail
    }

    /// Returns a block to the pool. A no-op for the circular log (the tail
    /// wrap reclaims space); a real free for segregated fit, which requires
    /// the pool lock to be held.
    pub fn release(&self, offset: u64) {
        match self.kind {
            PoolKind::CircularLog => {}
            PoolKind::SegregatedFit => {
                debug_assert!(self.busy.load(Ordering::Relaxed));
                let rounded = self.item_capacity(offset) as u64 + BLOCK_HEADER_BYTES;
                let mut free = self.free_lists.lock().expect("pool free lists poisoned");
                free[class_index(rounded)].push(offset);
            }
        }
    }

    /// Whether the bytes at `offset` are still the ones their allocator
    /// wrote. Monotone: once false for an offset, it never turns true again.
    pub fn is_valid(&self, offset: u64) -> bool {
        match self.kind {
            PoolKind::CircularLog => {
                self.tail.load(Ordering::Acquire).wrapping_sub(offset) <= self.size
            }
            PoolKind::SegregatedFit => true,
        }
    }

    /// Snapshot of the allocation cursor, for post-write validation.
    pub fn get_tail(&self) -> u64 {
        self.tail.load(Ordering::Acquire)
    }

    fn base(&self) -> *mut u8 {
        unsafe { (*self.arena.get()).as_mut_ptr() as *mut u8 }
    }

    fn write_block_header(&self, offset: u64, capacity: u32) {
        unsafe {
            let p = self.base().add((offset & self.mask) as usize) as *mut u64;
            std::ptr::write_volatile(p, capacity as u64);
        }
    }

    /// Pointer to the block payload. The pointee is only trustworthy while
    /// `is_valid(offset)` holds and the caller serializes against writers.
    pub(crate) fn item_ptr(&self, offset: u64) -> *mut u8 {
        debug_assert!(offset <= OFFSET_MASK);
        unsafe {
            self.base()
                .add(((offset & self.mask) + BLOCK_HEADER_BYTES) as usize)
        }
    }

    /// Payload capacity recorded in the block header.
    pub(crate) fn item_capacity(&self, offset: u64) -> u32 {
        unsafe {
            let p = self.base().add((offset & self.mask) as usize) as *const u64;
            std::ptr::read_volatile(p) as u32
        }
    }
}

fn class_bytes(payload: u32) -> u64 {
    (BLOCK_HEADER_BYTES + round_up8(payload as usize) as u64)
        .next_power_of_two()
        .max(MIN_CLASS_BYTES)
}

fn class_index(rounded: u64) -> usize {
    (rounded.trailing_zeros() as usize) - MIN_CLASS_BYTES.trailing_zeros() as usize
}
