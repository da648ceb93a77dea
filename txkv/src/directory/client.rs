use std::sync::Arc;

use crate::directory::remote::OneSidedMemory;
use crate::directory::{DirectoryEntry, DirectoryResult, ENTRY_BYTES};
use crate::keyhash::dir_keyhash;
use crate::mappings::Mappings;
use crate::{Key, MachineId};

/// Client side of the ownership directory.
///
/// Each worker thread gets its own client; the remote region itself is the
/// shared state, and the 8-byte CAS on an entry's owner/accessor word
/// totally orders every transition. A transition that loses a race observes
/// a stale expected value, reloads from the prior word the CAS returned, and
/// retries; once an entry is owned, the state is terminal until the owner
/// publishes a non-owned word with `release`.
pub struct DirectoryClient {
    mappings: Arc<dyn Mappings>,
    fabric: Arc<dyn OneSidedMemory>,
}

impl DirectoryClient {
    pub fn new(mappings: Arc<dyn Mappings>, fabric: Arc<dyn OneSidedMemory>) -> Self {
        Self { mappings, fabric }
    }

    fn locate(&self, keyhash: u64) -> (MachineId, u64) {
        (
            self.mappings.directory_mn(keyhash),
            self.mappings.directory_offset(keyhash),
        )
    }

    fn read_entry(&self, machine: MachineId, addr: u64) -> DirectoryEntry {
        // A failed completion means the fabric is broken; continuing would
        // corrupt the ownership bitmaps, so the process goes down instead.
        let buf = match self.fabric.read(machine, addr, ENTRY_BYTES) {
            Ok(buf) => buf,
            Err(err) => panic!("directory read completion failed: {}", err),
        };
        match DirectoryEntry::decode(&buf) {
            Ok(entry) => entry,
            Err(err) => panic!("directory entry corrupt: {}", err),
        }
    }

    fn cas_word(&self, machine: MachineId, addr: u64, expected: u64, desired: u64) -> u64 {
        match self.fabric.compare_and_swap(machine, addr, expected, desired) {
            Ok(prior) => prior,
            Err(err) => panic!("directory cas completion failed: {}", err),
        }
    }

    /// Registers this machine as an accessor of `key`'s entry, so a future
    /// owner will know to invalidate our cache. On `Success`, `entry_out`
    /// holds the entry including our accessor bit. `Owned` means some
    /// machine holds the entry exclusively (an abort hint); an entry we own
    /// ourselves also reads as `Owned`, since an owner is not an accessor.
    pub fn lookup(&self, key: Key, entry_out: &mut DirectoryEntry) -> DirectoryResult {
        let keyhash = dir_keyhash(key);
        let (machine, addr) = self.locate(keyhash);
        let me = self.mappings.machine_id();

        let mut entry = self.read_entry(machine, addr);
        if entry.is_owned() {
            *entry_out = entry;
            return DirectoryResult::Owned;
        }

        loop {
            let mut desired = entry;
            desired.add_accessor(me);
            let prior = self.cas_word(machine, addr, entry.owner_accessors, desired.owner_accessors);
            if prior == entry.owner_accessors {
                *entry_out = desired;
                return DirectoryResult::Success;
            }
            // Lost the race; the prior word is the fresh snapshot.
            entry.owner_accessors = prior;
            if entry.is_owned() {
                *entry_out = entry;
                return DirectoryResult::Owned;
            }
        }
    }

    /// Takes exclusive ownership of `key`'s entry, clearing the accessor
    /// set. Acquiring an entry we already own succeeds immediately. `Owned`
    /// means another machine got there first.
    ///
    /// Ownership blocks other writers the way a lock would, except that a
    /// contender can ask for the entry to be released through the cache
    /// invalidation path instead of waiting.
    pub fn acquire(&self, key: Key, entry_out: &mut DirectoryEntry) -> DirectoryResult {
        let keyhash = dir_keyhash(key);
        let (machine, addr) = self.locate(keyhash);
        let me = self.mappings.machine_id();

        let mut entry = self.read_entry(machine, addr);
        if entry.is_owned() {
            *entry_out = entry;
            return if entry.is_owner(me) {
                DirectoryResult::Success // re-acquire
            } else {
                DirectoryResult::Owned
            };
        }

        loop {
            let mut desired = entry;
            desired.set_owned(me);
            let prior = self.cas_word(machine, addr, entry.owner_accessors, desired.owner_accessors);
            if prior == entry.owner_accessors {
                *entry_out = desired;
                return DirectoryResult::Success;
            }
            entry.owner_accessors = prior;
            if entry.is_owned() {
                break;
            }
        }

        *entry_out = entry;
        // Another coroutine on this machine may have won the race for us.
        if entry.is_owner(me) {
            DirectoryResult::Success
        } else {
            DirectoryResult::Owned
        }
    }

    /// Publishes `new_entry` over the entry with an unconditional remote
    /// WRITE, ending this machine's ownership. Must only be called after a
    /// successful `acquire`, and `new_entry` must encode a non-owned state.
    pub fn release(&self, key: Key, new_entry: DirectoryEntry) -> DirectoryResult {
        debug_assert!(!new_entry.is_owned());
        let keyhash = dir_keyhash(key);
        let (machine, addr) = self.locate(keyhash);
        if let Err(err) = self.fabric.write(machine, addr, &new_entry.encode()) {
            panic!("directory write completion failed: {}", err);
        }
        DirectoryResult::Success
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::directory::remote::SharedRegion;
    use crate::directory::directory_size;
    use crate::mappings::StaticMappings;

    const MACHINES: u32 = 8;
    const ENTRIES: u64 = 64;

    fn fabric() -> Arc<SharedRegion> {
        let machines: Vec<MachineId> = (0..MACHINES).collect();
        Arc::new(SharedRegion::new(&machines, directory_size(ENTRIES)))
    }

    fn client(machine_id: MachineId, fabric: Arc<SharedRegion>) -> DirectoryClient {
        let mappings = Arc::new(StaticMappings {
            machine_id,
            num_machines: MACHINES,
            num_backups: 1,
            directory_entries: ENTRIES,
        });
        DirectoryClient::new(mappings, fabric)
    }

    #[test]
    fn lookup_registers_accessor() {
        let fabric = fabric();
        let m1 = client(1, fabric.clone());
        let m2 = client(2, fabric.clone());

        let mut entry = DirectoryEntry::default();
        assert_eq!(m1.lookup(7, &mut entry), DirectoryResult::Success);
        assert!(entry.is_accessor(1));

        assert_eq!(m2.lookup(7, &mut entry), DirectoryResult::Success);
        assert_eq!(entry.accessors(), vec![1, 2]);
    }

    #[test]
    fn acquire_takes_ownership_and_clears_accessors() {
        let fabric = fabric();
        let m1 = client(1, fabric.clone());
        let m2 = client(2, fabric.clone());

        let mut entry = DirectoryEntry::default();
        assert_eq!(m1.lookup(7, &mut entry), DirectoryResult::Success);
        assert_eq!(m2.acquire(7, &mut entry), DirectoryResult::Success);
        assert!(entry.is_owner(2));
        assert!(entry.accessors().is_empty());

        // Readers and other writers now bounce off the owned entry.
        assert_eq!(m1.lookup(7, &mut entry), DirectoryResult::Owned);
        assert_eq!(m1.acquire(7, &mut entry), DirectoryResult::Owned);
    }

    #[test]
    fn acquire_is_reentrant_for_the_owner() {
        let fabric = fabric();
        let m1 = client(1, fabric);
        let mut entry = DirectoryEntry::default();
        assert_eq!(m1.acquire(42, &mut entry), DirectoryResult::Success);
        assert_eq!(m1.acquire(42, &mut entry), DirectoryResult::Success);
        assert!(entry.is_owner(1));
    }

    #[test]
    fn owner_cannot_register_as_accessor_of_its_own_entry() {
        let fabric = fabric();
        let m1 = client(1, fabric);
        let mut entry = DirectoryEntry::default();
        assert_eq!(m1.acquire(42, &mut entry), DirectoryResult::Success);
        assert_eq!(m1.lookup(42, &mut entry), DirectoryResult::Owned);
    }

    #[test]
    fn release_reopens_the_entry() {
        let fabric = fabric();
        let m1 = client(1, fabric.clone());
        let m2 = client(2, fabric.clone());

        let mut entry = DirectoryEntry::default();
        assert_eq!(m1.acquire(7, &mut entry), DirectoryResult::Success);

        // Publish a fresh non-owned state with an empty accessor set.
        let new_entry = DirectoryEntry { primary: 3, backups: [4, 5], ..Default::default() };
        assert_eq!(m1.release(7, new_entry), DirectoryResult::Success);

        assert_eq!(m2.lookup(7, &mut entry), DirectoryResult::Success);
        assert_eq!(entry.accessors(), vec![2]);
        assert_eq!(entry.primary, 3);
        assert_eq!(entry.backups, [4, 5]);
    }

    #[test]
    fn acquire_race_has_exactly_one_winner() {
        let fabric = fabric();
        let outcomes = std::sync::Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for machine in 0..4u32 {
                let fabric = fabric.clone();
                let outcomes = &outcomes;
                s.spawn(move || {
                    let c = client(machine, fabric);
                    let mut entry = DirectoryEntry::default();
                    let r = c.acquire(42, &mut entry);
                    outcomes.lock().unwrap().push(r);
                });
            }
        });
        let outcomes = outcomes.lock().unwrap();
        let wins = outcomes.iter().filter(|r| **r == DirectoryResult::Success).count();
        let owned = outcomes.iter().filter(|r| **r == DirectoryResult::Owned).count();
        assert_eq!(wins, 1);
        assert_eq!(owned, 3);
    }

    #[test]
    fn contended_lookups_all_register() {
        let fabric = fabric();
        std::thread::scope(|s| {
            for machine in 0..MACHINES {
                let fabric = fabric.clone();
                s.spawn(move || {
                    let c = client(machine, fabric);
                    let mut entry = DirectoryEntry::default();
                    assert_eq!(c.lookup(42, &mut entry), DirectoryResult::Success);
                });
            }
        });
        let c = client(0, fabric);
        let mut entry = DirectoryEntry::default();
        // Everyone made it into the set despite the CAS contention; the
        // extra lookup from machine 0 is idempotent on its bit.
        assert_eq!(c.lookup(42, &mut entry), DirectoryResult::Success);
        assert_eq!(entry.accessors(), (0..MACHINES).collect::<Vec<_>>());
    }
}
