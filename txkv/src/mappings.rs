//! Key-to-node placement.
//!
//! The real mapping table is maintained by the cluster membership layer;
//! the substrate only consumes it through this trait: which machine is the
//! primary for a keyhash, which machines hold its backups, and where the
//! key's directory entry lives (machine plus byte offset into the directory
//! region).

use crate::directory::ENTRY_BYTES;
use crate::MachineId;

pub trait Mappings: Send + Sync {
    /// This machine's id.
    fn machine_id(&self) -> MachineId;

    /// Backup replicas per key.
    fn num_backups(&self) -> usize;

    /// The primary datastore node for a keyhash.
    fn primary_mn(&self, keyhash: u64) -> MachineId;

    /// The `index`-th backup of a primary.
    fn backup_mn_from_primary(&self, primary: MachineId, index: usize) -> MachineId;

    /// The machine hosting the directory entry for a keyhash.
    fn directory_mn(&self, keyhash: u64) -> MachineId;

    /// Byte offset of the entry within that machine's directory region.
    fn directory_offset(&self, keyhash: u64) -> u64;
}

/// Modular placement over a fixed machine count. Enough for tests, examples
/// and small static clusters.
pub struct StaticMappings {
    pub machine_id: MachineId,
    pub num_machines: u32,
    pub num_backups: usize,
    pub directory_entries: u64,
}

impl Mappings for StaticMappings {
    fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    fn num_backups(&self) -> usize {
        self.num_backups
    }

    fn primary_mn(&self, keyhash: u64) -> MachineId {
        (keyhash % self.num_machines as u64) as MachineId
    }

    fn backup_mn_from_primary(&self, primary: MachineId, index: usize) -> MachineId {
        (primary + 1 + index as MachineId) % self.num_machines
    }

    fn directory_mn(&self, keyhash: u64) -> MachineId {
        (keyhash % self.num_machines as u64) as MachineId
    }

    fn directory_offset(&self, keyhash: u64) -> u64 {
        (keyhash % self.directory_entries) * ENTRY_BYTES as u64
    }
}
