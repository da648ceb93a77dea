//! One-sided remote memory primitives.
//!
//! The directory protocol needs exactly three verbs against a remote memory
//! region: READ, 8-byte CAS, and WRITE, each completing before the next is
//! posted. [`OneSidedMemory`] is that seam. Production deployments back it
//! with an RDMA-capable fabric; [`SharedRegion`] is the in-process stand-in
//! used by tests and examples, which gets the same per-entry linearizability
//! from a per-region mutex.

use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::error::{CResult, Error};
use crate::MachineId;

pub trait OneSidedMemory: Send + Sync {
    /// Remote load of `len` bytes at `addr`. Completes before returning.
    fn read(&self, machine: MachineId, addr: u64, len: usize) -> CResult<Bytes>;

    /// 8-byte compare-and-swap at `addr`. Returns the prior word; the swap
    /// took effect iff the prior word equals `expected`.
    fn compare_and_swap(
        &self,
        machine: MachineId,
        addr: u64,
        expected: u64,
        desired: u64,
    ) -> CResult<u64>;

    /// Remote store of `data` at `addr`. Completes before returning.
    fn write(&self, machine: MachineId, addr: u64, data: &[u8]) -> CResult<()>;
}

/// In-process remote memory: one byte region per machine, each linearized by
/// a mutex.
pub struct SharedRegion {
    regions: HashMap<MachineId, Mutex<Vec<u8>>>,
}

impl SharedRegion {
    pub fn new(machines: &[MachineId], bytes_per_machine: u64) -> Self {
        let regions = machines
            .iter()
            .map(|m| (*m, Mutex::new(vec![0u8; bytes_per_machine as usize])))
            .collect();
        Self { regions }
    }

    fn region(&self, machine: MachineId) -> CResult<&Mutex<Vec<u8>>> {
        self.regions
            .get(&machine)
            .ok_or_else(|| Error::Internal(format!("no region for machine {}", machine)))
    }

    fn check_bounds(region: &[u8], addr: u64, len: usize) -> CResult<usize> {
        let addr = addr as usize;
        if addr + len > region.len() {
            return Err(Error::Internal(format!(
                "remote access [{}, {}) outside region of {} bytes",
                addr,
                addr + len,
                region.len()
            )));
        }
        Ok(addr)
    }
}

impl OneSidedMemory for SharedRegion {
    fn read(&self, machine: MachineId, addr: u64, len: usize) -> CResult<Bytes> {
        let region = self.region(machine)?.lock().expect("region poisoned");
        let addr = Self::check_bounds(&region, addr, len)?;
        Ok(Bytes::copy_from_slice(&region[addr..addr + len]))
    }

    fn compare_and_swap(
        &self,
        machine: MachineId,
        addr: u64,
        expected: u64,
        desired: u64,
    ) -> CResult<u64> {
        let mut region = self.region(machine)?.lock().expect("region poisoned");
        let addr = Self::check_bounds(&region, addr, 8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&region[addr..addr + 8]);
        let prior = u64::from_le_bytes(word);
        if prior == expected {
            region[addr..addr + 8].copy_from_slice(&desired.to_le_bytes());
        }
        Ok(prior)
    }

    fn write(&self, machine: MachineId, addr: u64, data: &[u8]) -> CResult<()> {
        let mut region = self.region(machine)?.lock().expect("region poisoned");
        let addr = Self::check_bounds(&region, addr, data.len())?;
        region[addr..addr + data.len()].copy_from_slice(data);
        Ok(())
    }
}
