//! The distributed directory tracking per-key ownership.
//!
//! Every key maps to one directory entry on one directory machine. The
//! entry's 64-bit `owner_accessors` word encodes either a single owner (most
//! significant bit set plus exactly one machine bit) or a set of accessors
//! (owner bit clear, one bit per machine holding a cached copy). The word is
//! only ever changed through remote compare-and-swap, which makes the CAS
//! the linearization point for every ownership transition: writers acquire
//! exclusive ownership before mutating a key, readers register as accessors
//! so future invalidations reach their caches.

pub mod client;
pub mod remote;

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CResult, Error};
use crate::{Key, MachineId};

pub use client::DirectoryClient;
pub use remote::{OneSidedMemory, SharedRegion};

/// Backup replicas tracked per entry.
pub const MAX_BACKUPS: usize = 2;

/// Machine ids must fit the low 63 bits of the owner/accessor word.
pub const MAX_MACHINES: MachineId = 63;

/// Wire size of one entry: the owner/accessor word, the primary, and the
/// backup node ids.
pub const ENTRY_BYTES: usize = 8 + 4 + 4 * MAX_BACKUPS;

/// Bytes of remote memory a directory of `num_entries` entries occupies.
pub fn directory_size(num_entries: u64) -> u64 {
    num_entries * ENTRY_BYTES as u64
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DirectoryResult {
    Success,
    /// The entry is exclusively owned; the caller should abort and retry.
    Owned,
    Error,
}

/// One directory entry. `primary` and `backups` locate the authoritative
/// datastore replicas for the key; they are written at `release` time and
/// read back by `lookup`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DirectoryEntry {
    pub owner_accessors: u64,
    pub primary: MachineId,
    pub backups: [MachineId; MAX_BACKUPS],
}

const OWNER_BIT: u64 = 1u64 << 63;

impl DirectoryEntry {
    /// Whether some machine holds exclusive ownership.
    pub fn is_owned(&self) -> bool {
        self.owner_accessors & OWNER_BIT != 0
    }

    /// Whether `machine_id` is the owner: the owner bit is set and the
    /// machine's bit is the one set below it.
    pub fn is_owner(&self, machine_id: MachineId) -> bool {
        debug_assert!(machine_id < MAX_MACHINES);
        self.is_owned() && self.owner_accessors & (1u64 << machine_id) != 0
    }

    /// Makes `machine_id` the exclusive owner, clearing all accessors.
    pub fn set_owned(&mut self, machine_id: MachineId) {
        debug_assert!(machine_id < MAX_MACHINES);
        self.owner_accessors = OWNER_BIT | (1u64 << machine_id);
    }

    /// Whether `machine_id` is registered as an accessor (owner bit clear,
    /// machine bit set).
    pub fn is_accessor(&self, machine_id: MachineId) -> bool {
        debug_assert!(machine_id < MAX_MACHINES);
        !self.is_owned() && self.owner_accessors & (1u64 << machine_id) != 0
    }

    /// Adds `machine_id` to the accessor set. Only meaningful while the
    /// entry is unowned.
    pub fn add_accessor(&mut self, machine_id: MachineId) {
        debug_assert!(machine_id < MAX_MACHINES);
        debug_assert!(!self.is_owned());
        self.owner_accessors |= 1u64 << machine_id;
    }

    /// The registered accessors. Empty when the entry is owned: the bits
    /// then name the owner, not readers.
    pub fn accessors(&self) -> Vec<MachineId> {
        if self.is_owned() {
            return Vec::new();
        }
        (0..MAX_MACHINES)
            .filter(|m| self.owner_accessors & (1u64 << m) != 0)
            .collect()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.owner_accessors);
        buf.put_u32_le(self.primary);
        for backup in &self.backups {
            buf.put_u32_le(*backup);
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ENTRY_BYTES);
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> CResult<Self> {
        if buf.len() < ENTRY_BYTES {
            return Err(Error::Parse(format!(
                "directory entry truncated: {} bytes",
                buf.len()
            )));
        }
        let mut cursor = Cursor::new(buf);
        let owner_accessors = cursor.read_u64::<LittleEndian>().map_err(parse_err)?;
        let primary = cursor.read_u32::<LittleEndian>().map_err(parse_err)?;
        let mut backups = [0; MAX_BACKUPS];
        for backup in &mut backups {
            *backup = cursor.read_u32::<LittleEndian>().map_err(parse_err)?;
        }
        Ok(Self { owner_accessors, primary, backups })
    }
}

fn parse_err(err: std::io::Error) -> Error {
    Error::Parse(err.to_string())
}

/// Wire size of a directory protocol request.
pub const DIRECTORY_REQ_BYTES: usize = 32;

/// Directory protocol operations, carried between machines when an owner
/// must be displaced or accessors invalidated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DirectoryReqType {
    Invalidate = 7,
    Acquire = 8,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DirectoryRespType {
    Success = 3,
    Fail = 4,
}

impl DirectoryRespType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        match raw {
            3 => Some(DirectoryRespType::Success),
            4 => Some(DirectoryRespType::Fail),
            _ => None,
        }
    }
}

/// A directory protocol request. On the wire: `u16` request type, six pad
/// bytes so the keyhash stays 8-aligned, `u64` keyhash, `u32` requester id,
/// four pad bytes, `u64` key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DirectoryReq {
    pub req_type: DirectoryReqType,
    pub keyhash: u64,
    pub requester_id: MachineId,
    pub key: Key,
}

impl DirectoryReq {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(DIRECTORY_REQ_BYTES);
        buf.put_u16_le(self.req_type as u16);
        buf.put_bytes(0, 6);
        buf.put_u64_le(self.keyhash);
        buf.put_u32_le(self.requester_id);
        buf.put_u32_le(0);
        buf.put_u64_le(self.key);
        buf.freeze()
    }

    pub fn decode(buf: &[u8]) -> CResult<Self> {
        if buf.len() < DIRECTORY_REQ_BYTES {
            return Err(Error::Parse(format!(
                "directory request truncated: {} bytes",
                buf.len()
            )));
        }
        let mut cursor = Cursor::new(buf);
        let raw_type = cursor.read_u16::<LittleEndian>().map_err(parse_err)?;
        let req_type = match raw_type {
            7 => DirectoryReqType::Invalidate,
            8 => DirectoryReqType::Acquire,
            other => return Err(Error::Parse(format!("unknown directory request type {}", other))),
        };
        cursor.set_position(8);
        let keyhash = cursor.read_u64::<LittleEndian>().map_err(parse_err)?;
        let requester_id = cursor.read_u32::<LittleEndian>().map_err(parse_err)?;
        cursor.set_position(24);
        let key = cursor.read_u64::<LittleEndian>().map_err(parse_err)?;
        Ok(Self { req_type, keyhash, requester_id, key })
    }
}
