//! Transaction execution over the cache and the directory.
//!
//! A transaction is a cooperative task owning a read set and a write set.
//! Its read path runs in two phases: `prepare_tx` reserves cache
//! placeholders and registers with the directory (accessor registration for
//! reads, ownership acquisition for writes), then `do_read` fetches every
//! uncached item from its primary in one RPC batch and reconciles the
//! responses into the cache. The only suspension point is the batch await;
//! everything else runs to completion on the worker.

mod execute;

use std::sync::Arc;

use crate::cache::CacheRegistry;
use crate::directory::{DirectoryClient, DirectoryEntry};
use crate::error::CResult;
use crate::keyhash::cache_keyhash;
use crate::mappings::Mappings;
use crate::rpc::{ObjHeader, RpcClient, RpcReqType, OBJ_HEADER_BYTES};
use crate::{CallerId, Key, MachineId};

/// Value bytes reserved per object when a placeholder is inserted before
/// the real size is known.
pub const OBJ_VALUE_CAP: usize = 1024;

/// Upper bound on requests a single transaction may put in one batch.
pub const MAX_REQS_PER_TX: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TxStatus {
    InProgress,
    MustAbort,
    Committed,
    Aborted,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteMode {
    Update,
    Delete,
    Insert,
}

/// The application-visible object buffer: record header plus value bytes.
/// This is also exactly what the cache stores as an item's value, so cached
/// reads come back with their version attached.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Obj {
    pub hdr: ObjHeader,
    pub value: Vec<u8>,
}

impl Obj {
    pub fn val_size(&self) -> usize {
        self.value.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(OBJ_HEADER_BYTES + self.value.len());
        buf.extend_from_slice(&self.hdr.0.to_le_bytes());
        buf.extend_from_slice(&self.value);
        buf
    }

    pub fn decode(buf: &[u8]) -> CResult<Self> {
        if buf.len() < OBJ_HEADER_BYTES {
            return Err(crate::error::Error::Parse(format!(
                "object buffer truncated: {} bytes",
                buf.len()
            )));
        }
        let mut word = [0u8; OBJ_HEADER_BYTES];
        word.copy_from_slice(&buf[..OBJ_HEADER_BYTES]);
        Ok(Self { hdr: ObjHeader(u64::from_le_bytes(word)), value: buf[OBJ_HEADER_BYTES..].to_vec() })
    }
}

/// One read-set or write-set entry and everything the execute phase learns
/// about it.
#[derive(Clone, Debug)]
pub struct RwSetItem {
    pub key: Key,
    pub keyhash: u64,
    /// Record type; routes the item to its cache and its RPC envelope.
    pub req_type: RpcReqType,
    pub write_mode: WriteMode,
    pub obj: Obj,

    /// True once the item's value is present in the local cache (possibly
    /// from an earlier phase of the same transaction).
    pub is_cached: bool,
    /// Bucket version stamped when the placeholder was inserted.
    pub incarnation: u64,
    /// Directory entry snapshot taken at acquire time (write set only).
    pub dir_entry: DirectoryEntry,
    pub primary_mn: MachineId,
    pub backup_mns: Vec<MachineId>,

    /// Whether the key existed at execute time (read set).
    pub exec_rs_exists: bool,
    /// Record version at execute time, for commit-time validation.
    pub exec_rs_version: u64,
    /// Whether the primary holds our lock, so abort knows to unlock.
    pub exec_ws_locked: bool,
}

impl RwSetItem {
    fn new(key: Key, req_type: RpcReqType, write_mode: WriteMode) -> Self {
        Self {
            key,
            keyhash: cache_keyhash(key),
            req_type,
            write_mode,
            obj: Obj::default(),
            is_cached: false,
            incarnation: 0,
            dir_entry: DirectoryEntry::default(),
            primary_mn: 0,
            backup_mns: Vec::new(),
            exec_rs_exists: false,
            exec_rs_version: 0,
            exec_ws_locked: false,
        }
    }
}

/// A single transaction attempt.
pub struct Tx<'a, R: RpcClient> {
    caller_id: CallerId,
    status: TxStatus,
    pub read_set: Vec<RwSetItem>,
    pub write_set: Vec<RwSetItem>,
    /// Progress cursors so a retried `do_read` resumes where it stopped.
    rs_index: usize,
    ws_index: usize,
    caches: &'a CacheRegistry,
    directory: &'a DirectoryClient,
    mappings: Arc<dyn Mappings>,
    rpc: &'a R,
}

impl<'a, R: RpcClient> Tx<'a, R> {
    pub fn new(
        caller_id: CallerId,
        caches: &'a CacheRegistry,
        directory: &'a DirectoryClient,
        mappings: Arc<dyn Mappings>,
        rpc: &'a R,
    ) -> Self {
        Self {
            caller_id,
            status: TxStatus::InProgress,
            read_set: Vec::new(),
            write_set: Vec::new(),
            rs_index: 0,
            ws_index: 0,
            caches,
            directory,
            mappings,
            rpc,
        }
    }

    pub fn caller_id(&self) -> CallerId {
        self.caller_id
    }

    pub fn status(&self) -> TxStatus {
        self.status
    }

    pub fn add_read(&mut self, key: Key, req_type: RpcReqType) {
        self.read_set.push(RwSetItem::new(key, req_type, WriteMode::Update));
    }

    pub fn add_write(&mut self, key: Key, req_type: RpcReqType, mode: WriteMode) {
        self.write_set.push(RwSetItem::new(key, req_type, mode));
    }
}
