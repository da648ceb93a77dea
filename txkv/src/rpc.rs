//! The RPC collaborator interface.
//!
//! The transaction driver never talks to the network directly. It builds a
//! batch of datastore requests through [`RpcClient`], sends the batch, and
//! suspends until every response is in; the fabric coalesces messages and
//! schedules other transactions on the worker meanwhile. This module
//! defines that seam, the datastore request/response codes the driver
//! forwards, and an in-process [`LoopbackRpc`] used by tests and examples.

use std::collections::HashMap;
use std::future::Future;
use std::io::Cursor;
use std::sync::Mutex;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CResult, Error};
use crate::{CallerId, Key, MachineId};

/// Request-type tag of the RPC envelope: identifies the record type a
/// message concerns, and thereby the cache serving it.
pub type RpcReqType = u8;

/// Position of a request within the current batch.
pub type ReqHandle = usize;

#[derive(Clone, Debug)]
pub struct RpcResponse {
    /// Response type code from the envelope.
    pub resp_type: u16,
    pub payload: Bytes,
}

impl RpcResponse {
    pub fn resp_len(&self) -> usize {
        self.payload.len()
    }
}

/// Batched request transport, one batch per caller. Requests are frozen
/// payloads; responses come back in posting order after `send_reqs`
/// resolves.
pub trait RpcClient: Send + Sync {
    /// Drops any batch state for `caller_id`, starting a fresh batch.
    fn clear_req_batch(&self, caller_id: CallerId);

    /// Appends a request to the caller's batch and returns its handle.
    fn start_new_req(
        &self,
        caller_id: CallerId,
        req_type: RpcReqType,
        target: MachineId,
        req: Bytes,
    ) -> ReqHandle;

    /// Sends the caller's batch. The returned future resolves once every
    /// response has arrived; this is the only point where a transaction
    /// suspends.
    fn send_reqs(&self, caller_id: CallerId) -> impl Future<Output = CResult<()>> + Send;

    /// The response for a previously sent request, if available.
    fn response(&self, caller_id: CallerId, handle: ReqHandle) -> Option<RpcResponse>;
}

/// Datastore operations issued during the execute phase.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DsReqType {
    /// Read a key without locking it.
    GetRdonly = 0,
    /// Read a key and lock it at the primary, for update or delete.
    GetForUpd = 1,
    /// Lock a nonexistent key at the primary, for insert.
    LockForIns = 2,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DsRespType {
    GetRdonlySuccess = 0,
    GetRdonlyNotFound = 1,
    GetRdonlyLocked = 2,
    GetForUpdSuccess = 3,
    GetForUpdNotFound = 4,
    GetForUpdLocked = 5,
    LockForInsSuccess = 6,
    LockForInsExists = 7,
    LockForInsLocked = 8,
}

impl DsRespType {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            0 => DsRespType::GetRdonlySuccess,
            1 => DsRespType::GetRdonlyNotFound,
            2 => DsRespType::GetRdonlyLocked,
            3 => DsRespType::GetForUpdSuccess,
            4 => DsRespType::GetForUpdNotFound,
            5 => DsRespType::GetForUpdLocked,
            6 => DsRespType::LockForInsSuccess,
            7 => DsRespType::LockForInsExists,
            8 => DsRespType::LockForInsLocked,
            _ => return None,
        })
    }
}

/// Record header preceding the value in datastore responses: the primary's
/// lock flag in the top bit, the record version below it.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ObjHeader(pub u64);

pub const OBJ_HEADER_BYTES: usize = 8;

impl ObjHeader {
    pub fn new(locked: bool, version: u64) -> Self {
        debug_assert!(version < 1u64 << 63);
        Self(((locked as u64) << 63) | version)
    }

    pub fn locked(&self) -> bool {
        self.0 >> 63 == 1
    }

    pub fn version(&self) -> u64 {
        self.0 & !(1u64 << 63)
    }
}

/// Wire size of a datastore get/lock request.
pub const DS_GET_REQ_BYTES: usize = 24;

/// Builds the generic get/lock request the execute phase sends for every
/// uncached item: `u16` op, two pad bytes, `u32` caller id, then the
/// 8-aligned keyhash and the key.
pub fn forge_get_req(caller_id: CallerId, key: Key, keyhash: u64, req_type: DsReqType) -> Bytes {
    let mut buf = BytesMut::with_capacity(DS_GET_REQ_BYTES);
    buf.put_u16_le(req_type as u16);
    buf.put_u16_le(0);
    buf.put_u32_le(caller_id);
    buf.put_u64_le(keyhash);
    buf.put_u64_le(key);
    buf.freeze()
}

/// Decoded form of [`forge_get_req`]'s frame, for the serving side.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DsGetReq {
    pub req_type: DsReqType,
    pub caller_id: CallerId,
    pub keyhash: u64,
    pub key: Key,
}

impl DsGetReq {
    pub fn decode(buf: &[u8]) -> CResult<Self> {
        if buf.len() < DS_GET_REQ_BYTES {
            return Err(Error::Parse(format!("get request truncated: {} bytes", buf.len())));
        }
        let mut cursor = Cursor::new(buf);
        let raw = cursor.read_u16::<LittleEndian>().map_err(parse_err)?;
        let req_type = match raw {
            0 => DsReqType::GetRdonly,
            1 => DsReqType::GetForUpd,
            2 => DsReqType::LockForIns,
            other => return Err(Error::Parse(format!("unknown datastore request type {}", other))),
        };
        let _pad = cursor.read_u16::<LittleEndian>().map_err(parse_err)?;
        let caller_id = cursor.read_u32::<LittleEndian>().map_err(parse_err)?;
        let keyhash = cursor.read_u64::<LittleEndian>().map_err(parse_err)?;
        let key = cursor.read_u64::<LittleEndian>().map_err(parse_err)?;
        Ok(Self { req_type, caller_id, keyhash, key })
    }
}

fn parse_err(err: std::io::Error) -> Error {
    Error::Parse(err.to_string())
}

/// In-process transport. Batched requests are answered synchronously by a
/// responder closure when the batch is sent, after yielding once to the
/// scheduler so other tasks on the worker make progress, mirroring the
/// suspension a real fabric imposes.
pub struct LoopbackRpc {
    responder: Box<dyn Fn(MachineId, RpcReqType, &[u8]) -> RpcResponse + Send + Sync>,
    batches: Mutex<HashMap<CallerId, Batch>>,
}

#[derive(Default)]
struct Batch {
    requests: Vec<(RpcReqType, MachineId, Bytes)>,
    responses: Vec<Option<RpcResponse>>,
}

impl LoopbackRpc {
    pub fn new(
        responder: impl Fn(MachineId, RpcReqType, &[u8]) -> RpcResponse + Send + Sync + 'static,
    ) -> Self {
        Self { responder: Box::new(responder), batches: Mutex::new(HashMap::new()) }
    }
}

impl RpcClient for LoopbackRpc {
    fn clear_req_batch(&self, caller_id: CallerId) {
        self.batches.lock().expect("rpc batches poisoned").insert(caller_id, Batch::default());
    }

    fn start_new_req(
        &self,
        caller_id: CallerId,
        req_type: RpcReqType,
        target: MachineId,
        req: Bytes,
    ) -> ReqHandle {
        let mut batches = self.batches.lock().expect("rpc batches poisoned");
        let batch = batches.entry(caller_id).or_default();
        batch.requests.push((req_type, target, req));
        batch.requests.len() - 1
    }

    fn send_reqs(&self, caller_id: CallerId) -> impl Future<Output = CResult<()>> + Send {
        async move {
            tokio::task::yield_now().await;
            let mut batches = self.batches.lock().expect("rpc batches poisoned");
            let batch = batches
                .get_mut(&caller_id)
                .ok_or_else(|| Error::Internal(format!("no batch for caller {}", caller_id)))?;
            batch.responses = batch
                .requests
                .iter()
                .map(|(req_type, target, req)| Some((self.responder)(*target, *req_type, req)))
                .collect();
            Ok(())
        }
    }

    fn response(&self, caller_id: CallerId, handle: ReqHandle) -> Option<RpcResponse> {
        let batches = self.batches.lock().expect("rpc batches poisoned");
        batches.get(&caller_id)?.responses.get(handle)?.clone()
    }
}
