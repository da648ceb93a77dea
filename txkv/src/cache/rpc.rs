//! Coherence requests the cache answers over the RPC fabric.
//!
//! A cache processes exactly one kind of request: invalidations sent by
//! remote writers that just acquired ownership of a key. The request is a
//! fixed 24-byte frame so it packs densely into coalesced RPC batches.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};

use crate::cache::{Cache, CacheResult};
use crate::error::{CResult, Error};
use crate::keyhash::cache_keyhash;
use crate::{CallerId, Key};

/// Wire size of an invalidation request.
pub const INVAL_REQ_BYTES: usize = 24;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheReqType {
    Inval = 0,
    /// Read the value back to the requester, then invalidate. Decoded but
    /// not supported; the handler answers with the failure code.
    ReadAndInval = 1,
}

/// Carried back in the coalesced response header; invalidation responses
/// have no body.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CacheRespType {
    InvalSuccess = 0,
    InvalFailure = 1,
    ReadAndInvalSuccess = 2,
    ReadAndInvalFailure = 3,
}

/// An invalidation request. On the wire: `u32` pad (keeps the frame a
/// multiple of 8 bytes), `u32` caller id, one `u64` packing the request type
/// into the low two bits with the 62-bit keyhash above, and the `u64` key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheInvalReq {
    pub caller_id: CallerId,
    pub req_type: CacheReqType,
    pub keyhash: u64,
    pub key: Key,
}

impl CacheInvalReq {
    pub fn decode(buf: &[u8]) -> CResult<Self> {
        if buf.len() < INVAL_REQ_BYTES {
            return Err(Error::Parse(format!(
                "invalidation request truncated: {} bytes",
                buf.len()
            )));
        }
        let mut cursor = Cursor::new(buf);
        let _pad = cursor.read_u32::<LittleEndian>().map_err(from_io)?;
        let caller_id = cursor.read_u32::<LittleEndian>().map_err(from_io)?;
        let packed = cursor.read_u64::<LittleEndian>().map_err(from_io)?;
        let key = cursor.read_u64::<LittleEndian>().map_err(from_io)?;
        let req_type = match packed & 3 {
            0 => CacheReqType::Inval,
            1 => CacheReqType::ReadAndInval,
            other => return Err(Error::Parse(format!("unknown cache request type {}", other))),
        };
        Ok(Self { caller_id, req_type, keyhash: packed >> 2, key })
    }
}

fn from_io(err: std::io::Error) -> Error {
    Error::Parse(err.to_string())
}

/// Builds the request frame for invalidating `key` on a remote cache.
pub fn forge_inval_req(caller_id: CallerId, key: Key, req_type: CacheReqType) -> Bytes {
    debug_assert!(matches!(req_type, CacheReqType::Inval));
    let keyhash = cache_keyhash(key);
    let mut buf = BytesMut::with_capacity(INVAL_REQ_BYTES);
    buf.put_u32_le(0);
    buf.put_u32_le(caller_id);
    buf.put_u64_le((req_type as u64) | (keyhash << 2));
    buf.put_u64_le(key);
    buf.freeze()
}

/// Cache-side dispatch for a coherence request. Returns the response type to
/// place in the RPC envelope.
pub fn handle_cache_req(cache: &Cache, req_buf: &[u8]) -> CResult<CacheRespType> {
    let req = CacheInvalReq::decode(req_buf)?;
    match req.req_type {
        CacheReqType::Inval => match cache.invalidate(req.caller_id, req.keyhash) {
            CacheResult::Success => Ok(CacheRespType::InvalSuccess),
            // Bucket contended; the requester retries.
            other => {
                log::debug!("invalidation of keyhash {:#x} returned {}", req.keyhash, other);
                Ok(CacheRespType::InvalFailure)
            }
        },
        CacheReqType::ReadAndInval => {
            log::warn!("read_and_inval is not supported");
            Ok(CacheRespType::ReadAndInvalFailure)
        }
    }
}
