use std::sync::Arc;

use crate::cache::{Cache, CacheResult};
use crate::directory::{DirectoryEntry, DirectoryResult};
use crate::error::{CResult, Error};
use crate::rpc::{
    forge_get_req, DsReqType, DsRespType, ObjHeader, ReqHandle, RpcClient, RpcResponse,
    OBJ_HEADER_BYTES,
};
use crate::tx::{RwSetItem, Tx, TxStatus, WriteMode, MAX_REQS_PER_TX, OBJ_VALUE_CAP};

impl<'a, R: RpcClient> Tx<'a, R> {
    fn cache_for(&self, item: &RwSetItem) -> Arc<Cache> {
        // A record type without a cache is a wiring bug, not a runtime
        // condition.
        self.caches
            .get(item.req_type)
            .unwrap_or_else(|| panic!("no cache registered for request type {}", item.req_type))
    }

    /// Phase one of the read path: for every uncached item, reserve a cache
    /// placeholder and register with the directory, so that by the time the
    /// value arrives we both have a slot for it and are guaranteed to hear
    /// about future invalidations. Write-set items acquire ownership
    /// instead of registering as accessors: no other machine may write the
    /// key until we release, though they can ask us to through the cache
    /// invalidation path.
    ///
    /// Runs to completion without suspending.
    pub(crate) fn prepare_tx(&mut self) -> TxStatus {
        for i in self.rs_index..self.read_set.len() {
            if self.read_set[i].is_cached {
                continue; // already read
            }
            let cache = self.cache_for(&self.read_set[i]);
            let item = &mut self.read_set[i];

            let mut version = 0;
            match cache.placeholder(
                self.caller_id,
                item.keyhash,
                &item.key.to_le_bytes(),
                OBJ_HEADER_BYTES + OBJ_VALUE_CAP,
                &mut version,
            ) {
                CacheResult::Success => item.incarnation = version,
                // Someone else holds the entry; stamp the current version so
                // our finalize only lands if nothing moves in between.
                CacheResult::Exists => item.incarnation = cache.version(item.keyhash),
                _ => return TxStatus::MustAbort,
            }

            let mut dir_entry = DirectoryEntry::default();
            if self.directory.lookup(item.key, &mut dir_entry) != DirectoryResult::Success {
                // Item is being updated elsewhere.
                return TxStatus::MustAbort;
            }
            let primary = self.mappings.primary_mn(item.keyhash);
            item.primary_mn = primary;
            item.backup_mns = (0..self.mappings.num_backups())
                .map(|b| self.mappings.backup_mn_from_primary(primary, b))
                .collect();
        }

        for i in self.ws_index..self.write_set.len() {
            if self.write_set[i].is_cached {
                continue;
            }
            let cache = self.cache_for(&self.write_set[i]);
            let item = &mut self.write_set[i];

            let mut version = 0;
            match cache.placeholder(
                self.caller_id,
                item.keyhash,
                &item.key.to_le_bytes(),
                OBJ_HEADER_BYTES + OBJ_VALUE_CAP,
                &mut version,
            ) {
                CacheResult::Success => item.incarnation = version,
                CacheResult::Exists => item.incarnation = cache.version(item.keyhash),
                _ => return TxStatus::MustAbort,
            }

            let mut dir_entry = DirectoryEntry::default();
            if self.directory.acquire(item.key, &mut dir_entry) != DirectoryResult::Success {
                return TxStatus::MustAbort;
            }
            item.dir_entry = dir_entry;
            let primary = self.mappings.primary_mn(item.keyhash);
            item.primary_mn = primary;
            item.backup_mns = (0..self.mappings.num_backups())
                .map(|b| self.mappings.backup_mn_from_primary(primary, b))
                .collect();
        }

        // Placeholders for items sharing a bucket bump each other's stamped
        // versions, so take the final stamp once the whole set is reserved.
        // An invalidation or displacement before this point wiped the
        // reservation and turns into NotFound at finalize time; one after
        // this point fails the version check. Either way nothing stale is
        // installed.
        for i in self.rs_index..self.read_set.len() {
            if !self.read_set[i].is_cached {
                let cache = self.cache_for(&self.read_set[i]);
                let item = &mut self.read_set[i];
                item.incarnation = cache.version(item.keyhash);
            }
        }
        for i in self.ws_index..self.write_set.len() {
            if !self.write_set[i].is_cached {
                let cache = self.cache_for(&self.write_set[i]);
                let item = &mut self.write_set[i];
                item.incarnation = cache.version(item.keyhash);
            }
        }

        TxStatus::InProgress
    }

    /// Phase two of the read path: fetch every uncached read-set item
    /// (`get_rdonly`) and write-set item (`get_for_upd`, or `lock_for_ins`
    /// for inserts) from its primary in one batch, suspend until the batch
    /// completes, then reconcile responses in posting order. On return the
    /// status is either still `InProgress` or `MustAbort`; the commit/abort
    /// machinery releases whatever was locked either way.
    pub async fn do_read(&mut self) -> CResult<TxStatus> {
        debug_assert_eq!(self.status, TxStatus::InProgress);
        debug_assert!(self.read_set.len() + self.write_set.len() <= MAX_REQS_PER_TX);

        self.status = self.prepare_tx();
        if self.status == TxStatus::MustAbort {
            return Ok(self.status);
        }

        self.rpc.clear_req_batch(self.caller_id);
        let mut handles: Vec<ReqHandle> =
            Vec::with_capacity(self.read_set.len() + self.write_set.len());

        for item in &self.read_set[self.rs_index..] {
            if item.is_cached {
                continue;
            }
            let req = forge_get_req(self.caller_id, item.key, item.keyhash, DsReqType::GetRdonly);
            handles.push(self.rpc.start_new_req(self.caller_id, item.req_type, item.primary_mn, req));
        }

        for item in &self.write_set[self.ws_index..] {
            if item.is_cached {
                continue;
            }
            // Updates and deletes read-and-lock the live record; inserts
            // lock its absence.
            let op = if item.write_mode == WriteMode::Insert {
                DsReqType::LockForIns
            } else {
                DsReqType::GetForUpd
            };
            let req = forge_get_req(self.caller_id, item.key, item.keyhash, op);
            handles.push(self.rpc.start_new_req(self.caller_id, item.req_type, item.primary_mn, req));
        }

        if !handles.is_empty() {
            self.rpc.send_reqs(self.caller_id).await?;
        }

        let mut next_handle = 0;
        self.reconcile_read_set(&handles, &mut next_handle)?;
        self.reconcile_write_set(&handles, &mut next_handle)?;

        self.rs_index = self.read_set.len();
        self.ws_index = self.write_set.len();

        debug_assert!(matches!(self.status, TxStatus::InProgress | TxStatus::MustAbort));
        Ok(self.status)
    }

    fn take_response(&self, handles: &[ReqHandle], next_handle: &mut usize) -> CResult<RpcResponse> {
        let handle = handles[*next_handle];
        *next_handle += 1;
        self.rpc
            .response(self.caller_id, handle)
            .ok_or_else(|| Error::Internal(format!("no response for request {}", handle)))
    }

    fn reconcile_read_set(&mut self, handles: &[ReqHandle], next_handle: &mut usize) -> CResult<()> {
        for i in self.rs_index..self.read_set.len() {
            if self.read_set[i].is_cached {
                continue; // already served from cache, no response to consume
            }
            let resp = self.take_response(handles, next_handle)?;
            let resp_type = DsRespType::from_u16(resp.resp_type).ok_or_else(|| {
                Error::Internal(format!(
                    "unknown response type {} for read-set key {}",
                    resp.resp_type, self.read_set[i].key
                ))
            })?;

            match resp_type {
                DsRespType::GetRdonlySuccess => {
                    if resp.resp_len() < OBJ_HEADER_BYTES {
                        return Err(Error::Internal("short get_rdonly response".to_string()));
                    }
                    let hdr = header_of(&resp);
                    let caller_id = self.caller_id;
                    let cache = self.cache_for(&self.read_set[i]);
                    let item = &mut self.read_set[i];
                    item.obj.hdr = hdr;
                    item.obj.value.clear();
                    item.obj.value.extend_from_slice(&resp.payload[OBJ_HEADER_BYTES..]);
                    item.exec_rs_exists = true;
                    item.exec_rs_version = hdr.version();

                    // Install the fetched object into the placeholder. A
                    // failure just means the entry was displaced or raced;
                    // the transaction itself already has its bytes.
                    let result = cache.prepare_read(
                        caller_id,
                        item.keyhash,
                        &item.key.to_le_bytes(),
                        &resp.payload,
                        item.incarnation,
                        false,
                    );
                    if !matches!(result, CacheResult::Success | CacheResult::Exists) {
                        log::debug!("read finalize for key {} skipped: {}", item.key, result);
                    } else {
                        item.is_cached = true;
                    }
                }
                DsRespType::GetRdonlyNotFound => {
                    // A missing read-only key does not abort the
                    // transaction; record its absence for validation. The
                    // placeholder stays behind; a later transaction will
                    // finalize or displace it.
                    debug_assert_eq!(resp.resp_len(), OBJ_HEADER_BYTES);
                    let hdr = header_of(&resp);
                    let item = &mut self.read_set[i];
                    item.obj.hdr = hdr;
                    item.obj.value.clear();
                    item.exec_rs_exists = false;
                    item.exec_rs_version = hdr.version();
                }
                DsRespType::GetRdonlyLocked => {
                    debug_assert_eq!(resp.resp_len(), 0);
                    self.status = TxStatus::MustAbort;
                }
                other => {
                    return Err(Error::Internal(format!(
                        "response type {:?} for read-set key {}",
                        other, self.read_set[i].key
                    )))
                }
            }
        }
        Ok(())
    }

    fn reconcile_write_set(&mut self, handles: &[ReqHandle], next_handle: &mut usize) -> CResult<()> {
        for i in self.ws_index..self.write_set.len() {
            if self.write_set[i].is_cached {
                // No request was posted; just re-take the bucket lock so
                // write-write conflicts stay blocked until commit/abort.
                let caller_id = self.caller_id;
                let cache = self.cache_for(&self.write_set[i]);
                let item = &mut self.write_set[i];
                let deleted = item.write_mode == WriteMode::Delete;
                let result = cache.prepare_write(
                    caller_id,
                    item.keyhash,
                    &item.key.to_le_bytes(),
                    &item.obj.encode(),
                    item.incarnation,
                    deleted,
                );
                match result {
                    CacheResult::Success | CacheResult::Exists => {}
                    CacheResult::NotFound | CacheResult::InsufficientSpace => {
                        self.status = TxStatus::MustAbort;
                    }
                    _ => {}
                }
                continue;
            }

            let resp = self.take_response(handles, next_handle)?;
            let resp_type = DsRespType::from_u16(resp.resp_type).ok_or_else(|| {
                Error::Internal(format!(
                    "unknown response type {} for write-set key {}",
                    resp.resp_type, self.write_set[i].key
                ))
            })?;

            if self.write_set[i].write_mode != WriteMode::Insert {
                match resp_type {
                    DsRespType::GetForUpdSuccess => {
                        if resp.resp_len() < OBJ_HEADER_BYTES {
                            return Err(Error::Internal("short get_for_upd response".to_string()));
                        }
                        let hdr = header_of(&resp);
                        debug_assert!(hdr.locked());

                        let caller_id = self.caller_id;
                        let cache = self.cache_for(&self.write_set[i]);
                        let item = &mut self.write_set[i];
                        item.obj.hdr = hdr;
                        item.obj.value.clear();
                        item.obj.value.extend_from_slice(&resp.payload[OBJ_HEADER_BYTES..]);
                        item.exec_ws_locked = true; // unlock on abort

                        // Install the value but leave the bucket locked so
                        // write-write conflicts are blocked until
                        // commit/abort. If a finalized entry already exists
                        // this just takes the lock.
                        let result = cache.prepare_write(
                            caller_id,
                            item.keyhash,
                            &item.key.to_le_bytes(),
                            &resp.payload,
                            item.incarnation,
                            item.write_mode == WriteMode::Delete,
                        );
                        match result {
                            CacheResult::Success | CacheResult::Exists => item.is_cached = true,
                            CacheResult::NotFound | CacheResult::InsufficientSpace => {
                                self.status = TxStatus::MustAbort;
                            }
                            _ => {}
                        }
                    }
                    DsRespType::GetForUpdNotFound | DsRespType::GetForUpdLocked => {
                        debug_assert_eq!(resp.resp_len(), 0);
                        self.write_set[i].exec_ws_locked = false; // nothing to unlock on abort
                        self.status = TxStatus::MustAbort;
                    }
                    other => {
                        return Err(Error::Internal(format!(
                            "response type {:?} for write-set key {}",
                            other, self.write_set[i].key
                        )))
                    }
                }
            } else {
                match resp_type {
                    DsRespType::LockForInsSuccess => {
                        // Just the header: the record does not exist yet.
                        debug_assert_eq!(resp.resp_len(), OBJ_HEADER_BYTES);
                        let hdr = header_of(&resp);
                        debug_assert!(hdr.locked());

                        let caller_id = self.caller_id;
                        let cache = self.cache_for(&self.write_set[i]);
                        let item = &mut self.write_set[i];
                        item.obj.hdr = hdr;
                        item.obj.value.clear();
                        item.exec_ws_locked = true;

                        let result = cache.prepare_write(
                            caller_id,
                            item.keyhash,
                            &item.key.to_le_bytes(),
                            &resp.payload,
                            item.incarnation,
                            false,
                        );
                        match result {
                            CacheResult::Success => item.is_cached = true,
                            CacheResult::Exists => {
                                // A concurrent insert beat us into the
                                // cache; drop the bucket lock and abort.
                                cache.abort_write(caller_id, item.keyhash);
                                self.status = TxStatus::MustAbort;
                            }
                            CacheResult::NotFound | CacheResult::InsufficientSpace => {
                                self.status = TxStatus::MustAbort;
                            }
                            _ => {}
                        }
                    }
                    DsRespType::LockForInsExists | DsRespType::LockForInsLocked => {
                        debug_assert_eq!(resp.resp_len(), 0);
                        self.write_set[i].exec_ws_locked = false;
                        self.status = TxStatus::MustAbort;
                    }
                    other => {
                        return Err(Error::Internal(format!(
                            "response type {:?} for write-set key {}",
                            other, self.write_set[i].key
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}

fn header_of(resp: &RpcResponse) -> ObjHeader {
    let mut word = [0u8; OBJ_HEADER_BYTES];
    word.copy_from_slice(&resp.payload[..OBJ_HEADER_BYTES]);
    ObjHeader(u64::from_le_bytes(word))
}
