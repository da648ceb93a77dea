use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use txkv::cache::pool::PoolKind;
use txkv::cache::{Cache, CacheRegistry, CacheResult};
use txkv::config::{AllocConfig, CacheConfig, PoolConfig, TableConfig};
use txkv::directory::{directory_size, DirectoryClient, SharedRegion};
use txkv::error::Error;
use txkv::keyhash::cache_keyhash;
use txkv::mappings::{Mappings, StaticMappings};
use txkv::rpc::{DsGetReq, DsReqType, DsRespType, LoopbackRpc, ObjHeader, RpcResponse};
use txkv::tx::{Obj, Tx, TxStatus, WriteMode};
use txkv::MachineId;

const REQ_TYPE: u8 = 1;
const NUM_MACHINES: u32 = 2;
const DIR_ENTRIES: u64 = 4096;

#[tokio::main]
async fn main() {
    println!("Hello, txkv!");

    run().await.unwrap();

    println!("Bye~");
}

/// Two "machines" in one process: a shared directory region, one cache per
/// machine, and a loopback RPC to a toy datastore holding the records.
async fn run() -> Result<(), Error> {
    let fabric = Arc::new(SharedRegion::new(&[0, 1], directory_size(DIR_ENTRIES)));

    // The authoritative records, keyed by (primary machine, key).
    let store: Arc<Mutex<HashMap<(MachineId, u64), Vec<u8>>>> = Arc::default();
    let m0 = machine(0, fabric.clone(), store.clone())?;
    let m1 = machine(1, fabric.clone(), store.clone())?;
    let primary = m0.mappings.primary_mn(cache_keyhash(7));
    store.lock().unwrap().insert((primary, 7), b"seven".to_vec());

    // A cold read on machine 0 pulls the value from its primary and caches
    // it; the directory records machine 0 as an accessor.
    let mut tx = Tx::new(1, &m0.caches, &m0.directory, m0.mappings.clone(), &m0.rpc);
    tx.add_read(7, REQ_TYPE);
    assert_eq!(tx.do_read().await?, TxStatus::InProgress);
    println!("m0 read key 7: {:?}", String::from_utf8_lossy(&tx.read_set[0].obj.value));

    // The value is now served locally.
    let cache = m0.caches.get(REQ_TYPE).unwrap();
    let mut buf = [0u8; 256];
    let (mut len, mut version) = (0, 0);
    let result =
        cache.get(cache_keyhash(7), &7u64.to_le_bytes(), &mut buf, &mut len, &mut version, false);
    assert_eq!(result, CacheResult::Success);
    let obj = Obj::decode(&buf[..len])?;
    println!("m0 cache hit for key 7: {:?}", String::from_utf8_lossy(&obj.value));

    // Machine 1 takes ownership of key 7 for a write; machine 0's attempt
    // to do the same must abort.
    let mut writer = Tx::new(1, &m1.caches, &m1.directory, m1.mappings.clone(), &m1.rpc);
    writer.add_write(7, REQ_TYPE, WriteMode::Update);
    assert_eq!(writer.do_read().await?, TxStatus::InProgress);
    println!("m1 owns key 7 for writing");

    let mut loser = Tx::new(2, &m0.caches, &m0.directory, m0.mappings.clone(), &m0.rpc);
    loser.add_write(7, REQ_TYPE, WriteMode::Update);
    assert_eq!(loser.do_read().await?, TxStatus::MustAbort);
    println!("m0 write raced the owner and aborted");

    // Release machine 1's bucket lock the way the commit path would.
    m1.caches.get(REQ_TYPE).unwrap().abort_write(1, cache_keyhash(7));

    Ok(())
}

struct Machine {
    mappings: Arc<StaticMappings>,
    caches: CacheRegistry,
    directory: DirectoryClient,
    rpc: LoopbackRpc,
}

fn machine(
    id: MachineId,
    fabric: Arc<SharedRegion>,
    store: Arc<Mutex<HashMap<(MachineId, u64), Vec<u8>>>>,
) -> Result<Machine, Error> {
    let mappings = Arc::new(StaticMappings {
        machine_id: id,
        num_machines: NUM_MACHINES,
        num_backups: 1,
        directory_entries: DIR_ENTRIES,
    });

    let config = CacheConfig {
        alloc: AllocConfig { size: 1 << 20 },
        pool: PoolConfig { kind: PoolKind::CircularLog, size: 1 << 20 },
        table: TableConfig { buckets: 256, concurrent_read: true, concurrent_write: true },
    };
    let cache = Arc::new(Cache::from_config(
        &config,
        Box::new(|key, value| {
            println!("evicted modified entry {:?} = {:?}", key, value);
        }),
    )?);
    let mut caches = CacheRegistry::new();
    caches.register(REQ_TYPE, cache);

    let directory = DirectoryClient::new(mappings.clone(), fabric);

    // The datastore side: get_rdonly and get_for_upd serve the stored
    // record, lock_for_ins locks its absence.
    let rpc = LoopbackRpc::new(move |target, _req_type, req_buf| {
        let req = DsGetReq::decode(req_buf).expect("malformed datastore request");
        let store = store.lock().unwrap();
        let record = store.get(&(target, req.key));
        let (resp_type, payload) = match (req.req_type, record) {
            (DsReqType::GetRdonly, Some(value)) => (
                DsRespType::GetRdonlySuccess,
                Obj { hdr: ObjHeader::new(false, 1), value: value.clone() }.encode(),
            ),
            (DsReqType::GetRdonly, None) => (
                DsRespType::GetRdonlyNotFound,
                Obj { hdr: ObjHeader::new(false, 0), value: Vec::new() }.encode(),
            ),
            (DsReqType::GetForUpd, Some(value)) => (
                DsRespType::GetForUpdSuccess,
                Obj { hdr: ObjHeader::new(true, 1), value: value.clone() }.encode(),
            ),
            (DsReqType::GetForUpd, None) => (DsRespType::GetForUpdNotFound, Vec::new()),
            (DsReqType::LockForIns, Some(_)) => (DsRespType::LockForInsExists, Vec::new()),
            (DsReqType::LockForIns, None) => (
                DsRespType::LockForInsSuccess,
                Obj { hdr: ObjHeader::new(true, 0), value: Vec::new() }.encode(),
            ),
        };
        RpcResponse { resp_type: resp_type as u16, payload: Bytes::from(payload) }
    });

    Ok(Machine { mappings, caches, directory, rpc })
}
