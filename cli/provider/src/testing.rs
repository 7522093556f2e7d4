//! In-memory coordinator and fixture helpers shared by the agent tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use cid::Cid;
use contractext::{Address, Coordinator, PendingProof, Role, RpcError, H256};
use sha2::{Digest, Sha256};

/// A deterministic, well-formed cid string derived from `seed`.
pub(crate) fn fake_cid(seed: &[u8]) -> String {
    let digest = Sha256::digest(seed);
    let mh = cid::multihash::Multihash::<64>::wrap(0x12, &digest).expect("sha256 digest fits");
    Cid::new_v1(0x55, mh).to_string()
}

/// Writes `bytes` into `mount` the way flatfs lays blocks out
/// (`<shard>/<base32-upper-stem>.data`), returning the canonical cid string.
pub(crate) fn flatfs_block(mount: &std::path::Path, seed: &[u8], bytes: &[u8]) -> String {
    let digest = Sha256::digest(seed);
    let mh = cid::multihash::Multihash::<64>::wrap(0x12, &digest).expect("sha256 digest fits");
    let cid = Cid::new_v1(0x55, mh);

    let encoded = multibase::encode(multibase::Base::Base32Upper, cid.to_bytes());
    let stem = encoded.strip_prefix('B').expect("multibase prefix");
    let shard = &stem[stem.len() - 3..stem.len() - 1];

    let shard_dir = mount.join(shard);
    std::fs::create_dir_all(&shard_dir).expect("shard dir");
    std::fs::write(shard_dir.join(format!("{stem}.data")), bytes).expect("block file");
    cid.to_string()
}

#[derive(Debug, Clone)]
pub(crate) enum Event {
    SetSeed(String),
    RecordSector {
        sid: String,
        cids: Vec<String>,
    },
    SubmitProof {
        sid: String,
        pp: String,
        proof: String,
        root_hex: String,
        chal: String,
    },
    CloseRound,
    Finalize(Vec<Address>),
}

/// Scriptable [`Coordinator`] double.
pub(crate) struct MockCoordinator {
    pub address: Address,
    pub seed: String,
    pub role: Role,
    pub sids: Mutex<Vec<String>>,
    pub pending: Mutex<Vec<PendingProof>>,
    rejected: Mutex<HashSet<String>>,
    fail_writes: AtomicBool,
    events: Mutex<Vec<Event>>,
}

impl MockCoordinator {
    pub fn new() -> Self {
        Self {
            address: Address::repeat_byte(0x42),
            seed: "round-seed".to_owned(),
            role: Role::Miner,
            sids: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            fail_writes: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn reject(&self, cid: &str) {
        self.rejected
            .lock()
            .expect("mock lock poisoned")
            .insert(cid.to_owned());
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("mock lock poisoned").clone()
    }

    fn record(&self, event: Event) -> Result<H256, RpcError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RpcError::Send("mock coordinator refused the write".into()));
        }
        self.events.lock().expect("mock lock poisoned").push(event);
        Ok(H256::zero())
    }
}

#[async_trait::async_trait]
impl Coordinator for MockCoordinator {
    fn address(&self) -> Address {
        self.address
    }

    async fn get_seed(&self) -> Result<String, RpcError> {
        Ok(self.seed.clone())
    }

    async fn sector_count(&self) -> Result<u64, RpcError> {
        Ok(self.sids.lock().expect("mock lock poisoned").len() as u64)
    }

    async fn sector_id_at(&self, index: u64) -> Result<String, RpcError> {
        self.sids
            .lock()
            .expect("mock lock poisoned")
            .get(index as usize)
            .cloned()
            .ok_or_else(|| RpcError::Send(format!("no sector at index {index}")))
    }

    async fn role(&self) -> Result<Role, RpcError> {
        Ok(self.role)
    }

    async fn pending_proofs(&self) -> Result<Vec<PendingProof>, RpcError> {
        Ok(self.pending.lock().expect("mock lock poisoned").clone())
    }

    async fn can_store(&self, cid: &str, _size: u64) -> Result<bool, RpcError> {
        Ok(!self
            .rejected
            .lock()
            .expect("mock lock poisoned")
            .contains(cid))
    }

    async fn set_seed(&self, seed: &str) -> Result<H256, RpcError> {
        self.record(Event::SetSeed(seed.to_owned()))
    }

    async fn record_sector(&self, sid: &str, cids: Vec<String>) -> Result<H256, RpcError> {
        self.record(Event::RecordSector {
            sid: sid.to_owned(),
            cids,
        })
    }

    async fn submit_proof(
        &self,
        sid: &str,
        pp: &str,
        proof: &str,
        root_hex32: &str,
        chal: &str,
    ) -> Result<H256, RpcError> {
        self.record(Event::SubmitProof {
            sid: sid.to_owned(),
            pp: pp.to_owned(),
            proof: proof.to_owned(),
            root_hex: root_hex32.to_owned(),
            chal: chal.to_owned(),
        })
    }

    async fn close_round(&self) -> Result<H256, RpcError> {
        self.record(Event::CloseRound)
    }

    async fn finalize(&self, winners: Vec<Address>) -> Result<H256, RpcError> {
        self.record(Event::Finalize(winners))
    }
}
