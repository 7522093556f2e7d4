//! Typed client for the round-coordinator and size-filter contracts.
//!
//! The coordinator drives the proving rounds: it hands out the per-round
//! challenge seed, maps sector indices to content identifiers, collects
//! submitted proofs and records the verification outcome. This crate wraps
//! the raw contract ABI into the calls the agents actually make, decoding the
//! ABI-typed returns directly (notably `getVerifyData`'s tuple array).
//!
//! Write methods submit a transaction and wait for its receipt; they never
//! retry on their own; retry policy belongs to the caller.

mod types;

use std::sync::Arc;

use ethers::{
    contract::{abigen, ContractError},
    core::types::{U256, U64},
    middleware::{Middleware, SignerMiddleware},
    providers::{Http, Provider},
    signers::{LocalWallet, Signer},
};

pub use crate::types::{root_hex, PendingProof, Role};
/// Address and transaction-hash types as used across the client surface.
pub use ethers::core::types::{Address, H256};

abigen!(CoordinatorContract, "abi/coordinator.json");
abigen!(SizeFilterContract, "abi/size_filter.json");

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("invalid rpc url: {0}")]
    InvalidUrl(String),

    #[error("invalid hex private key: {0}")]
    InvalidKey(String),

    #[error("invalid contract address: {0}")]
    InvalidAddress(String),

    #[error("failed to encode contract call: {0}")]
    Encode(String),

    #[error("failed to send contract call: {0}")]
    Send(String),

    #[error("contract call timed out")]
    Timeout,

    #[error("execution reverted: {0}")]
    Reverted(String),

    #[error("transaction dropped from the mempool")]
    Dropped,

    #[error("root must be at most 32 bytes, got {0}")]
    InvalidRoot(usize),

    #[error(transparent)]
    Pdp(#[from] primitives_pdp::PdpError),

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

impl RpcError {
    fn from_contract<M: Middleware>(err: ContractError<M>) -> Self {
        if err.is_revert() {
            return RpcError::Reverted(err.to_string());
        }
        match err {
            ContractError::DecodingError(source) => RpcError::Encode(source.to_string()),
            ContractError::DetokenizationError(source) => RpcError::Encode(source.to_string()),
            other => {
                let text = other.to_string();
                if text.contains("timed out") || text.contains("timeout") {
                    RpcError::Timeout
                } else {
                    RpcError::Send(text)
                }
            }
        }
    }
}

/// Everything the agents need from the coordinator, as a seam: the production
/// implementation is [`Client`]; tests drive the agents against in-memory
/// coordinators.
#[async_trait::async_trait]
pub trait Coordinator: Send + Sync {
    /// The submitter address this client signs with.
    fn address(&self) -> Address;

    async fn get_seed(&self) -> Result<String, RpcError>;
    async fn sector_count(&self) -> Result<u64, RpcError>;
    async fn sector_id_at(&self, index: u64) -> Result<String, RpcError>;
    async fn role(&self) -> Result<Role, RpcError>;
    async fn pending_proofs(&self) -> Result<Vec<PendingProof>, RpcError>;
    async fn can_store(&self, cid: &str, size: u64) -> Result<bool, RpcError>;

    async fn set_seed(&self, seed: &str) -> Result<H256, RpcError>;
    async fn record_sector(&self, sid: &str, cids: Vec<String>) -> Result<H256, RpcError>;
    async fn submit_proof(
        &self,
        sid: &str,
        pp: &str,
        proof: &str,
        root_hex32: &str,
        chal: &str,
    ) -> Result<H256, RpcError>;
    async fn close_round(&self) -> Result<H256, RpcError>;
    async fn finalize(&self, winners: Vec<Address>) -> Result<H256, RpcError>;
}

/// Production [`Coordinator`] over an EVM JSON-RPC endpoint.
pub struct Client {
    coordinator: CoordinatorContract<SignerClient>,
    filter: Option<SizeFilterContract<SignerClient>>,
    address: Address,
}

impl Client {
    /// Connects to `url` with the given chain id and hex-encoded private key.
    /// `filter_addr` is the optional size-filter contract consulted by
    /// [`Coordinator::can_store`].
    pub fn connect(
        url: &str,
        chain_id: u64,
        private_key: &str,
        contract_addr: &str,
        filter_addr: Option<&str>,
    ) -> Result<Self, RpcError> {
        let provider =
            Provider::<Http>::try_from(url).map_err(|e| RpcError::InvalidUrl(e.to_string()))?;
        let wallet = private_key
            .parse::<LocalWallet>()
            .map_err(|e| RpcError::InvalidKey(e.to_string()))?
            .with_chain_id(chain_id);
        let address = wallet.address();
        let signer = Arc::new(SignerMiddleware::new(provider, wallet));

        let coordinator = CoordinatorContract::new(parse_address(contract_addr)?, signer.clone());
        let filter = filter_addr
            .map(|addr| Ok::<_, RpcError>(SizeFilterContract::new(parse_address(addr)?, signer.clone())))
            .transpose()?;

        Ok(Self {
            coordinator,
            filter,
            address,
        })
    }

    async fn send(
        &self,
        call: ethers::contract::ContractCall<SignerClient, ()>,
    ) -> Result<H256, RpcError> {
        let pending = call.send().await.map_err(RpcError::from_contract)?;
        let receipt = pending
            .await
            .map_err(|e| RpcError::Send(e.to_string()))?
            .ok_or(RpcError::Dropped)?;
        if receipt.status == Some(U64::zero()) {
            return Err(RpcError::Reverted(format!(
                "transaction {:?} reverted on-chain",
                receipt.transaction_hash
            )));
        }
        Ok(receipt.transaction_hash)
    }
}

fn parse_address(addr: &str) -> Result<Address, RpcError> {
    addr.parse::<Address>()
        .map_err(|e| RpcError::InvalidAddress(format!("{addr}: {e}")))
}

#[async_trait::async_trait]
impl Coordinator for Client {
    fn address(&self) -> Address {
        self.address
    }

    async fn get_seed(&self) -> Result<String, RpcError> {
        self.coordinator
            .get_seed()
            .call()
            .await
            .map_err(RpcError::from_contract)
    }

    async fn sector_count(&self) -> Result<u64, RpcError> {
        let count: U256 = self
            .coordinator
            .get_sids_count()
            .call()
            .await
            .map_err(RpcError::from_contract)?;
        Ok(count.as_u64())
    }

    async fn sector_id_at(&self, index: u64) -> Result<String, RpcError> {
        self.coordinator
            .get_sid_by_index(U256::from(index))
            .call()
            .await
            .map_err(RpcError::from_contract)
    }

    async fn role(&self) -> Result<Role, RpcError> {
        let role: U256 = self
            .coordinator
            .get_sector_role()
            .call()
            .await
            .map_err(RpcError::from_contract)?;
        Ok(if role == U256::one() {
            Role::Builder
        } else {
            Role::Miner
        })
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn pending_proofs(&self) -> Result<Vec<PendingProof>, RpcError> {
        let raw = self
            .coordinator
            .get_verify_data()
            .call()
            .await
            .map_err(RpcError::from_contract)?;

        let mut proofs = Vec::with_capacity(raw.len());
        for (address, pp, root, chal, proof) in raw {
            match PendingProof::decode(address, &pp, &root, &chal, &proof) {
                Ok(pending) => proofs.push(pending),
                // One undecodable submission must not sink the whole batch.
                Err(err) => {
                    tracing::warn!(%err, submitter = %address, "skipping undecodable pending proof")
                }
            }
        }
        Ok(proofs)
    }

    async fn can_store(&self, cid: &str, size: u64) -> Result<bool, RpcError> {
        let Some(filter) = &self.filter else {
            return Ok(true);
        };
        let (known, expected) = filter
            .get_cid_size(cid.to_owned())
            .call()
            .await
            .map_err(RpcError::from_contract)?;
        Ok(known && types::within_admission_band(size, expected.as_u64()))
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn set_seed(&self, seed: &str) -> Result<H256, RpcError> {
        self.send(self.coordinator.set_seed(seed.to_owned())).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(sid = sid, cids = cids.len()))]
    async fn record_sector(&self, sid: &str, cids: Vec<String>) -> Result<H256, RpcError> {
        self.send(self.coordinator.build_sid_cids_map(sid.to_owned(), cids))
            .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(sid = sid))]
    async fn submit_proof(
        &self,
        sid: &str,
        pp: &str,
        proof: &str,
        root_hex32: &str,
        chal: &str,
    ) -> Result<H256, RpcError> {
        self.send(self.coordinator.submit_proof(
            sid.to_owned(),
            pp.to_owned(),
            proof.to_owned(),
            root_hex32.to_owned(),
            chal.to_owned(),
        ))
        .await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn close_round(&self) -> Result<H256, RpcError> {
        self.send(self.coordinator.close_submit()).await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(winners = winners.len()))]
    async fn finalize(&self, winners: Vec<Address>) -> Result<H256, RpcError> {
        self.send(self.coordinator.verify_result(winners)).await
    }
}
