use ethers::core::types::Address;
use primitives_pdp::{Chal, Proof, PublicParams};

use crate::RpcError;

/// Which agent mode the coordinator expects from this account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Builder,
    Miner,
}

/// One submitted proof awaiting verification, decoded from the coordinator's
/// `getVerifyData` tuple.
#[derive(Debug, Clone)]
pub struct PendingProof {
    pub address: Address,
    pub pp: PublicParams,
    pub root: [u8; 32],
    pub chal: Chal,
    /// Segment index the submitter claims to have proven, recovered from the
    /// challenge encoding.
    pub idx: u64,
    pub proof: Proof,
}

impl PendingProof {
    pub(crate) fn decode(
        address: Address,
        pp: &str,
        root_hex: &str,
        chal: &str,
        proof: &str,
    ) -> Result<Self, RpcError> {
        let pp = PublicParams::parse(pp)?;
        let root_bytes = hex::decode(root_hex)?;
        if root_bytes.len() != 32 {
            return Err(RpcError::InvalidRoot(root_bytes.len()));
        }
        let mut root = [0u8; 32];
        root.copy_from_slice(&root_bytes);
        let chal = Chal::parse(chal)?;
        let idx = chal.index() as u64;
        let proof = Proof::parse(proof)?;
        Ok(Self {
            address,
            pp,
            root,
            chal,
            idx,
            proof,
        })
    }
}

/// Hex form of a merkle root as the coordinator expects it: the digest is
/// right-aligned into 32 bytes (an identity for SHA-256 digests, kept for
/// wire compatibility) and hex-encoded lowercase.
pub fn root_hex(root: &[u8]) -> Result<String, RpcError> {
    if root.len() > 32 {
        return Err(RpcError::InvalidRoot(root.len()));
    }
    let mut padded = [0u8; 32];
    padded[32 - root.len()..].copy_from_slice(root);
    Ok(hex::encode(padded))
}

/// The coordinator only admits a block whose on-disk size sits within 5% of
/// the size it expects for that content id.
pub(crate) fn within_admission_band(size: u64, expected: u64) -> bool {
    let size = size as u128;
    let expected = expected as u128;
    size * 20 >= expected * 19 && size * 20 <= expected * 21
}
