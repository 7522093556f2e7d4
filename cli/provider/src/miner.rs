//! The Miner agent: proves possession of one assigned sector per round.
//!
//! The round cursor names the next sector index to prove. A step downloads
//! that sector, answers the round seed's challenge for *every* segment, and
//! submits only the deterministically selected one. Computing all proofs
//! first means a miner holding a partial copy cannot answer, whichever
//! segment the selection lands on.

use std::sync::Arc;

use contractext::{root_hex, Coordinator, RpcError};
use lambda_sector::{proof_segment, Sector, SectorError, SEG_COUNT};
use primitives_pdp::PdpError;

use crate::content::{ContentClient, ContentError};
use crate::db::{ProgressStore, ProgressStoreError};

/// Attempts at persisting the advanced cursor after a submission.
const CURSOR_RETRIES: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum MinerError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Sector(#[from] SectorError),

    #[error(transparent)]
    Pdp(#[from] PdpError),

    #[error(transparent)]
    Progress(#[from] ProgressStoreError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

/// Everything a proof submission carries.
struct Submission {
    pp: String,
    chal: String,
    proof: String,
    root_hex: String,
}

pub struct Miner<C, N> {
    db: Arc<ProgressStore>,
    coordinator: Arc<C>,
    content: Arc<N>,
}

impl<C, N> Miner<C, N>
where
    C: Coordinator + 'static,
    N: ContentClient + 'static,
{
    pub fn new(db: Arc<ProgressStore>, coordinator: Arc<C>, content: Arc<N>) -> Self {
        Self {
            db,
            coordinator,
            content,
        }
    }

    /// Runs one mining step: prove the sector at the cursor, submit, advance.
    #[tracing::instrument(skip_all)]
    pub async fn step(&self) -> Result<(), MinerError> {
        let next = match self.db.cursor()? {
            Some(index) => index + 1,
            None => 0,
        };
        let count = self.coordinator.sector_count().await?;
        if next >= count {
            tracing::info!(next, count, "there isn't any new sector");
            return Ok(());
        }

        let seed = self.coordinator.get_seed().await?;
        let sid = self.coordinator.sector_id_at(next).await?;
        tracing::info!(%sid, index = next, "downloading sector");
        let bytes = self.content.fetch(&sid).await?;

        let address = self.coordinator.address();
        let submission =
            tokio::task::spawn_blocking(move || prove_sector(&bytes, &seed, address.as_bytes()))
                .await??;

        tracing::info!(%sid, "submitting proof");
        self.coordinator
            .submit_proof(
                &sid,
                &submission.pp,
                &submission.proof,
                &submission.root_hex,
                &submission.chal,
            )
            .await?;

        // Only a successful submission may move the cursor forward.
        let mut stored = false;
        for _ in 0..CURSOR_RETRIES {
            if self.db.set_cursor(next).is_ok() {
                stored = true;
                break;
            }
        }
        if !stored {
            tracing::error!(next, "failed to persist the round cursor");
        }
        Ok(())
    }
}

/// Decodes the sector, proves every segment under the round seed and keeps
/// the proof for the segment this miner is accountable for.
fn prove_sector(bytes: &[u8], seed: &str, address: &[u8]) -> Result<Submission, MinerError> {
    let sector = Sector::from_bytes(bytes)?;
    let pp = sector.public_params();

    let mut chals = Vec::with_capacity(SEG_COUNT);
    let mut proofs = Vec::with_capacity(SEG_COUNT);
    for index in 0..SEG_COUNT {
        let tag = primitives_pdp::Tag::parse(&sector.tags()[index])?;
        let chal = primitives_pdp::gen_chal_with_seed(index as i64, seed);
        let proof = primitives_pdp::prove(pp, &chal, &tag, sector.segment(index));
        chals.push(chal);
        proofs.push(proof);
    }

    let root = sector
        .merkle_root()
        .ok_or(SectorError::NotSealed)?
        .raw();
    let target = proof_segment(address, &root) as usize;

    Ok(Submission {
        pp: pp.marshal(),
        chal: chals[target].marshal(),
        proof: proofs[target].marshal(),
        root_hex: root_hex(&root)?,
    })
}
