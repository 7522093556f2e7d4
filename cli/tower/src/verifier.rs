//! The verification step: fetch pending proofs, check them in parallel,
//! close the round and report the winners.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use contractext::{Address, Coordinator, PendingProof, RpcError};
use lambda_sector::proof_segment;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum TowerError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),
}

pub struct Tower<C> {
    coordinator: Arc<C>,
    interval: Duration,
    concurrent: usize,
    busy: AtomicBool,
    last_trigger: Mutex<Instant>,
}

impl<C> Tower<C>
where
    C: Coordinator + 'static,
{
    pub fn new(coordinator: Arc<C>, interval: Duration) -> Self {
        let concurrent = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            coordinator,
            interval,
            concurrent,
            busy: AtomicBool::new(false),
            last_trigger: Mutex::new(Instant::now()),
        }
    }

    pub async fn run(self, token: CancellationToken) {
        tracing::info!(interval = ?self.interval, "tower is running");
        let tower = Arc::new(self);
        let start = tokio::time::Instant::now() + tower.interval;
        let mut ticker = tokio::time::interval_at(start, tower.interval);

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::info!("shutting down at tick boundary");
                    return;
                }
                _ = ticker.tick() => dispatch(&tower),
            }
        }
    }

    /// One verification round.
    #[tracing::instrument(skip_all)]
    pub async fn step_verify(&self) -> Result<(), TowerError> {
        let pending = self.coordinator.pending_proofs().await?;
        let chunk_size = pending.len().div_ceil(self.concurrent).max(1);
        tracing::info!(
            pending = pending.len(),
            chunk_size,
            "verifying submissions"
        );

        let winners: Arc<Mutex<HashSet<Address>>> = Arc::new(Mutex::new(HashSet::new()));
        for chunk in pending.chunks(chunk_size) {
            let mut handles = Vec::with_capacity(chunk.len());
            for submission in chunk.iter().cloned() {
                let winners = winners.clone();
                handles.push(tokio::task::spawn_blocking(move || {
                    if let Some(address) = verify_submission(&submission) {
                        winners
                            .lock()
                            .expect("winners lock poisoned")
                            .insert(address);
                    }
                }));
            }
            // Chunk barrier: the next chunk starts only once this one is done.
            for handle in handles {
                handle.await?;
            }
        }

        self.coordinator.close_round().await?;

        let winners: Vec<Address> = winners
            .lock()
            .expect("winners lock poisoned")
            .iter()
            .copied()
            .collect();
        if winners.is_empty() {
            tracing::info!("no winners this round");
        }
        self.coordinator.finalize(winners).await?;
        Ok(())
    }
}

fn dispatch<C>(tower: &Arc<Tower<C>>)
where
    C: Coordinator + 'static,
{
    if tower
        .busy
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        let since = tower
            .last_trigger
            .lock()
            .expect("last-trigger lock poisoned")
            .elapsed();
        tracing::warn!(?since, "verification is still running, dropping tick");
        return;
    }
    *tower
        .last_trigger
        .lock()
        .expect("last-trigger lock poisoned") = Instant::now();

    let tower = tower.clone();
    tokio::spawn(async move {
        if let Err(err) = tower.step_verify().await {
            tracing::error!(%err, "verification step failed, retrying next tick");
        }
        tower.busy.store(false, Ordering::SeqCst);
    });
}

/// A submission wins only if it proves the segment the selection rule pins
/// on `(address, root)` and the proof itself verifies.
fn verify_submission(submission: &PendingProof) -> Option<Address> {
    let expected = proof_segment(submission.address.as_bytes(), &submission.root);
    if expected != submission.idx {
        tracing::error!(
            submitter = %submission.address,
            expected,
            claimed = submission.idx,
            "proof targets the wrong segment"
        );
        return None;
    }
    if primitives_pdp::verify(&submission.pp, &submission.chal, &submission.proof) {
        tracing::info!(submitter = %submission.address, "proof verified");
        Some(submission.address)
    } else {
        tracing::warn!(submitter = %submission.address, "proof failed verification");
        None
    }
}
