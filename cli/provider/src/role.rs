//! The periodic agent driver.
//!
//! One ticker per process; every tick dispatches a single Builder or Miner
//! step according to the role the coordinator assigned at startup. A
//! compare-and-swap busy flag drops ticks that arrive while a step is still
//! in flight; cancellation is observed at tick boundaries only, so an
//! in-flight step always runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use contractext::{Coordinator, Role};
use tokio_util::sync::CancellationToken;

use crate::builder::Builder;
use crate::content::ContentClient;
use crate::miner::Miner;

pub struct RoleLoop<C, N> {
    interval: Duration,
    role: Role,
    builder: Arc<Builder<C, N>>,
    miner: Arc<Miner<C, N>>,
    busy: Arc<AtomicBool>,
    last_trigger: Arc<Mutex<Instant>>,
}

impl<C, N> RoleLoop<C, N>
where
    C: Coordinator + 'static,
    N: ContentClient + 'static,
{
    pub fn new(interval: Duration, role: Role, builder: Builder<C, N>, miner: Miner<C, N>) -> Self {
        Self {
            interval,
            role,
            builder: Arc::new(builder),
            miner: Arc::new(miner),
            busy: Arc::new(AtomicBool::new(false)),
            last_trigger: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub async fn run(self, token: CancellationToken) {
        tracing::info!(role = ?self.role, interval = ?self.interval, "agent is set up");
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    tracing::info!("shutting down at tick boundary");
                    return;
                }
                _ = ticker.tick() => self.dispatch(),
            }
        }
    }

    fn dispatch(&self) {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let since = self
                .last_trigger
                .lock()
                .expect("last-trigger lock poisoned")
                .elapsed();
            tracing::warn!(?since, "previous step is still running, dropping tick");
            return;
        }
        *self
            .last_trigger
            .lock()
            .expect("last-trigger lock poisoned") = Instant::now();

        let role = self.role;
        let builder = self.builder.clone();
        let miner = self.miner.clone();
        let busy = self.busy.clone();
        tokio::spawn(async move {
            let outcome = match role {
                Role::Builder => builder.step().await.map_err(|err| err.to_string()),
                Role::Miner => miner.step().await.map_err(|err| err.to_string()),
            };
            if let Err(err) = outcome {
                tracing::error!(%err, "step failed, retrying next tick");
            }
            busy.store(false, Ordering::SeqCst);
        });
    }
}
