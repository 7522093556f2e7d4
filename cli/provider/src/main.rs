//! The storage-provider agent: packs sectors when the coordinator says
//! Builder, proves them when it says Miner.

mod builder;
mod bundle;
mod config;
mod content;
mod db;
mod miner;
mod role;
#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use contractext::{Client, Coordinator, Role};
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use crate::builder::Builder;
use crate::config::Config;
use crate::content::IpfsClient;
use crate::db::{ProgressStore, ProgressStoreError};
use crate::miner::Miner;
use crate::role::RoleLoop;

/// Default minutes between agent steps.
const DEFAULT_DELAY_MINUTES: u64 = 10;

/// Default byte budget of one legacy bundle gather.
const DEFAULT_BUNDLE_BUDGET: u64 = 1 << 30;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("private key must not be empty")]
    MissingKey,

    #[error("contract address must not be empty")]
    MissingContract,

    #[error("FromEnv error: {0}")]
    EnvFilter(#[from] tracing_subscriber::filter::FromEnvError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rpc(#[from] contractext::RpcError),

    #[error(transparent)]
    Progress(#[from] ProgressStoreError),
}

/// The agent arguments, as passed by the user, unvalidated.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct ProviderArguments {
    /// Coordinator JSON-RPC endpoint.
    #[arg(long)]
    remote_url: Url,

    /// Minutes between agent steps.
    #[arg(long, default_value_t = DEFAULT_DELAY_MINUTES)]
    delay: u64,

    /// Progress-store directory.
    #[arg(long)]
    record: PathBuf,

    /// Sealed-block directory the Builder packs from.
    #[arg(long)]
    seal_path: PathBuf,

    /// Hex-encoded submitter private key.
    #[arg(long)]
    private_key: String,

    /// Coordinator contract address.
    #[arg(long)]
    contract_addr: String,

    /// Size-filter contract address.
    #[arg(long)]
    filter_contract_addr: Option<String>,

    /// Chain id of the coordinator's chain.
    #[arg(long)]
    chain_id: i64,

    /// Content-network HTTP API endpoint.
    #[arg(long)]
    content_api: Url,

    /// Legacy flatfs mount; may be given multiple times.
    #[arg(long = "mount")]
    mounts: Vec<PathBuf>,

    /// Byte budget of one legacy bundle gather.
    #[arg(long, default_value_t = DEFAULT_BUNDLE_BUDGET)]
    bundle_budget: u64,
}

impl TryFrom<ProviderArguments> for Config {
    type Error = ProviderError;

    fn try_from(value: ProviderArguments) -> Result<Self, Self::Error> {
        if value.private_key.is_empty() {
            return Err(ProviderError::MissingKey);
        }
        if value.contract_addr.is_empty() {
            return Err(ProviderError::MissingContract);
        }
        Ok(Config {
            remote_url: value.remote_url,
            delay: value.delay.max(1),
            record: value.record,
            seal_path: value.seal_path,
            private_key: value.private_key,
            contract_addr: value.contract_addr,
            filter_contract_addr: value.filter_contract_addr,
            chain_id: value.chain_id,
            content_api: value.content_api,
            mounts: value.mounts,
            bundle_budget: value.bundle_budget,
        })
    }
}

fn main() -> Result<(), ProviderError> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .init();

    let config: Config = ProviderArguments::parse().try_into()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build the runtime")
        .block_on(run(config))
}

async fn run(config: Config) -> Result<(), ProviderError> {
    std::fs::create_dir_all(&config.record)?;
    std::fs::create_dir_all(&config.seal_path)?;

    let db = match ProgressStore::open(&config.record) {
        Ok(db) => Arc::new(db),
        // Another process holds the store; this agent has nothing to do.
        Err(ProgressStoreError::Locked) => {
            tracing::warn!("progress store is locked, agent going offline");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let coordinator = Arc::new(Client::connect(
        config.remote_url.as_str(),
        config.chain_id as u64,
        &config.private_key,
        &config.contract_addr,
        config.filter_contract_addr.as_deref(),
    )?);
    let content = Arc::new(IpfsClient::new(&config.content_api));

    // The role is queried once per process; a re-assignment takes effect on
    // the next restart.
    let role = match coordinator.role().await {
        Ok(role) => role,
        Err(err) => {
            tracing::warn!(%err, "failed to query the assigned role, defaulting to miner");
            Role::Miner
        }
    };

    let builder = Builder::new(
        config.seal_path.clone(),
        config.mounts.clone(),
        config.bundle_budget,
        db.clone(),
        coordinator.clone(),
        content.clone(),
    );
    let miner = Miner::new(db, coordinator, content);
    let role_loop = RoleLoop::new(
        Duration::from_secs(config.delay * 60),
        role,
        builder,
        miner,
    );

    let token = CancellationToken::new();
    let loop_task = tokio::spawn(role_loop.run(token.child_token()));

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received");
    token.cancel();
    if let Err(err) = loop_task.await {
        tracing::error!(%err, "agent loop panicked");
    }

    Ok(())
}

async fn wait_for_shutdown() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::error!(%err, "failed to install the SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
