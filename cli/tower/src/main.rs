//! The round verifier: checks every submitted possession proof, closes the
//! round and reports the winning addresses back to the coordinator.

mod verifier;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use contractext::Client;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

use crate::verifier::Tower;

#[derive(Debug, thiserror::Error)]
enum TowerCliError {
    #[error("invalid rpc url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("invalid duration: {0}")]
    InvalidDuration(#[from] humantime::DurationError),

    #[error("private key must not be none")]
    MissingKey,

    #[error("contract address must not be none")]
    MissingContract,

    #[error("FromEnv error: {0}")]
    EnvFilter(#[from] tracing_subscriber::filter::FromEnvError),

    #[error(transparent)]
    Rpc(#[from] contractext::RpcError),
}

/// The tower arguments, as passed by the user, unvalidated.
#[derive(Debug, Parser)]
#[command(name = "tower", author, version, about, long_about = None)]
struct TowerArguments {
    /// Coordinator JSON-RPC endpoint.
    #[arg(long = "u", default_value = "http://127.0.0.1:8545")]
    rpc_url: String,

    /// Chain id of the coordinator's chain.
    #[arg(long = "c", default_value_t = 92001)]
    chain_id: i64,

    /// Interval between verification rounds, e.g. "30s" or "5m".
    #[arg(long = "d", default_value = "1m")]
    duration: String,

    /// Hex format private key.
    #[arg(long = "pk", default_value = "")]
    private_key: String,

    /// Hex format contract address.
    #[arg(long = "ca", default_value = "")]
    contract_addr: String,
}

/// Validated tower configuration.
struct TowerConfiguration {
    rpc_url: Url,
    chain_id: i64,
    interval: Duration,
    private_key: String,
    contract_addr: String,
}

impl TryFrom<TowerArguments> for TowerConfiguration {
    type Error = TowerCliError;

    fn try_from(value: TowerArguments) -> Result<Self, Self::Error> {
        let rpc_url = Url::parse(&value.rpc_url)?;
        let interval = humantime::parse_duration(&value.duration)?;
        if value.private_key.is_empty() {
            return Err(TowerCliError::MissingKey);
        }
        if value.contract_addr.is_empty() {
            return Err(TowerCliError::MissingContract);
        }
        Ok(Self {
            rpc_url,
            chain_id: value.chain_id,
            interval,
            private_key: value.private_key,
            contract_addr: value.contract_addr,
        })
    }
}

fn main() {
    if let Err(err) = run_cli() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run_cli() -> Result<(), TowerCliError> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env()?,
        )
        .init();

    let configuration: TowerConfiguration = TowerArguments::parse().try_into()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build the runtime")
        .block_on(run(configuration))
}

async fn run(configuration: TowerConfiguration) -> Result<(), TowerCliError> {
    let client = Arc::new(Client::connect(
        configuration.rpc_url.as_str(),
        configuration.chain_id as u64,
        &configuration.private_key,
        &configuration.contract_addr,
        None,
    )?);
    tracing::info!(
        contract = configuration.contract_addr,
        "tower connected to the coordinator"
    );

    let tower = Tower::new(client, configuration.interval);
    let token = CancellationToken::new();
    let tower_task = tokio::spawn(tower.run(token.child_token()));

    wait_for_shutdown().await;
    tracing::info!("shutdown");
    token.cancel();
    if let Err(err) = tower_task.await {
        tracing::error!(%err, "tower loop panicked");
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
