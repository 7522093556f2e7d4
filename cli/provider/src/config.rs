use std::path::PathBuf;

use url::Url;

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Coordinator JSON-RPC endpoint.
    pub remote_url: Url,
    /// Minutes between agent steps.
    pub delay: u64,
    /// Progress-store directory.
    pub record: PathBuf,
    /// Sealed-block directory the Builder walks.
    pub seal_path: PathBuf,
    /// Hex-encoded submitter key.
    pub private_key: String,
    /// Coordinator contract address.
    pub contract_addr: String,
    /// Size-filter contract address; unset deployments admit everything.
    pub filter_contract_addr: Option<String>,
    pub chain_id: i64,
    /// Content-network HTTP API endpoint.
    pub content_api: Url,
    /// Legacy flatfs mounts; non-empty switches the Builder to bundle
    /// gathering.
    pub mounts: Vec<PathBuf>,
    /// Byte budget of one bundle gather.
    pub bundle_budget: u64,
}
