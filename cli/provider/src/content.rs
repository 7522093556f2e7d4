//! Client side of the content-addressed network.
//!
//! The network itself is an external collaborator; the agents only need two
//! operations: publish a sector and get its bytes back by content id. The
//! production implementation speaks the IPFS HTTP API.

use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("block {0} is not available")]
    NotFound(String),

    #[error("content api refused the publish")]
    PublishRefused,

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[async_trait::async_trait]
pub trait ContentClient: Send + Sync {
    /// Hands `bytes` to the network, returning their content id.
    async fn publish(&self, bytes: Vec<u8>) -> Result<String, ContentError>;

    /// Downloads the full block behind `cid`.
    async fn fetch(&self, cid: &str) -> Result<Vec<u8>, ContentError>;
}

/// [`ContentClient`] over the IPFS HTTP API (`/api/v0/add`, `/api/v0/cat`).
pub struct IpfsClient {
    base: String,
    http: reqwest::Client,
}

#[derive(serde::Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

impl IpfsClient {
    pub fn new(api: &Url) -> Self {
        Self {
            base: api.as_str().trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl ContentClient for IpfsClient {
    async fn publish(&self, bytes: Vec<u8>) -> Result<String, ContentError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name("sector");
        let form = reqwest::multipart::Form::new().part("file", part);
        let response = self
            .http
            .post(format!("{}/api/v0/add", self.base))
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        let added: AddResponse = response.json().await?;
        Ok(added.hash)
    }

    async fn fetch(&self, cid: &str) -> Result<Vec<u8>, ContentError> {
        let response = self
            .http
            .post(format!("{}/api/v0/cat", self.base))
            .query(&[("arg", cid)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ContentError::NotFound(cid.to_owned()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}
