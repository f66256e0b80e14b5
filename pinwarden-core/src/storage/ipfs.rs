use super::ContentStore;
use crate::{Result, WardenError};
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// Content store backed by the IPFS HTTP API (`/api/v0/...`).
#[derive(Clone)]
pub struct IpfsHttpStore {
    client: reqwest::Client,
    api_url: String,
}

impl IpfsHttpStore {
    pub fn new(api_url: &str, request_timeout: Duration) -> Result<Self> {
        let api_url = api_url.trim().trim_end_matches('/').to_string();
        if api_url.is_empty() {
            return Err(WardenError::Config(
                "ipfs api url cannot be empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|error| WardenError::Config(format!("ipfs client: {}", error)))?;

        Ok(Self { client, api_url })
    }

    fn endpoint(&self, command: &str) -> String {
        format!("{}/api/v0/{}", self.api_url, command)
    }

    async fn call(&self, command: &str, hash: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint(command))
            .query(&[("arg", hash)])
            .send()
            .await?;
        Ok(response)
    }
}

#[async_trait]
impl ContentStore for IpfsHttpStore {
    async fn fetch(&self, hash: &str) -> Result<Bytes> {
        let response = self.call("cat", hash).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WardenError::Store(format!(
                "cat {} returned {}: {}",
                hash,
                status,
                body.trim()
            )));
        }

        Ok(response.bytes().await?)
    }

    async fn pin_add(&self, hash: &str) -> Result<()> {
        let response = self.call("pin/add", hash).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WardenError::Store(format!(
                "pin/add {} returned {}: {}",
                hash,
                status,
                body.trim()
            )));
        }

        tracing::debug!("ipfs pinned {}", hash);
        Ok(())
    }

    async fn pin_remove(&self, hash: &str) -> Result<()> {
        let response = self.call("pin/rm", hash).await?;
        let status = response.status();
        if status.is_success() {
            tracing::debug!("ipfs unpinned {}", hash);
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if is_not_pinned_message(&body) {
            return Err(WardenError::NotPinned(hash.to_string()));
        }

        Err(WardenError::Store(format!(
            "pin/rm {} returned {}: {}",
            hash,
            status,
            body.trim()
        )))
    }
}

/// The daemon answers `pin/rm` on an unpinned hash with an error body
/// such as `{"Message":"not pinned or pinned indirectly","Code":0}`.
fn is_not_pinned_message(body: &str) -> bool {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("Message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.to_string());

    message.to_ascii_lowercase().contains("not pinned")
}
