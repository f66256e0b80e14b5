use super::ChainClient;
use crate::types::Timestamp;
use crate::{Result, WardenError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Ethereum-style JSON-RPC client that only knows `eth_getBlockByNumber`.
#[derive(Clone)]
pub struct JsonRpcChainClient {
    client: reqwest::Client,
    rpc_url: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<RpcBlock>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcBlock {
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

impl JsonRpcChainClient {
    pub fn new(rpc_url: &str, request_timeout: Duration) -> Result<Self> {
        let rpc_url = rpc_url.trim().to_string();
        if rpc_url.is_empty() {
            return Err(WardenError::Config("chain rpc url cannot be empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|error| WardenError::Config(format!("chain client: {}", error)))?;

        Ok(Self { client, rpc_url })
    }
}

#[async_trait]
impl ChainClient for JsonRpcChainClient {
    async fn block_timestamp(&self, block_number: u64) -> Result<Timestamp> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_getBlockByNumber",
            "params": [format!("0x{:x}", block_number), false],
        });

        let response: RpcResponse = self
            .client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(error) = response.error {
            return Err(WardenError::Http(format!(
                "eth_getBlockByNumber({}) failed: {} ({})",
                block_number, error.message, error.code
            )));
        }

        let block = response.result.ok_or_else(|| {
            WardenError::InvalidRequest(format!("block {} not found", block_number))
        })?;

        let seconds = parse_hex_quantity(&block.timestamp)?;
        i64::try_from(seconds)
            .ok()
            .and_then(|secs| secs.checked_mul(1000))
            .ok_or_else(|| {
                WardenError::Internal(format!("block timestamp out of range: {}", seconds))
            })
    }
}

fn parse_hex_quantity(value: &str) -> Result<u64> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| WardenError::Internal(format!("not a hex quantity: {}", value)))?;

    u64::from_str_radix(digits, 16)
        .map_err(|error| WardenError::Internal(format!("invalid hex quantity {}: {}", value, error)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_quantity() {
        assert_eq!(parse_hex_quantity("0x5f5e100").unwrap(), 100_000_000);
        assert_eq!(parse_hex_quantity("0x0").unwrap(), 0);
        assert!(parse_hex_quantity("1234").is_err());
        assert!(parse_hex_quantity("0xzz").is_err());
    }

    #[test]
    fn test_rpc_response_decoding() {
        let raw = r#"{"jsonrpc":"2.0","id":1,"result":{"number":"0x10","timestamp":"0x6553f100"}}"#;
        let response: RpcResponse = serde_json::from_str(raw).unwrap();
        let block = response.result.unwrap();
        assert_eq!(parse_hex_quantity(&block.timestamp).unwrap(), 1_700_000_000);
    }
}
