//! Chain client boundary: block numbers in, block timestamps out.

pub mod rpc;
pub mod timestamps;

pub use rpc::JsonRpcChainClient;
pub use timestamps::{BlockTimestamps, DEFAULT_BLOCK_CACHE_CAPACITY};

use crate::types::Timestamp;
use crate::{Result, WardenError};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Timestamp of `block_number` in milliseconds.
    async fn block_timestamp(&self, block_number: u64) -> Result<Timestamp>;
}

/// Chain client answering from a fixed table.
#[derive(Debug, Default)]
pub struct StaticChainClient {
    blocks: RwLock<HashMap<u64, Timestamp>>,
}

impl StaticChainClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_block(&self, block_number: u64, timestamp: Timestamp) {
        self.blocks.write().await.insert(block_number, timestamp);
    }
}

#[async_trait]
impl ChainClient for StaticChainClient {
    async fn block_timestamp(&self, block_number: u64) -> Result<Timestamp> {
        self.blocks
            .read()
            .await
            .get(&block_number)
            .copied()
            .ok_or_else(|| WardenError::InvalidRequest(format!("unknown block {}", block_number)))
    }
}
