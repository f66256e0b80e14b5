use super::ChainClient;
use crate::throttle::ThrottleSettings;
use crate::types::Timestamp;
use crate::{Result, WardenError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub const DEFAULT_BLOCK_CACHE_CAPACITY: usize = 4096;

/// Block timestamps with a bounded cache and the throttler's retry policy.
///
/// Blocks never change their timestamp, so a cached answer is final. When the
/// cache is full the lowest block numbers go first.
pub struct BlockTimestamps {
    chain: Arc<dyn ChainClient>,
    retry: ThrottleSettings,
    capacity: usize,
    cache: RwLock<BTreeMap<u64, Timestamp>>,
}

impl BlockTimestamps {
    pub fn new(chain: Arc<dyn ChainClient>, retry: ThrottleSettings) -> Self {
        Self {
            chain,
            retry,
            capacity: DEFAULT_BLOCK_CACHE_CAPACITY,
            cache: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub async fn cached(&self, block_number: u64) -> Option<Timestamp> {
        self.cache.read().await.get(&block_number).copied()
    }

    /// Ask the chain, retrying transient failures with `attempt² × base` backoff.
    pub async fn resolve(&self, block_number: u64) -> Result<Timestamp> {
        if let Some(timestamp) = self.cached(block_number).await {
            return Ok(timestamp);
        }

        let mut attempt = 0u32;
        let timestamp = loop {
            attempt += 1;
            match self.chain.block_timestamp(block_number).await {
                Ok(timestamp) => break timestamp,
                Err(error) if !error.is_retryable() => return Err(error),
                Err(error) if attempt >= self.retry.max_attempts => {
                    return Err(WardenError::RetriesExhausted {
                        lane: "block-timestamp".to_string(),
                        hash: format!("block {}", block_number),
                        attempts: attempt,
                        last_error: error.to_string(),
                    });
                }
                Err(error) => {
                    let delay = self.retry.backoff(attempt);
                    tracing::warn!(
                        "timestamp of block {} attempt {} failed: {}; retrying in {:?}",
                        block_number,
                        attempt,
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let mut cache = self.cache.write().await;
        cache.insert(block_number, timestamp);
        while cache.len() > self.capacity {
            cache.pop_first();
        }
        Ok(timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyChain {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChainClient for FlakyChain {
        async fn block_timestamp(&self, block_number: u64) -> Result<Timestamp> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(WardenError::Http("connection refused".to_string()));
            }
            Ok(block_number as i64 * 1000)
        }
    }

    fn retry(max_attempts: u32) -> ThrottleSettings {
        ThrottleSettings {
            max_attempts,
            backoff_base: Duration::from_micros(10),
            ..ThrottleSettings::default()
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_then_cached() {
        let chain = Arc::new(FlakyChain {
            failures_left: AtomicU32::new(3),
            calls: AtomicU32::new(0),
        });
        let timestamps = BlockTimestamps::new(chain.clone(), retry(15));

        assert_eq!(timestamps.resolve(7).await.unwrap(), 7000);
        assert_eq!(chain.calls.load(Ordering::SeqCst), 4);

        assert_eq!(timestamps.cached(7).await, Some(7000));
        assert_eq!(timestamps.resolve(7).await.unwrap(), 7000);
        assert_eq!(chain.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let chain = Arc::new(FlakyChain {
            failures_left: AtomicU32::new(100),
            calls: AtomicU32::new(0),
        });
        let timestamps = BlockTimestamps::new(chain.clone(), retry(3));

        let error = timestamps.resolve(1).await.unwrap_err();
        assert!(matches!(error, WardenError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(timestamps.cached(1).await, None);
    }

    #[tokio::test]
    async fn test_cache_drops_oldest_blocks() {
        let chain = Arc::new(FlakyChain {
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        });
        let timestamps = BlockTimestamps::new(chain, retry(1)).with_capacity(2);

        for block in [5, 6, 7] {
            timestamps.resolve(block).await.unwrap();
        }
        assert_eq!(timestamps.cached(5).await, None);
        assert_eq!(timestamps.cached(7).await, Some(7000));
    }
}
