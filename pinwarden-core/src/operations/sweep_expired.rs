use crate::Result;
use crate::expiry::ExpiryIndex;
use crate::tracker::{ReferenceTracker, RemoveReferenceOutcome, UnpinHandle};
use crate::types::Timestamp;
use std::sync::Arc;

#[derive(Clone)]
pub struct SweepExpiredOperation {
    tracker: Arc<ReferenceTracker>,
    expiry: Arc<ExpiryIndex>,
}

#[derive(Debug, Clone, Copy)]
pub struct SweepExpiredOperationRequest {
    pub now: Timestamp,
}

#[derive(Debug, Default)]
pub struct SweepExpiredOperationResult {
    pub expired: Vec<String>,
    /// Unpins started by this sweep.
    pub unpins: Vec<UnpinHandle>,
}

impl SweepExpiredOperation {
    pub fn new(tracker: Arc<ReferenceTracker>, expiry: Arc<ExpiryIndex>) -> Self {
        Self { tracker, expiry }
    }

    pub async fn run(
        &self,
        request: SweepExpiredOperationRequest,
    ) -> Result<SweepExpiredOperationResult> {
        let expired = self.expiry.sweep(request.now).await;
        if expired.is_empty() {
            tracing::debug!("sweep at {} found nothing expired", request.now);
            return Ok(SweepExpiredOperationResult::default());
        }

        tracing::info!("sweep at {} evicting {} hashes", request.now, expired.len());

        let mut unpins = Vec::new();
        for hash in &expired {
            match self.tracker.evict(hash).await {
                RemoveReferenceOutcome::Unpinning(handle) => unpins.push(handle),
                RemoveReferenceOutcome::AlreadyUnpinning => {
                    tracing::debug!("{} is already being unpinned", hash);
                }
                other => tracing::debug!("evicting {}: {:?}", hash, other),
            }
        }

        Ok(SweepExpiredOperationResult { expired, unpins })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiry::ExpirySettings;
    use crate::quota::QuotaLedger;
    use crate::storage::MemoryContentStore;
    use crate::throttle::{RequestThrottler, ThrottleSettings};
    use crate::tracker::{AddReferenceOutcome, AddReferenceRequest};
    use crate::types::{Expiry, ManualClock};
    use num_bigint::BigUint;

    const T0: i64 = 1_700_000_000_000;

    #[tokio::test]
    async fn test_sweep_evicts_only_expired() {
        let store = Arc::new(MemoryContentStore::new());
        store.put("QmShort", vec![0u8; 4]).await;
        store.put("QmLong", vec![0u8; 4]).await;
        let expiry = Arc::new(ExpiryIndex::new(ExpirySettings::default()));
        let tracker = Arc::new(ReferenceTracker::new(
            Arc::new(QuotaLedger::new(BigUint::from(1000u32))),
            expiry.clone(),
            Arc::new(RequestThrottler::new(store.clone(), ThrottleSettings::default())),
            Arc::new(ManualClock::new(T0)),
        ));

        for (hash, ttl_secs) in [("QmShort", 3600), ("QmLong", 7200)] {
            let outcome = tracker
                .add_reference(AddReferenceRequest {
                    hash: hash.to_string(),
                    owner: "0xc".to_string(),
                    principal: "0xp".to_string(),
                    expiry: Expiry::from_ttl(T0, ttl_secs),
                })
                .await;
            let AddReferenceOutcome::Started(handle) = outcome else {
                panic!("expected a started workflow");
            };
            handle.await.unwrap().unwrap();
        }

        let sweep = SweepExpiredOperation::new(tracker.clone(), expiry.clone());

        let early = sweep
            .run(SweepExpiredOperationRequest { now: T0 + 3_599_000 })
            .await
            .unwrap();
        assert!(early.expired.is_empty());

        let result = sweep
            .run(SweepExpiredOperationRequest { now: T0 + 3_601_000 })
            .await
            .unwrap();
        assert_eq!(result.expired, vec!["QmShort".to_string()]);
        for handle in result.unpins {
            handle.await.unwrap().unwrap();
        }

        assert!(!store.is_pinned("QmShort").await);
        assert!(store.is_pinned("QmLong").await);
        assert_eq!(expiry.expiry_of("QmLong").await, Some(T0 + 7_200_000));
        assert_eq!(expiry.expiry_of("QmShort").await, None);
    }
}
