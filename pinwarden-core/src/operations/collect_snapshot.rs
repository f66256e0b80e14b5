use crate::Result;
use crate::expiry::ExpiryIndex;
use crate::ownership::OwnershipRegistry;
use crate::quota::QuotaLedger;
use crate::snapshot::WardenSnapshot;
use crate::throttle::RequestThrottler;
use crate::tracker::ReferenceTracker;
use chrono::Utc;
use std::sync::Arc;

#[derive(Clone)]
pub struct CollectSnapshotOperation {
    ledger: Arc<QuotaLedger>,
    tracker: Arc<ReferenceTracker>,
    expiry: Arc<ExpiryIndex>,
    throttler: Arc<RequestThrottler>,
    ownership: Arc<OwnershipRegistry>,
}

impl CollectSnapshotOperation {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        tracker: Arc<ReferenceTracker>,
        expiry: Arc<ExpiryIndex>,
        throttler: Arc<RequestThrottler>,
        ownership: Arc<OwnershipRegistry>,
    ) -> Self {
        Self {
            ledger,
            tracker,
            expiry,
            throttler,
            ownership,
        }
    }

    /// Each component is read under its own lock, one after another.
    pub async fn run(&self) -> Result<WardenSnapshot> {
        let tracked = self.tracker.report().await;
        let expiry = self.expiry.report().await;

        Ok(WardenSnapshot {
            taken_at: Utc::now(),
            limit: self.ledger.limit().await.to_string(),
            principals: self.ledger.report().await,
            tracked_hashes: tracked.tracked_hashes,
            pinned_hashes: tracked.pinned_hashes,
            pending_hashes: tracked.pending_hashes,
            unpinning_hashes: tracked.unpinning_hashes,
            expiry_entries: expiry.entries,
            expiry_buckets: expiry.buckets,
            lanes: self.throttler.report(),
            ownership_entries: self.ownership.len().await,
        })
    }
}
