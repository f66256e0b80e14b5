//! Multi-owner reference tracking for pinned hashes.
//!
//! A hash moves `Pending -> Complete -> Unpinning -> (gone)`. Every state
//! change happens under the `records` lock, and the quota ledger and expiry
//! index are only touched while that lock is held, so fetch/pin/unpin
//! completions can never interleave with add/remove events for the same
//! hash. Network work runs in spawned tasks through the throttler and
//! re-enters through the `on_*` continuations.
//!
//! Lock order is always `records -> ledger` and `records -> expiry`.

use crate::expiry::ExpiryIndex;
use crate::quota::QuotaLedger;
use crate::snapshot::TrackerReport;
use crate::throttle::{Lane, PinRemoval, RequestThrottler, TaskOutput};
use crate::types::{Clock, Expiry, normalize_address, normalize_hash};
use crate::{Result, WardenError};
use num_bigint::BigUint;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Pending,
    Complete,
    Unpinning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Charge {
    principal: String,
    amount: BigUint,
}

#[derive(Debug, Clone)]
pub struct ContentHandle {
    pub hash: String,
    pub size: Option<u64>,
    pub status: HandleStatus,
    pub removal_requested: bool,
    pub owners: HashMap<String, bool>,
    pub expiry: Expiry,
    /// Principal charged once the fetch reports a size.
    pub principal: String,
    charged: Option<Charge>,
}

impl ContentHandle {
    fn pending(hash: &str, owners: HashMap<String, bool>, expiry: Expiry, principal: &str) -> Self {
        Self {
            hash: hash.to_string(),
            size: None,
            status: HandleStatus::Pending,
            removal_requested: false,
            owners,
            expiry,
            principal: principal.to_string(),
            charged: None,
        }
    }

    pub fn has_active_owner(&self) -> bool {
        self.owners.values().any(|active| *active)
    }

    pub fn is_charged(&self) -> bool {
        self.charged.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct AddReferenceRequest {
    pub hash: String,
    pub owner: String,
    pub principal: String,
    pub expiry: Expiry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedContent {
    pub hash: String,
    pub size: u64,
    pub principal: String,
    /// The last owner left while the pin was in flight and the hash was unpinned again.
    pub released: bool,
}

#[derive(Debug)]
pub struct UnpinOutcome {
    pub hash: String,
    pub released_bytes: u64,
    pub already_absent: bool,
    /// Set when an owner came back while the unpin was in flight.
    pub repinning: Option<WorkflowHandle>,
}

pub type WorkflowHandle = JoinHandle<Result<PinnedContent>>;
pub type UnpinHandle = JoinHandle<Result<UnpinOutcome>>;

#[derive(Debug)]
pub enum AddReferenceOutcome {
    /// First sighting; fetch and pin are under way.
    Started(WorkflowHandle),
    /// Fetch/pin already in flight; owner recorded.
    Joined,
    /// Already pinned; owner recorded and expiry forwarded.
    Refreshed,
    /// Unpin in flight; the hash is pinned again once it lands.
    Requeued,
    /// Resolved expiry is in the past; nothing changed, even for a tracked hash.
    Expired,
}

#[derive(Debug)]
pub enum RemoveReferenceOutcome {
    Unknown,
    /// Pin still in flight; removal runs once it lands.
    Deferred,
    StillReferenced,
    AlreadyUnpinning,
    Unpinning(UnpinHandle),
}

pub struct ReferenceTracker {
    records: Mutex<HashMap<String, ContentHandle>>,
    ledger: Arc<QuotaLedger>,
    expiry: Arc<ExpiryIndex>,
    throttler: Arc<RequestThrottler>,
    clock: Arc<dyn Clock>,
}

impl ReferenceTracker {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        expiry: Arc<ExpiryIndex>,
        throttler: Arc<RequestThrottler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            ledger,
            expiry,
            throttler,
            clock,
        }
    }

    pub async fn add_reference(self: &Arc<Self>, request: AddReferenceRequest) -> AddReferenceOutcome {
        let hash = normalize_hash(&request.hash);
        let owner = normalize_address(&request.owner);
        let principal = normalize_address(&request.principal);

        if request.expiry.is_past(self.clock.now_ms()) {
            tracing::info!("hash {} already expired; not pinning for {}", hash, owner);
            return AddReferenceOutcome::Expired;
        }

        let mut records = self.records.lock().await;
        if !records.contains_key(&hash) {
            let owners = HashMap::from([(owner.clone(), true)]);
            records.insert(
                hash.clone(),
                ContentHandle::pending(&hash, owners, request.expiry, &principal),
            );
            self.ledger.ensure(&principal).await;
            drop(records);

            tracing::info!("pinning {} for owner {} (principal {})", hash, owner, principal);
            return AddReferenceOutcome::Started(self.spawn_pin_workflow(hash));
        }

        let Some(record) = records.get_mut(&hash) else {
            return AddReferenceOutcome::Joined;
        };
        record.owners.insert(owner, true);
        record.expiry = record.expiry.latest(request.expiry);

        match record.status {
            HandleStatus::Pending => {
                record.principal = principal;
                AddReferenceOutcome::Joined
            }
            HandleStatus::Complete => {
                let expiry = record.expiry;
                self.expiry.register(&hash, expiry).await;
                AddReferenceOutcome::Refreshed
            }
            HandleStatus::Unpinning => {
                record.principal = principal;
                AddReferenceOutcome::Requeued
            }
        }
    }

    pub async fn remove_reference(self: &Arc<Self>, hash: &str, owner: &str) -> RemoveReferenceOutcome {
        let hash = normalize_hash(hash);
        let owner = normalize_address(owner);

        self.release(&hash, |record| {
            if let Some(active) = record.owners.get_mut(&owner) {
                *active = false;
            }
        })
        .await
    }

    /// Drop every owner of an expired hash and unpin it.
    pub async fn evict(self: &Arc<Self>, hash: &str) -> RemoveReferenceOutcome {
        let outcome = self
            .release(hash, |record| {
                record.owners.values_mut().for_each(|active| *active = false);
            })
            .await;

        if matches!(outcome, RemoveReferenceOutcome::Unknown) {
            self.expiry.remove(hash).await;
        }
        outcome
    }

    async fn release<F>(self: &Arc<Self>, hash: &str, mark: F) -> RemoveReferenceOutcome
    where
        F: FnOnce(&mut ContentHandle),
    {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(hash) else {
            return RemoveReferenceOutcome::Unknown;
        };

        mark(record);

        match record.status {
            HandleStatus::Pending => {
                record.removal_requested = true;
                tracing::info!("removal of {} deferred until its pin completes", hash);
                RemoveReferenceOutcome::Deferred
            }
            HandleStatus::Unpinning => RemoveReferenceOutcome::AlreadyUnpinning,
            HandleStatus::Complete if record.has_active_owner() => {
                RemoveReferenceOutcome::StillReferenced
            }
            HandleStatus::Complete => {
                record.status = HandleStatus::Unpinning;
                drop(records);

                tracing::info!("unpinning {}", hash);
                RemoveReferenceOutcome::Unpinning(self.spawn_unpin_workflow(hash.to_string()))
            }
        }
    }

    fn spawn_pin_workflow(self: &Arc<Self>, hash: String) -> WorkflowHandle {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.run_pin_workflow(hash).await })
    }

    fn spawn_unpin_workflow(self: &Arc<Self>, hash: String) -> UnpinHandle {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.run_unpin_workflow(hash).await })
    }

    async fn run_pin_workflow(self: Arc<Self>, hash: String) -> Result<PinnedContent> {
        let size = match self.throttler.submit(Lane::Fetch, &hash).await {
            Ok(TaskOutput::Fetched { size }) => size,
            Ok(other) => {
                let error = WardenError::Internal(format!("unexpected fetch output {:?}", other));
                return Err(self.on_workflow_failure(&hash, error).await);
            }
            Err(error) => return Err(self.on_workflow_failure(&hash, error).await),
        };

        self.on_fetch_complete(&hash, size).await?;

        if let Err(error) = self.throttler.submit(Lane::PinAdd, &hash).await {
            return Err(self.on_workflow_failure(&hash, error).await);
        }

        let content = self.on_pin_complete(&hash).await?;
        if content.released {
            tracing::info!("running deferred removal of {}", hash);
            self.clone().run_unpin_workflow(hash).await?;
        }
        Ok(content)
    }

    /// Record the size and charge the pending principal. Over quota drops the record.
    async fn on_fetch_complete(&self, hash: &str, size: u64) -> Result<()> {
        let mut records = self.records.lock().await;
        let principal = match records.get_mut(hash) {
            Some(record) => {
                record.size = Some(size);
                record.principal.clone()
            }
            None => return Err(WardenError::Abandoned(hash.to_string())),
        };

        tracing::info!("hash {} fetched {} bytes", hash, size);

        let amount = BigUint::from(size);
        match self.ledger.try_reserve(&principal, &amount).await {
            Ok(()) => {
                if let Some(record) = records.get_mut(hash) {
                    record.charged = Some(Charge { principal, amount });
                }
                Ok(())
            }
            Err(error) => {
                records.remove(hash);
                tracing::warn!(
                    "pinning {} would exceed the quota of {}; ignoring: {}",
                    hash,
                    principal,
                    error
                );
                Err(error)
            }
        }
    }

    /// Mark the hash pinned. `released` in the result means the last owner
    /// left mid-flight and the record is already `Unpinning`.
    async fn on_pin_complete(&self, hash: &str) -> Result<PinnedContent> {
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(hash) else {
            return Err(WardenError::Abandoned(hash.to_string()));
        };

        record.status = HandleStatus::Complete;
        self.expiry.register(hash, record.expiry).await;

        let release_now = record.removal_requested && !record.has_active_owner();
        record.removal_requested = false;
        if release_now {
            record.status = HandleStatus::Unpinning;
        }

        let content = PinnedContent {
            hash: hash.to_string(),
            size: record.size.unwrap_or_default(),
            principal: record
                .charged
                .as_ref()
                .map(|charge| charge.principal.clone())
                .unwrap_or_else(|| record.principal.clone()),
            released: release_now,
        };
        tracing::info!("pinning complete for {} ({} bytes)", hash, content.size);
        Ok(content)
    }

    async fn run_unpin_workflow(self: Arc<Self>, hash: String) -> Result<UnpinOutcome> {
        let removal = match self.throttler.submit(Lane::PinRemove, &hash).await {
            Ok(TaskOutput::Unpinned(removal)) => removal,
            Ok(other) => {
                let error = WardenError::Internal(format!("unexpected unpin output {:?}", other));
                return Err(self.on_unpin_failure(&hash, error).await);
            }
            Err(error) => return Err(self.on_unpin_failure(&hash, error).await),
        };

        let (mut outcome, repin) = self.on_unpin_complete(&hash, removal).await?;
        if repin {
            outcome.repinning = Some(self.spawn_pin_workflow(hash));
        }
        Ok(outcome)
    }

    /// Release the charge and drop the record. Returns `true` when an owner
    /// came back mid-unpin and a fresh `Pending` record was put in its place.
    async fn on_unpin_complete(
        &self,
        hash: &str,
        removal: PinRemoval,
    ) -> Result<(UnpinOutcome, bool)> {
        let mut records = self.records.lock().await;
        let Some(record) = records.remove(hash) else {
            return Err(WardenError::Abandoned(hash.to_string()));
        };

        if let Some(charge) = &record.charged {
            self.ledger.release(&charge.principal, &charge.amount).await;
        }
        self.expiry.remove(hash).await;

        let already_absent = removal == PinRemoval::NotPinned;
        let released_bytes = record.size.unwrap_or_default();
        tracing::info!(
            "unpinned {} (released {} bytes{})",
            hash,
            released_bytes,
            if already_absent { ", already absent" } else { "" }
        );

        let repin = record.has_active_owner();
        if repin {
            let owners: HashMap<String, bool> = record
                .owners
                .into_iter()
                .filter(|(_, active)| *active)
                .collect();
            tracing::info!("{} was referenced again while unpinning; pinning again", hash);
            records.insert(
                hash.to_string(),
                ContentHandle::pending(hash, owners, record.expiry, &record.principal),
            );
        }

        let outcome = UnpinOutcome {
            hash: hash.to_string(),
            released_bytes,
            already_absent,
            repinning: None,
        };
        Ok((outcome, repin))
    }

    /// Unpin gave up: the hash stays pinned and charged, under whatever
    /// expiry owners added while the unpin was in flight.
    async fn on_unpin_failure(&self, hash: &str, error: WardenError) -> WardenError {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(hash) {
            record.status = HandleStatus::Complete;
            self.expiry.register(hash, record.expiry).await;
        }
        tracing::error!("unpinning {} failed; keeping it pinned: {}", hash, error);
        error
    }

    /// Fetch or pin gave up: forget the hash and undo any charge.
    async fn on_workflow_failure(&self, hash: &str, error: WardenError) -> WardenError {
        let mut records = self.records.lock().await;
        if let Some(record) = records.remove(hash) {
            if let Some(charge) = &record.charged {
                self.ledger.release(&charge.principal, &charge.amount).await;
            }
        }
        tracing::error!("giving up on {}: {}", hash, error);
        error
    }

    pub async fn get(&self, hash: &str) -> Option<ContentHandle> {
        self.records.lock().await.get(&normalize_hash(hash)).cloned()
    }

    pub async fn report(&self) -> TrackerReport {
        let records = self.records.lock().await;
        let mut report = TrackerReport {
            tracked_hashes: records.len(),
            ..TrackerReport::default()
        };
        for record in records.values() {
            match record.status {
                HandleStatus::Pending => report.pending_hashes += 1,
                HandleStatus::Complete => report.pinned_hashes += 1,
                HandleStatus::Unpinning => report.unpinning_hashes += 1,
            }
        }
        report
    }
}
