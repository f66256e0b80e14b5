use crate::chain::BlockTimestamps;
use crate::ownership::OwnershipRegistry;
use crate::quota::QuotaLedger;
use crate::source::LifecycleEvent;
use crate::tracker::{
    AddReferenceOutcome, AddReferenceRequest, ReferenceTracker, RemoveReferenceOutcome,
};
use crate::types::{Expiry, normalize_address, normalize_hash};
use crate::{Result, WardenError};
use num_bigint::BigUint;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct ApplyEventOperation {
    tracker: Arc<ReferenceTracker>,
    ledger: Arc<QuotaLedger>,
    ownership: Arc<OwnershipRegistry>,
    timestamps: Arc<BlockTimestamps>,
    pending: Arc<Mutex<PendingAdds>>,
    require_membership: bool,
}

#[derive(Debug, Clone)]
pub struct ApplyEventOperationRequest {
    pub source: String,
    pub event: LifecycleEvent,
}

#[derive(Debug)]
pub enum ApplyEventOperationOutcome {
    Added {
        principal: String,
        expiry: Expiry,
        outcome: AddReferenceOutcome,
    },
    /// Block timestamp was not cached; the add is applied by `handle` once it
    /// resolves. The handle yields `None` if a removal of the same hash by the
    /// same owner was applied in the meantime.
    AwaitingBlock {
        principal: String,
        block_number: u64,
        handle: JoinHandle<Result<Option<ApplyEventOperationOutcome>>>,
    },
    Removed(RemoveReferenceOutcome),
    OwnerRegistered {
        owner: String,
        changed: bool,
    },
    MemberAdded(String),
    LimitChanged(BigUint),
    /// Principal has no ledger record while membership is required.
    Rejected {
        principal: String,
    },
}

/// Adds waiting on a block timestamp, keyed by (hash, owner).
///
/// Every key carries a generation. A removal drops the key, so adds entered
/// under the old generation find it gone and give up.
#[derive(Debug, Default)]
struct PendingAdds {
    next_generation: u64,
    entries: HashMap<(String, String), (u64, usize)>,
}

impl PendingAdds {
    fn enter(&mut self, key: (String, String)) -> u64 {
        let next = self.next_generation + 1;
        let entry = self.entries.entry(key).or_insert((next, 0));
        if entry.0 == next {
            self.next_generation = next;
        }
        entry.1 += 1;
        entry.0
    }

    /// Whether the add entered under `generation` is still wanted.
    fn leave(&mut self, key: &(String, String), generation: u64) -> bool {
        match self.entries.get_mut(key) {
            Some((current, waiting)) if *current == generation => {
                *waiting -= 1;
                if *waiting == 0 {
                    self.entries.remove(key);
                }
                true
            }
            _ => false,
        }
    }

    fn cancel(&mut self, key: &(String, String)) -> bool {
        self.entries.remove(key).is_some()
    }
}

impl ApplyEventOperation {
    pub fn new(
        tracker: Arc<ReferenceTracker>,
        ledger: Arc<QuotaLedger>,
        ownership: Arc<OwnershipRegistry>,
        timestamps: Arc<BlockTimestamps>,
        require_membership: bool,
    ) -> Self {
        Self {
            tracker,
            ledger,
            ownership,
            timestamps,
            pending: Arc::new(Mutex::new(PendingAdds::default())),
            require_membership,
        }
    }

    pub async fn run(
        &self,
        request: ApplyEventOperationRequest,
    ) -> Result<ApplyEventOperationOutcome> {
        let ApplyEventOperationRequest { source, event } = request;
        tracing::debug!("applying {} event from {}", event.kind(), source);

        match event {
            LifecycleEvent::HashAdded {
                contract_address,
                hash,
                ttl,
                block_number,
                sender,
            } => {
                let principal = self.ownership.resolve(&contract_address, &sender).await;

                if self.require_membership && !self.ledger.contains(&principal).await {
                    tracing::warn!(
                        "ignoring {} from {}: {} is not a member",
                        hash,
                        contract_address,
                        principal
                    );
                    return Ok(ApplyEventOperationOutcome::Rejected { principal });
                }

                let request = AddReferenceRequest {
                    hash,
                    owner: contract_address,
                    principal,
                    expiry: Expiry::Unbounded,
                };

                if ttl == 0 {
                    return Ok(self.add(request).await);
                }

                if let Some(block_timestamp) = self.timestamps.cached(block_number).await {
                    let request = AddReferenceRequest {
                        expiry: Expiry::from_ttl(block_timestamp, ttl),
                        ..request
                    };
                    return Ok(self.add(request).await);
                }

                let principal = request.principal.clone();
                let handle = self.spawn_add(request, ttl, block_number).await;
                Ok(ApplyEventOperationOutcome::AwaitingBlock {
                    principal,
                    block_number,
                    handle,
                })
            }
            LifecycleEvent::HashRemoved {
                contract_address,
                hash,
                ..
            } => {
                let key = (normalize_hash(&hash), normalize_address(&contract_address));
                if self.pending.lock().await.cancel(&key) {
                    tracing::info!(
                        "cancelled pending add of {} by {}: removed before its block resolved",
                        key.0,
                        key.1
                    );
                }
                let outcome = self.tracker.remove_reference(&hash, &contract_address).await;
                Ok(ApplyEventOperationOutcome::Removed(outcome))
            }
            LifecycleEvent::OwnerRegistered {
                contract_address,
                owner,
            } => {
                let changed = self.ownership.set_owner(&contract_address, &owner).await;
                if !changed {
                    tracing::warn!(
                        "contract {} already has an owner; ignoring {}",
                        contract_address,
                        owner
                    );
                }
                Ok(ApplyEventOperationOutcome::OwnerRegistered {
                    owner: normalize_address(&owner),
                    changed,
                })
            }
            LifecycleEvent::MemberAdded { principal } => {
                let principal = normalize_address(&principal);
                self.ledger.ensure(&principal).await;
                Ok(ApplyEventOperationOutcome::MemberAdded(principal))
            }
            LifecycleEvent::LimitChanged { limit } => {
                let limit = parse_limit(&limit)?;
                tracing::info!("per-principal limit changed to {} bytes", limit);
                self.ledger.set_limit(limit.clone()).await;
                Ok(ApplyEventOperationOutcome::LimitChanged(limit))
            }
        }
    }

    async fn add(&self, request: AddReferenceRequest) -> ApplyEventOperationOutcome {
        let principal = request.principal.clone();
        let expiry = request.expiry;
        let outcome = self.tracker.add_reference(request).await;
        ApplyEventOperationOutcome::Added {
            principal,
            expiry,
            outcome,
        }
    }

    /// Resolve the block off the caller's task, then apply the add unless a
    /// removal cancelled it first.
    async fn spawn_add(
        &self,
        request: AddReferenceRequest,
        ttl: u64,
        block_number: u64,
    ) -> JoinHandle<Result<Option<ApplyEventOperationOutcome>>> {
        let key = (
            normalize_hash(&request.hash),
            normalize_address(&request.owner),
        );
        let generation = self.pending.lock().await.enter(key.clone());
        let operation = self.clone();

        tokio::spawn(async move {
            let resolved = operation.timestamps.resolve(block_number).await;

            // Held across the add so a removal is applied strictly before or after it.
            let mut pending = operation.pending.lock().await;
            if !pending.leave(&key, generation) {
                tracing::debug!("add of {} by {} was cancelled", key.0, key.1);
                return Ok(None);
            }

            let block_timestamp = match resolved {
                Ok(timestamp) => timestamp,
                Err(error) => {
                    tracing::warn!(
                        "dropping add of {} by {}: block {} unavailable: {}",
                        key.0,
                        key.1,
                        block_number,
                        error
                    );
                    return Err(error);
                }
            };

            let request = AddReferenceRequest {
                expiry: Expiry::from_ttl(block_timestamp, ttl),
                ..request
            };
            let outcome = operation.add(request).await;
            drop(pending);
            tracing::debug!("deferred add of {} by {}: {:?}", key.0, key.1, outcome);
            Ok(Some(outcome))
        })
    }
}

/// Parse a decimal byte count.
pub fn parse_limit(raw: &str) -> Result<BigUint> {
    let raw = raw.trim();
    raw.parse::<BigUint>()
        .map_err(|error| WardenError::InvalidRequest(format!("invalid byte limit {:?}: {}", raw, error)))
}
