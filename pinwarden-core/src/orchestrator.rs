//! Event loop tying sources, the tracker, the sweep timer and the snapshot
//! timer together.
//!
//! Events are applied one at a time in arrival order. Applying an event only
//! does bookkeeping; fetch/pin/unpin and uncached block lookups always run in
//! spawned tasks, so a slow content store or chain never stalls the loop.

use crate::chain::{BlockTimestamps, ChainClient};
use crate::expiry::{ExpiryIndex, ExpirySettings};
use crate::operations::{
    ApplyEventOperation, ApplyEventOperationOutcome, ApplyEventOperationRequest,
    CollectSnapshotOperation, SweepExpiredOperation, SweepExpiredOperationRequest,
    SweepExpiredOperationResult,
};
use crate::ownership::OwnershipRegistry;
use crate::quota::QuotaLedger;
use crate::snapshot::WardenSnapshot;
use crate::source::{LifecycleEventSource, SourcedEvent};
use crate::storage::ContentStore;
use crate::throttle::{RequestThrottler, ThrottleSettings};
use crate::tracker::{AddReferenceOutcome, ReferenceTracker};
use crate::types::Clock;
use crate::Result;
use num_bigint::BigUint;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Byte limit applied to every principal.
    pub limit: BigUint,
    pub require_membership: bool,
    pub throttle: ThrottleSettings,
    pub expiry: ExpirySettings,
    pub sweep_interval: Duration,
    pub snapshot_interval: Duration,
    pub event_buffer: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            limit: BigUint::default(),
            require_membership: false,
            throttle: ThrottleSettings::default(),
            expiry: ExpirySettings::default(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    clock: Arc<dyn Clock>,
    ledger: Arc<QuotaLedger>,
    expiry: Arc<ExpiryIndex>,
    ownership: Arc<OwnershipRegistry>,
    tracker: Arc<ReferenceTracker>,
    apply_event: ApplyEventOperation,
    sweep_expired: SweepExpiredOperation,
    collect_snapshot: CollectSnapshotOperation,
    snapshot_tx: watch::Sender<Option<WardenSnapshot>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ContentStore>,
        chain: Arc<dyn ChainClient>,
        clock: Arc<dyn Clock>,
        settings: OrchestratorSettings,
    ) -> Self {
        let ledger = Arc::new(QuotaLedger::new(settings.limit.clone()));
        let expiry = Arc::new(ExpiryIndex::new(settings.expiry.clone()));
        let ownership = Arc::new(OwnershipRegistry::new());
        let throttler = Arc::new(RequestThrottler::new(store, settings.throttle.clone()));
        let tracker = Arc::new(ReferenceTracker::new(
            ledger.clone(),
            expiry.clone(),
            throttler.clone(),
            clock.clone(),
        ));

        let timestamps = Arc::new(BlockTimestamps::new(chain, settings.throttle.clone()));
        let apply_event = ApplyEventOperation::new(
            tracker.clone(),
            ledger.clone(),
            ownership.clone(),
            timestamps,
            settings.require_membership,
        );
        let sweep_expired = SweepExpiredOperation::new(tracker.clone(), expiry.clone());
        let collect_snapshot = CollectSnapshotOperation::new(
            ledger.clone(),
            tracker.clone(),
            expiry.clone(),
            throttler,
            ownership.clone(),
        );
        let (snapshot_tx, _) = watch::channel(None);

        Self {
            settings,
            clock,
            ledger,
            expiry,
            ownership,
            tracker,
            apply_event,
            sweep_expired,
            collect_snapshot,
            snapshot_tx,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &Arc<QuotaLedger> {
        &self.ledger
    }

    pub fn expiry(&self) -> &Arc<ExpiryIndex> {
        &self.expiry
    }

    pub fn ownership(&self) -> &Arc<OwnershipRegistry> {
        &self.ownership
    }

    pub fn tracker(&self) -> &Arc<ReferenceTracker> {
        &self.tracker
    }

    /// Latest published snapshot; `None` until the first snapshot tick.
    pub fn subscribe(&self) -> watch::Receiver<Option<WardenSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub async fn apply(&self, event: SourcedEvent) -> Result<ApplyEventOperationOutcome> {
        self.apply_event
            .run(ApplyEventOperationRequest {
                source: event.source,
                event: event.event,
            })
            .await
    }

    pub async fn sweep(&self) -> Result<SweepExpiredOperationResult> {
        self.sweep_expired
            .run(SweepExpiredOperationRequest {
                now: self.clock.now_ms(),
            })
            .await
    }

    pub async fn publish_snapshot(&self) -> Result<WardenSnapshot> {
        let snapshot = self.collect_snapshot.run().await?;
        match serde_json::to_string(&snapshot) {
            Ok(json) => tracing::info!("snapshot {}", json),
            Err(error) => tracing::warn!("failed to encode snapshot: {}", error),
        }
        self.snapshot_tx.send_replace(Some(snapshot.clone()));
        Ok(snapshot)
    }

    /// Drive every source until `shutdown` resolves. Sources that drain
    /// early simply stop contributing; timers keep running.
    pub async fn run<F>(
        &self,
        sources: Vec<Box<dyn LifecycleEventSource>>,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (event_tx, mut event_rx) = mpsc::channel(self.settings.event_buffer.max(1));

        let mut source_tasks = JoinSet::new();
        for source in sources {
            let sink = event_tx.clone();
            let name = source.name().to_string();
            tracing::info!("starting event source {}", name);
            source_tasks.spawn(async move {
                match source.run(sink).await {
                    Ok(()) => tracing::info!("event source {} finished", name),
                    Err(error) => tracing::error!("event source {} failed: {}", name, error),
                }
            });
        }
        drop(event_tx);

        let mut sweep_interval = tokio::time::interval_at(
            Instant::now() + self.settings.sweep_interval,
            self.settings.sweep_interval,
        );
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut snapshot_interval = tokio::time::interval_at(
            Instant::now() + self.settings.snapshot_interval,
            self.settings.snapshot_interval,
        );
        snapshot_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin!(shutdown);
        let mut events_open = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested");
                    break;
                }
                event = event_rx.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        events_open = false;
                        tracing::info!("all event sources drained");
                    }
                },
                _ = sweep_interval.tick() => {
                    if let Err(error) = self.sweep().await {
                        tracing::error!("expiry sweep failed: {}", error);
                    }
                }
                _ = snapshot_interval.tick() => {
                    if let Err(error) = self.publish_snapshot().await {
                        tracing::error!("snapshot failed: {}", error);
                    }
                }
            }
        }

        source_tasks.abort_all();
        self.publish_snapshot().await?;
        Ok(())
    }

    async fn handle_event(&self, event: SourcedEvent) {
        let source = event.source.clone();
        let kind = event.event.kind();

        match self.apply(event).await {
            Ok(ApplyEventOperationOutcome::Added {
                outcome: AddReferenceOutcome::Started(_),
                principal,
                ..
            }) => {
                tracing::debug!("{} from {} started a pin for {}", kind, source, principal);
            }
            Ok(ApplyEventOperationOutcome::AwaitingBlock {
                principal,
                block_number,
                ..
            }) => {
                tracing::debug!(
                    "{} from {} for {} waits on block {}",
                    kind,
                    source,
                    principal,
                    block_number
                );
            }
            Ok(outcome) => tracing::debug!("{} from {}: {:?}", kind, source, outcome),
            Err(error) => tracing::warn!("dropping {} event from {}: {}", kind, source, error),
        }
    }
}
