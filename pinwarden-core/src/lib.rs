//! Pinwarden Core - control plane for a quota-bounded pinning cache
//!
//! Watches registry lifecycle events and decides, per principal, which
//! content hashes to fetch and pin:
//! - bounded-concurrency lanes with retry/backoff in front of the content store
//! - per-principal byte quotas with atomic reservation
//! - epoch-bucketed ttl expiry with periodic sweeps
//! - multi-owner reference tracking so each hash is pinned and unpinned once

pub mod chain;
pub mod error;
pub mod expiry;
pub mod operations;
pub mod orchestrator;
pub mod ownership;
pub mod quota;
pub mod snapshot;
pub mod source;
pub mod storage;
pub mod throttle;
pub mod tracker;
pub mod types;

pub use chain::{BlockTimestamps, ChainClient, JsonRpcChainClient, StaticChainClient};
pub use error::{Result, WardenError};
pub use expiry::{DEFAULT_EPOCH_DURATION_MS, ExpiryIndex, ExpiryReport, ExpirySettings};
pub use operations::*;
pub use orchestrator::{
    DEFAULT_EVENT_BUFFER, DEFAULT_SNAPSHOT_INTERVAL, DEFAULT_SWEEP_INTERVAL, Orchestrator,
    OrchestratorSettings,
};
pub use ownership::OwnershipRegistry;
pub use quota::QuotaLedger;
pub use snapshot::{LaneReport, PrincipalReport, TrackerReport, WardenSnapshot};
pub use source::{
    ChannelSource, JsonLinesSource, LifecycleEvent, LifecycleEventSource, RedisListSource,
    SourceBuilder, SourcedEvent, factory::SourceConfig,
};
pub use storage::{ContentStore, IpfsHttpStore, MemoryContentStore};
pub use throttle::{Lane, PinRemoval, RequestThrottler, Task, TaskOutput, ThrottleSettings};
pub use tracker::{
    AddReferenceOutcome, AddReferenceRequest, ContentHandle, HandleStatus, PinnedContent,
    ReferenceTracker, RemoveReferenceOutcome, UnpinHandle, UnpinOutcome, WorkflowHandle,
};
pub use types::{Clock, Expiry, ManualClock, SystemClock, Timestamp, normalize_address, normalize_hash};
