//! Lifecycle event sources.
//!
//! Watchers for each monitored registry normalize what they observe into
//! [`LifecycleEvent`]s and push them into the orchestrator's channel.
//! Adapters are picked from a static table in [`SourceBuilder`].

pub mod channel;
pub mod factory;
pub mod jsonl;
pub mod redis_list;

pub use channel::ChannelSource;
pub use factory::SourceBuilder;
pub use jsonl::JsonLinesSource;
pub use redis_list::RedisListSource;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    HashAdded {
        contract_address: String,
        hash: String,
        /// Relative ttl in seconds; zero pins without expiry.
        #[serde(default)]
        ttl: u64,
        block_number: u64,
        sender: String,
    },
    HashRemoved {
        contract_address: String,
        hash: String,
        sender: String,
    },
    OwnerRegistered {
        contract_address: String,
        owner: String,
    },
    MemberAdded {
        principal: String,
    },
    LimitChanged {
        /// Decimal byte count.
        limit: String,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::HashAdded { .. } => "hash_added",
            LifecycleEvent::HashRemoved { .. } => "hash_removed",
            LifecycleEvent::OwnerRegistered { .. } => "owner_registered",
            LifecycleEvent::MemberAdded { .. } => "member_added",
            LifecycleEvent::LimitChanged { .. } => "limit_changed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourcedEvent {
    pub source: String,
    pub event: LifecycleEvent,
}

#[async_trait]
pub trait LifecycleEventSource: Send {
    fn name(&self) -> &str;

    /// Deliver events into `sink` until the source is drained or the sink closes.
    async fn run(self: Box<Self>, sink: mpsc::Sender<SourcedEvent>) -> Result<()>;
}

/// Decode one JSON-encoded event, logging and skipping anything malformed.
pub(crate) fn decode_event(source: &str, raw: &str) -> Option<LifecycleEvent> {
    match serde_json::from_str::<LifecycleEvent>(raw) {
        Ok(event) => Some(event),
        Err(error) => {
            tracing::warn!("source {} skipped malformed event {}: {}", source, raw, error);
            None
        }
    }
}
