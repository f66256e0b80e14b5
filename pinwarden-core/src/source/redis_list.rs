use super::{LifecycleEventSource, SourcedEvent, decode_event};
use crate::{Result, WardenError};
use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::mpsc;

/// Replays JSON-encoded events stored in a Redis list, head to tail.
pub struct RedisListSource {
    name: String,
    url: String,
    list_key: String,
}

impl RedisListSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>, list_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            list_key: list_key.into(),
        }
    }
}

#[async_trait]
impl LifecycleEventSource for RedisListSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, sink: mpsc::Sender<SourcedEvent>) -> Result<()> {
        let client = redis::Client::open(self.url.as_str()).map_err(|error| {
            WardenError::Config(format!(
                "source {} redis connection config error: {}",
                self.name, error
            ))
        })?;

        let mut conn = client.get_multiplexed_async_connection().await?;
        let raw_entries: Vec<String> = conn.lrange(&self.list_key, 0, -1).await?;

        if raw_entries.is_empty() {
            tracing::info!(
                "source {} found redis list '{}' empty",
                self.name,
                self.list_key
            );
            return Ok(());
        }

        let mut delivered = 0usize;
        for raw in raw_entries {
            let Some(event) = decode_event(&self.name, &raw) else {
                continue;
            };

            let sourced = SourcedEvent {
                source: self.name.clone(),
                event,
            };
            if sink.send(sourced).await.is_err() {
                break;
            }
            delivered += 1;
        }

        tracing::info!(
            "source {} replayed {} events from redis list '{}'",
            self.name,
            delivered,
            self.list_key
        );
        Ok(())
    }
}
