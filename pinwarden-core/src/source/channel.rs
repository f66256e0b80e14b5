use super::{LifecycleEvent, LifecycleEventSource, SourcedEvent};
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// In-process source fed through an mpsc sender.
pub struct ChannelSource {
    name: String,
    receiver: mpsc::Receiver<LifecycleEvent>,
}

impl ChannelSource {
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Sender<LifecycleEvent>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                receiver,
            },
            sender,
        )
    }
}

#[async_trait]
impl LifecycleEventSource for ChannelSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(mut self: Box<Self>, sink: mpsc::Sender<SourcedEvent>) -> Result<()> {
        while let Some(event) = self.receiver.recv().await {
            let sourced = SourcedEvent {
                source: self.name.clone(),
                event,
            };
            if sink.send(sourced).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
