use super::{LifecycleEventSource, SourcedEvent, decode_event};
use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::mpsc;

/// Replays newline-delimited JSON events from a file, in file order.
pub struct JsonLinesSource {
    name: String,
    path: PathBuf,
}

impl JsonLinesSource {
    pub fn new(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            name: name.into(),
            path,
        }
    }
}

#[async_trait]
impl LifecycleEventSource for JsonLinesSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, sink: mpsc::Sender<SourcedEvent>) -> Result<()> {
        let content = tokio::fs::read_to_string(&self.path).await?;

        let mut delivered = 0usize;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some(event) = decode_event(&self.name, line) else {
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
            "source {} replayed {} events from {:?}",
            self.name,
            delivered,
            self.path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LifecycleEvent;
    use std::io::Write;

    #[tokio::test]
    async fn test_replays_valid_lines_in_order() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# replay log").unwrap();
        writeln!(file, r#"{{"event":"member_added","principal":"0xA"}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file, r#"{{"event":"limit_changed","limit":"4096"}}"#).unwrap();

        let source = Box::new(JsonLinesSource::new("replay", file.path().to_path_buf()));
        let (sink, mut receiver) = mpsc::channel(8);
        source.run(sink).await.unwrap();

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.source, "replay");
        assert_eq!(
            first.event,
            LifecycleEvent::MemberAdded {
                principal: "0xA".to_string()
            }
        );
        let second = receiver.recv().await.unwrap();
        assert_eq!(
            second.event,
            LifecycleEvent::LimitChanged {
                limit: "4096".to_string()
            }
        );
        assert!(receiver.recv().await.is_none());
    }
}
