use super::ContentStore;
use crate::throttle::Lane;
use crate::{Result, WardenError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct MemoryState {
    objects: HashMap<String, Bytes>,
    pinned: HashSet<String>,
    failures: HashMap<(Lane, String), u32>,
    calls: HashMap<(Lane, String), u32>,
    latency: Duration,
}

/// In-process content store with failure injection, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    state: Mutex<MemoryState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, hash: &str, data: impl Into<Bytes>) {
        self.state
            .lock()
            .await
            .objects
            .insert(hash.to_string(), data.into());
    }

    /// Make the next `count` calls of `lane` for `hash` fail with a transient error.
    pub async fn fail_next(&self, lane: Lane, hash: &str, count: u32) {
        self.state
            .lock()
            .await
            .failures
            .insert((lane, hash.to_string()), count);
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.state.lock().await.latency = latency;
    }

    pub async fn calls(&self, lane: Lane, hash: &str) -> u32 {
        self.state
            .lock()
            .await
            .calls
            .get(&(lane, hash.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub async fn is_pinned(&self, hash: &str) -> bool {
        self.state.lock().await.pinned.contains(hash)
    }

    pub async fn pinned_count(&self) -> usize {
        self.state.lock().await.pinned.len()
    }

    pub async fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn begin(&self, lane: Lane, hash: &str) -> Result<()> {
        let latency = {
            let mut state = self.state.lock().await;
            *state.calls.entry((lane, hash.to_string())).or_insert(0) += 1;

            if let Some(remaining) = state.failures.get_mut(&(lane, hash.to_string())) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(WardenError::Store(format!(
                        "injected {} failure for {}",
                        lane, hash
                    )));
                }
            }
            state.latency
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn fetch(&self, hash: &str) -> Result<Bytes> {
        self.begin(Lane::Fetch, hash).await?;
        self.state
            .lock()
            .await
            .objects
            .get(hash)
            .cloned()
            .ok_or_else(|| WardenError::Store(format!("content {} not available", hash)))
    }

    async fn pin_add(&self, hash: &str) -> Result<()> {
        self.begin(Lane::PinAdd, hash).await?;
        self.state.lock().await.pinned.insert(hash.to_string());
        Ok(())
    }

    async fn pin_remove(&self, hash: &str) -> Result<()> {
        self.begin(Lane::PinRemove, hash).await?;
        if self.state.lock().await.pinned.remove(hash) {
            Ok(())
        } else {
            Err(WardenError::NotPinned(hash.to_string()))
        }
    }
}
