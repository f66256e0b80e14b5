//! Epoch-bucketed expiry tracking.
//!
//! Hashes are grouped by `floor(expiry / epoch_duration)` so a sweep only
//! touches buckets at or before the current epoch instead of every pinned
//! hash. Buckets are kept in a `BTreeMap` and dropped once empty, which
//! means buckets skipped by a late or missed sweep are still visited.

use crate::types::{Expiry, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;

pub const DEFAULT_EPOCH_DURATION_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirySettings {
    pub epoch_duration_ms: i64,
}

impl Default for ExpirySettings {
    fn default() -> Self {
        Self {
            epoch_duration_ms: DEFAULT_EPOCH_DURATION_MS,
        }
    }
}

#[derive(Debug, Default)]
struct IndexState {
    hash_to_expiry: HashMap<String, Timestamp>,
    epoch_to_hashes: BTreeMap<i64, HashSet<String>>,
}

impl IndexState {
    fn detach(&mut self, hash: &str, epoch: i64) {
        if let Some(bucket) = self.epoch_to_hashes.get_mut(&epoch) {
            bucket.remove(hash);
            if bucket.is_empty() {
                self.epoch_to_hashes.remove(&epoch);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryReport {
    pub entries: usize,
    pub buckets: usize,
}

pub struct ExpiryIndex {
    epoch_duration_ms: i64,
    state: Mutex<IndexState>,
}

impl ExpiryIndex {
    pub fn new(settings: ExpirySettings) -> Self {
        Self {
            epoch_duration_ms: settings.epoch_duration_ms.max(1),
            state: Mutex::new(IndexState::default()),
        }
    }

    pub fn epoch_of(&self, timestamp: Timestamp) -> i64 {
        timestamp.div_euclid(self.epoch_duration_ms)
    }

    /// Record an expiry for `hash`. A later expiry replaces an earlier one;
    /// an earlier one is ignored. `Unbounded` takes the hash out of the index.
    pub async fn register(&self, hash: &str, expiry: Expiry) {
        let mut state = self.state.lock().await;

        let Expiry::At(at) = expiry else {
            if let Some(previous) = state.hash_to_expiry.remove(hash) {
                let epoch = self.epoch_of(previous);
                state.detach(hash, epoch);
            }
            return;
        };

        match state.hash_to_expiry.get(hash).copied() {
            Some(previous) if previous >= at => {}
            previous => {
                if let Some(previous) = previous {
                    let epoch = self.epoch_of(previous);
                    state.detach(hash, epoch);
                }

                state.hash_to_expiry.insert(hash.to_string(), at);
                state
                    .epoch_to_hashes
                    .entry(self.epoch_of(at))
                    .or_default()
                    .insert(hash.to_string());
            }
        }
    }

    pub async fn remove(&self, hash: &str) {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.hash_to_expiry.remove(hash) {
            let epoch = self.epoch_of(previous);
            state.detach(hash, epoch);
        }
    }

    pub async fn expiry_of(&self, hash: &str) -> Option<Timestamp> {
        self.state.lock().await.hash_to_expiry.get(hash).copied()
    }

    /// Hashes whose recorded expiry is `<= now`. Entries stay indexed until the
    /// caller confirms eviction through [`ExpiryIndex::remove`].
    pub async fn sweep(&self, now: Timestamp) -> Vec<String> {
        let current_epoch = self.epoch_of(now);
        let state = self.state.lock().await;

        let mut expired: Vec<String> = state
            .epoch_to_hashes
            .range(..=current_epoch)
            .flat_map(|(_, bucket)| bucket.iter())
            .filter(|hash| {
                state
                    .hash_to_expiry
                    .get(hash.as_str())
                    .is_some_and(|at| *at <= now)
            })
            .cloned()
            .collect();
        expired.sort();

        tracing::debug!(
            "sweep at epoch {} found {} expired hashes",
            current_epoch,
            expired.len()
        );
        expired
    }

    pub async fn report(&self) -> ExpiryReport {
        let state = self.state.lock().await;
        ExpiryReport {
            entries: state.hash_to_expiry.len(),
            buckets: state.epoch_to_hashes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: i64 = 60 * 60 * 1000;

    fn index() -> ExpiryIndex {
        ExpiryIndex::new(ExpirySettings::default())
    }

    #[tokio::test]
    async fn test_sweep_boundary() {
        let index = index();
        let t0 = 1_700_000_000_000;
        index.register("QmA", Expiry::At(t0 + 3_600_000)).await;

        assert!(index.sweep(t0 + 3_599_000).await.is_empty());
        assert_eq!(index.sweep(t0 + 3_601_000).await, vec!["QmA".to_string()]);
        assert_eq!(index.sweep(t0 + 3_600_000).await, vec!["QmA".to_string()]);
    }

    #[tokio::test]
    async fn test_sweep_leaves_unexpired_entries() {
        let index = index();
        let now = 10 * HOUR + 30 * 60 * 1000;
        index.register("expired", Expiry::At(now - 1)).await;
        index.register("same-epoch-later", Expiry::At(now + 1)).await;
        index.register("next-epoch", Expiry::At(now + HOUR)).await;

        assert_eq!(index.sweep(now).await, vec!["expired".to_string()]);
        assert_eq!(index.report().await.entries, 3);
    }

    #[tokio::test]
    async fn test_latest_expiry_wins() {
        let index = index();
        index.register("QmB", Expiry::At(2 * HOUR)).await;
        index.register("QmB", Expiry::At(5 * HOUR)).await;
        index.register("QmB", Expiry::At(3 * HOUR)).await;

        assert_eq!(index.expiry_of("QmB").await, Some(5 * HOUR));
        let report = index.report().await;
        assert_eq!(report.entries, 1);
        assert_eq!(report.buckets, 1);
        assert!(index.sweep(4 * HOUR).await.is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_is_never_indexed() {
        let index = index();
        index.register("QmC", Expiry::Unbounded).await;
        assert_eq!(index.expiry_of("QmC").await, None);

        index.register("QmC", Expiry::At(HOUR)).await;
        index.register("QmC", Expiry::Unbounded).await;
        assert_eq!(index.report().await, ExpiryReport { entries: 0, buckets: 0 });
    }

    #[tokio::test]
    async fn test_missed_epochs_are_still_swept() {
        let index = index();
        index.register("old", Expiry::At(HOUR + 5)).await;
        index.register("older", Expiry::At(5)).await;

        let swept = index.sweep(7 * HOUR).await;
        assert_eq!(swept, vec!["old".to_string(), "older".to_string()]);

        index.remove("old").await;
        index.remove("older").await;
        assert_eq!(index.report().await, ExpiryReport { entries: 0, buckets: 0 });
    }
}
