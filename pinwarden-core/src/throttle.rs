//! Bounded-concurrency lanes in front of the content store.
//!
//! Each lane owns a fair semaphore, so waiting tasks are served in
//! submission order. A failed attempt gives its permit back before the
//! backoff sleep and queues again afterwards, so a flapping hash never pins
//! a worker slot while it waits.

use crate::snapshot::LaneReport;
use crate::storage::ContentStore;
use crate::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lane {
    Fetch,
    PinAdd,
    PinRemove,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::Fetch, Lane::PinAdd, Lane::PinRemove];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Fetch => "fetch",
            Lane::PinAdd => "pin-add",
            Lane::PinRemove => "pin-remove",
        }
    }

    fn index(&self) -> usize {
        match self {
            Lane::Fetch => 0,
            Lane::PinAdd => 1,
            Lane::PinRemove => 2,
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleSettings {
    pub fetch_concurrency: usize,
    pub pin_concurrency: usize,
    pub unpin_concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            fetch_concurrency: 5,
            pin_concurrency: 5,
            unpin_concurrency: 5,
            max_attempts: 15,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl ThrottleSettings {
    fn concurrency(&self, lane: Lane) -> usize {
        let workers = match lane {
            Lane::Fetch => self.fetch_concurrency,
            Lane::PinAdd => self.pin_concurrency,
            Lane::PinRemove => self.unpin_concurrency,
        };
        workers.max(1)
    }

    /// `attempt² × base`, attempt counted from 1.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(attempt.saturating_mul(attempt))
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: Ulid,
    pub hash: String,
    pub lane: Lane,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinRemoval {
    Removed,
    NotPinned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutput {
    Fetched { size: u64 },
    Pinned,
    Unpinned(PinRemoval),
}

struct LaneState {
    semaphore: Semaphore,
    queued: AtomicUsize,
    running: AtomicUsize,
    retrying: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl LaneState {
    fn new(workers: usize) -> Self {
        Self {
            semaphore: Semaphore::new(workers),
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            retrying: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }
}

/// Decrements a gauge when dropped, so cancelled futures leave counters intact.
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct RequestThrottler {
    store: Arc<dyn ContentStore>,
    settings: ThrottleSettings,
    lanes: [LaneState; 3],
}

impl RequestThrottler {
    pub fn new(store: Arc<dyn ContentStore>, settings: ThrottleSettings) -> Self {
        let lanes = Lane::ALL.map(|lane| LaneState::new(settings.concurrency(lane)));
        Self {
            store,
            settings,
            lanes,
        }
    }

    pub fn settings(&self) -> &ThrottleSettings {
        &self.settings
    }

    /// Run `lane` for `hash` until it succeeds, fails with a non-retryable
    /// error, or exhausts `max_attempts`.
    pub async fn submit(&self, lane: Lane, hash: &str) -> Result<TaskOutput> {
        let state = &self.lanes[lane.index()];
        let mut task = Task {
            id: Ulid::new(),
            hash: hash.to_string(),
            lane,
            attempt: 0,
        };

        loop {
            task.attempt += 1;

            match self.run_attempt(state, &task).await {
                Ok(output) => {
                    state.completed.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(
                        "task {} {} {} completed on attempt {}",
                        task.id,
                        lane,
                        task.hash,
                        task.attempt
                    );
                    return Ok(output);
                }
                Err(error) if !error.is_retryable() => {
                    state.failed.fetch_add(1, Ordering::SeqCst);
                    return Err(error);
                }
                Err(error) if task.attempt >= self.settings.max_attempts => {
                    state.failed.fetch_add(1, Ordering::SeqCst);
                    tracing::error!(
                        "task {} {} {} giving up after {} attempts: {}",
                        task.id,
                        lane,
                        task.hash,
                        task.attempt,
                        error
                    );
                    return Err(WardenError::RetriesExhausted {
                        lane: lane.to_string(),
                        hash: task.hash,
                        attempts: task.attempt,
                        last_error: error.to_string(),
                    });
                }
                Err(error) => {
                    let delay = self.settings.backoff(task.attempt);
                    tracing::warn!(
                        "task {} {} {} attempt {} failed: {}; retrying in {:?}",
                        task.id,
                        lane,
                        task.hash,
                        task.attempt,
                        error,
                        delay
                    );
                    let _retrying = Gauge::enter(&state.retrying);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn run_attempt(&self, state: &LaneState, task: &Task) -> Result<TaskOutput> {
        let permit = {
            let _queued = Gauge::enter(&state.queued);
            state
                .semaphore
                .acquire()
                .await
                .map_err(|error| WardenError::Internal(format!("lane closed: {}", error)))?
        };

        let _running = Gauge::enter(&state.running);
        let output = match task.lane {
            Lane::Fetch => {
                let bytes = self.store.fetch(&task.hash).await?;
                TaskOutput::Fetched {
                    size: bytes.len() as u64,
                }
            }
            Lane::PinAdd => {
                self.store.pin_add(&task.hash).await?;
                TaskOutput::Pinned
            }
            Lane::PinRemove => match self.store.pin_remove(&task.hash).await {
                Ok(()) => TaskOutput::Unpinned(PinRemoval::Removed),
                Err(WardenError::NotPinned(_)) => {
                    tracing::warn!("hash {} was already unpinned", task.hash);
                    TaskOutput::Unpinned(PinRemoval::NotPinned)
                }
                Err(error) => return Err(error),
            },
        };
        drop(permit);

        Ok(output)
    }

    pub fn report(&self) -> Vec<LaneReport> {
        Lane::ALL
            .iter()
            .map(|lane| {
                let state = &self.lanes[lane.index()];
                LaneReport {
                    lane: lane.to_string(),
                    queue_length: state.queued.load(Ordering::SeqCst),
                    running: state.running.load(Ordering::SeqCst),
                    retrying: state.retrying.load(Ordering::SeqCst),
                    completed_count: state.completed.load(Ordering::SeqCst),
                    failed_count: state.failed.load(Ordering::SeqCst),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryContentStore;
    use tokio::sync::Mutex;

    fn fast_settings(max_attempts: u32) -> ThrottleSettings {
        ThrottleSettings {
            max_attempts,
            backoff_base: Duration::from_micros(10),
            ..ThrottleSettings::default()
        }
    }

    #[test]
    fn test_backoff_is_quadratic() {
        let settings = ThrottleSettings::default();
        assert_eq!(settings.backoff(1), Duration::from_secs(1));
        assert_eq!(settings.backoff(3), Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_fetch_reports_size() {
        let store = Arc::new(MemoryContentStore::new());
        store.put("QmA", vec![7u8; 42]).await;
        let throttler = RequestThrottler::new(store, fast_settings(3));

        let output = throttler.submit(Lane::Fetch, "QmA").await.unwrap();
        assert_eq!(output, TaskOutput::Fetched { size: 42 });
        assert_eq!(throttler.report()[0].completed_count, 1);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = Arc::new(MemoryContentStore::new());
        store.put("QmB", vec![1u8; 8]).await;
        store.fail_next(Lane::Fetch, "QmB", 2).await;
        let throttler = RequestThrottler::new(store.clone(), fast_settings(5));

        let output = throttler.submit(Lane::Fetch, "QmB").await.unwrap();
        assert_eq!(output, TaskOutput::Fetched { size: 8 });
        assert_eq!(store.calls(Lane::Fetch, "QmB").await, 3);
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let store = Arc::new(MemoryContentStore::new());
        store.put("QmC", vec![1u8; 8]).await;
        store.fail_next(Lane::Fetch, "QmC", 15).await;
        let throttler = RequestThrottler::new(store.clone(), fast_settings(15));

        let error = throttler.submit(Lane::Fetch, "QmC").await.unwrap_err();
        assert!(matches!(
            error,
            WardenError::RetriesExhausted { attempts: 15, .. }
        ));
        assert_eq!(store.calls(Lane::Fetch, "QmC").await, 15);

        let fetch = &throttler.report()[0];
        assert_eq!(fetch.failed_count, 1);
        assert_eq!(fetch.running, 0);
        assert_eq!(fetch.retrying, 0);
    }

    #[tokio::test]
    async fn test_unpin_of_missing_hash_succeeds() {
        let store = Arc::new(MemoryContentStore::new());
        let throttler = RequestThrottler::new(store.clone(), fast_settings(3));

        let output = throttler.submit(Lane::PinRemove, "QmGone").await.unwrap();
        assert_eq!(output, TaskOutput::Unpinned(PinRemoval::NotPinned));
        assert_eq!(store.calls(Lane::PinRemove, "QmGone").await, 1);
    }

    #[tokio::test]
    async fn test_lane_concurrency_is_bounded() {
        let store = Arc::new(MemoryContentStore::new());
        store.set_latency(Duration::from_millis(20)).await;
        for i in 0..12 {
            store.put(&format!("Qm{}", i), vec![0u8; 4]).await;
        }

        let throttler = Arc::new(RequestThrottler::new(
            store.clone(),
            ThrottleSettings {
                fetch_concurrency: 3,
                ..fast_settings(2)
            },
        ));

        let mut handles = Vec::new();
        for i in 0..12 {
            let throttler = throttler.clone();
            handles.push(tokio::spawn(async move {
                throttler.submit(Lane::Fetch, &format!("Qm{}", i)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(store.max_in_flight().await <= 3);
        assert_eq!(throttler.report()[0].completed_count, 12);
    }

    #[tokio::test]
    async fn test_backoff_releases_the_worker_slot() {
        let store = Arc::new(MemoryContentStore::new());
        store.put("QmA", vec![0u8; 3]).await;
        store.put("QmB", vec![0u8; 5]).await;
        store.fail_next(Lane::Fetch, "QmA", 1).await;

        let throttler = Arc::new(RequestThrottler::new(
            store.clone(),
            ThrottleSettings {
                fetch_concurrency: 1,
                max_attempts: 3,
                backoff_base: Duration::from_millis(500),
                ..ThrottleSettings::default()
            },
        ));

        let first = {
            let throttler = throttler.clone();
            tokio::spawn(async move { throttler.submit(Lane::Fetch, "QmA").await })
        };
        while throttler.report()[0].retrying == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.calls(Lane::Fetch, "QmA").await, 1);

        // The only slot is free while QmA sleeps off its backoff.
        let output = tokio::time::timeout(
            Duration::from_millis(250),
            throttler.submit(Lane::Fetch, "QmB"),
        )
        .await
        .expect("QmB waited behind a task in backoff")
        .unwrap();
        assert_eq!(output, TaskOutput::Fetched { size: 5 });
        assert_eq!(store.calls(Lane::Fetch, "QmA").await, 1);

        assert_eq!(
            first.await.unwrap().unwrap(),
            TaskOutput::Fetched { size: 3 }
        );
        assert_eq!(store.calls(Lane::Fetch, "QmA").await, 2);
    }

    #[tokio::test]
    async fn test_waiting_tasks_run_in_submission_order() {
        let store = Arc::new(MemoryContentStore::new());
        store.set_latency(Duration::from_millis(100)).await;
        for i in 0..5 {
            store.put(&format!("Qm{}", i), vec![0u8; 4]).await;
        }

        let throttler = Arc::new(RequestThrottler::new(
            store.clone(),
            ThrottleSettings {
                fetch_concurrency: 1,
                ..fast_settings(1)
            },
        ));
        let finished = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let task_throttler = throttler.clone();
            let finished = finished.clone();
            handles.push(tokio::spawn(async move {
                let hash = format!("Qm{}", i);
                task_throttler.submit(Lane::Fetch, &hash).await.unwrap();
                finished.lock().await.push(hash);
            }));

            // Qm0 takes the slot; every later task queues behind the previous one.
            loop {
                let fetch = &throttler.report()[0];
                if fetch.running == 1 && fetch.queue_length == i {
                    break;
                }
                tokio::task::yield_now().await;
            }
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let expected: Vec<String> = (0..5).map(|i| format!("Qm{}", i)).collect();
        assert_eq!(*finished.lock().await, expected);
    }
}
