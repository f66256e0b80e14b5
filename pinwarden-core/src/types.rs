use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

/// Milliseconds since the unix epoch.
pub type Timestamp = i64;

/// Absolute point after which pinned content may be evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expiry {
    At(Timestamp),
    Unbounded,
}

impl Expiry {
    /// Resolve a relative ttl (seconds) against a block timestamp. Zero means no expiry.
    pub fn from_ttl(block_timestamp: Timestamp, ttl_secs: u64) -> Self {
        if ttl_secs == 0 {
            return Expiry::Unbounded;
        }

        let ttl_ms = i64::try_from(ttl_secs)
            .ok()
            .and_then(|secs| secs.checked_mul(1000));
        match ttl_ms.and_then(|ms| block_timestamp.checked_add(ms)) {
            Some(at) => Expiry::At(at),
            None => Expiry::Unbounded,
        }
    }

    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Expiry::At(at) => Some(*at),
            Expiry::Unbounded => None,
        }
    }

    pub fn is_past(&self, now: Timestamp) -> bool {
        matches!(self, Expiry::At(at) if *at <= now)
    }

    /// Latest-wins merge; unbounded beats any finite expiry.
    pub fn latest(self, other: Expiry) -> Expiry {
        self.max(other)
    }
}

impl Ord for Expiry {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Expiry::At(a), Expiry::At(b)) => a.cmp(b),
            (Expiry::At(_), Expiry::Unbounded) => Ordering::Less,
            (Expiry::Unbounded, Expiry::At(_)) => Ordering::Greater,
            (Expiry::Unbounded, Expiry::Unbounded) => Ordering::Equal,
        }
    }
}

impl PartialOrd for Expiry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Case-fold an address so the same account always maps to one ledger record.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Strip whitespace and a leading `/ipfs/` path prefix from a content hash.
pub fn normalize_hash(hash: &str) -> String {
    let trimmed = hash.trim();
    trimmed
        .strip_prefix("/ipfs/")
        .unwrap_or(trimmed)
        .to_string()
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Timestamp;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Timestamp {
        self.now.load(AtomicOrdering::SeqCst)
    }
}
