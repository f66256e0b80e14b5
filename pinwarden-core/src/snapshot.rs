use serde::{Deserialize, Serialize};

/// Usage line for one principal. Byte counts are decimal strings so they
/// survive JSON consumers without precision loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrincipalReport {
    pub principal: String,
    pub used: String,
    pub limit: String,
    pub used_percent: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneReport {
    pub lane: String,
    pub queue_length: usize,
    pub running: usize,
    pub retrying: usize,
    pub completed_count: u64,
    pub failed_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerReport {
    pub tracked_hashes: usize,
    pub pinned_hashes: usize,
    pub pending_hashes: usize,
    pub unpinning_hashes: usize,
}

/// Read-only view of every component, built explicitly for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WardenSnapshot {
    pub taken_at: chrono::DateTime<chrono::Utc>,
    pub limit: String,
    pub principals: Vec<PrincipalReport>,
    pub tracked_hashes: usize,
    pub pinned_hashes: usize,
    pub pending_hashes: usize,
    pub unpinning_hashes: usize,
    pub expiry_entries: usize,
    pub expiry_buckets: usize,
    pub lanes: Vec<LaneReport>,
    pub ownership_entries: usize,
}
