pub mod apply_event;
pub mod collect_snapshot;
pub mod sweep_expired;

pub use apply_event::{
    ApplyEventOperation, ApplyEventOperationOutcome, ApplyEventOperationRequest, parse_limit,
};
pub use collect_snapshot::CollectSnapshotOperation;
pub use sweep_expired::{
    SweepExpiredOperation, SweepExpiredOperationRequest, SweepExpiredOperationResult,
};
