//! # System Constants
//!
//! Event names, actor names and defaults shared across the orchestration
//! engine.

/// Lifecycle events broadcast by the [`crate::events::EventPublisher`]
pub mod events {
    // Batch lifecycle events
    pub const BATCH_CREATED: &str = "batch.created";
    pub const BATCH_TRANSITIONED: &str = "batch.transitioned";
    pub const BATCH_STAGED: &str = "batch.staged";
    pub const BATCH_STAGING_FAILED: &str = "batch.staging_failed";
    pub const BATCH_COMPLETED: &str = "batch.completed";
    pub const BATCH_CANCELLED: &str = "batch.cancelled";
    pub const BATCH_PROGRESS: &str = "batch.progress";

    // Work item events
    pub const WORK_ITEM_CLAIMED: &str = "work_item.claimed";
    pub const WORK_ITEM_SUBMITTED: &str = "work_item.submitted";
    pub const WORK_ITEM_SUCCEEDED: &str = "work_item.succeeded";
    pub const WORK_ITEM_FAILED: &str = "work_item.failed";
    pub const WORK_ITEM_TIMED_OUT: &str = "work_item.timed_out";
    pub const WORK_ITEMS_REQUEUED: &str = "work_item.requeued";

    // Recovery events
    pub const RECOVERY_COMPLETED: &str = "recovery.completed";
}

/// Actor names recorded in the transition log for engine-initiated changes
pub mod actors {
    pub const OPERATOR: &str = "operator";
    pub const DISPATCHER: &str = "dispatcher";
    pub const AGGREGATOR: &str = "aggregator";
    pub const RECOVERY_MANAGER: &str = "recovery_manager";
    pub const STAGING: &str = "staging";
}

/// Defaults for tunables that are not worth a configuration entry
pub mod system {
    /// Retries of an engine-initiated transition after a version conflict
    pub const DEFAULT_MAX_CAS_RETRIES: u32 = 3;

    /// Capacity of the lifecycle event broadcast channel
    pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 1000;
}
