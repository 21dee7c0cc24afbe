use crate::state_machine::{BatchAction, BatchStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Audit record of one accepted batch transition
///
/// Written in the same transaction as the compare-and-set that it records, so
/// the log and the batch row never disagree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTransition {
    pub batch_id: Uuid,
    pub from_status: BatchStatus,
    pub to_status: BatchStatus,
    pub action: BatchAction,
    pub actor: String,
    pub reason: Option<String>,
    /// Batch version after the transition
    pub version: i64,
    pub created_at: DateTime<Utc>,
}
