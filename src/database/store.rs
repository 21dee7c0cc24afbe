//! # Persistence Contract
//!
//! [`BatchStore`] is the single source of truth for batches and work items.
//! Implementations must provide two primitives at row granularity:
//!
//! - **Claim with lock-and-skip**: select one queued item and mark it
//!   processing in one transaction, skipping rows locked by concurrent claimers.
//! - **Compare-and-set**: apply a batch status change only when the stored
//!   version still equals the version the caller read.
//!
//! Every other write is a conditional update guarded by the current status of
//! the row it touches.

use super::errors::StoreResult;
use crate::models::{
    Batch, BatchTransition, ConfigurationSnapshot, NewBatch, NewWorkItem, WorkItem, WorkItemResult,
};
use crate::state_machine::{BatchAction, BatchStatus, WorkItemStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A versioned batch status change
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub batch_id: Uuid,
    pub expected_version: i64,
    pub from_status: BatchStatus,
    pub to_status: BatchStatus,
    pub action: BatchAction,
    pub actor: String,
    pub reason: Option<String>,
    /// New value of `started_at` (written as-is)
    pub started_at: Option<DateTime<Utc>>,
    /// New value of `completed_at` (written as-is)
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl StatusUpdate {
    /// Version the batch will carry once the update is applied
    pub fn next_version(&self) -> i64 {
        self.expected_version + 1
    }

    pub fn transition_record(&self) -> BatchTransition {
        BatchTransition {
            batch_id: self.batch_id,
            from_status: self.from_status,
            to_status: self.to_status,
            action: self.action,
            actor: self.actor.clone(),
            reason: self.reason.clone(),
            version: self.next_version(),
            created_at: self.updated_at,
        }
    }
}

/// Result of a compare-and-set
#[derive(Debug, Clone, PartialEq)]
pub enum CasOutcome {
    /// The update was applied; carries the batch as written
    Applied(Batch),
    /// The stored version moved on; carries the batch as currently stored
    Conflict(Batch),
    NotFound,
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Work items (and optionally a new snapshot) replacing a batch's items
#[derive(Debug, Clone)]
pub struct StagedItems {
    /// `None` keeps the existing snapshot
    pub snapshot: Option<ConfigurationSnapshot>,
    pub items: Vec<NewWorkItem>,
    pub queued_at: DateTime<Utc>,
}

/// Which items an operator requeue resets
#[derive(Debug, Clone)]
pub struct RequeueSelection {
    pub statuses: Vec<WorkItemStatus>,
    /// Restrict to these items; `None` selects every matching item of the batch
    pub work_item_ids: Option<Vec<Uuid>>,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequeueOutcome {
    pub cas: CasOutcome,
    pub requeued: u64,
}

/// Parameters of one atomic claim
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    /// Batch statuses whose queued items may be claimed
    pub batch_statuses: Vec<BatchStatus>,
    /// Skip batches that already hold this many PROCESSING items
    pub per_batch_limit: Option<usize>,
    pub claimed_at: DateTime<Utc>,
}

/// Work item reset by recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OrphanedItem {
    pub work_item_id: Uuid,
    pub batch_id: Uuid,
}

/// Work item counts by status for one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressCounts {
    pub by_status: BTreeMap<WorkItemStatus, i64>,
}

impl ProgressCounts {
    pub fn count(&self, status: WorkItemStatus) -> i64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.by_status.values().sum()
    }

    pub fn terminal(&self) -> i64 {
        WorkItemStatus::TERMINAL
            .iter()
            .map(|status| self.count(*status))
            .sum()
    }

    pub fn outstanding(&self) -> i64 {
        self.count(WorkItemStatus::Queued) + self.count(WorkItemStatus::Processing)
    }

    pub fn record(&mut self, status: WorkItemStatus, count: i64) {
        *self.by_status.entry(status).or_insert(0) += count;
    }
}

/// Transactional store of batches, work items and transitions
#[async_trait]
pub trait BatchStore: Send + Sync + std::fmt::Debug {
    async fn insert_batch(&self, batch: NewBatch, created_at: DateTime<Utc>) -> StoreResult<Batch>;

    async fn find_batch(&self, batch_id: Uuid) -> StoreResult<Option<Batch>>;

    async fn list_batches(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>>;

    /// Apply a status change if `expected_version` still matches, recording the transition
    async fn compare_and_set_status(&self, update: StatusUpdate) -> StoreResult<CasOutcome>;

    /// Compare-and-set that also deletes and recreates every work item of the batch
    ///
    /// Resets `total_item_count` to the new item count and `processed_item_count` to zero.
    async fn replace_work_items(
        &self,
        update: StatusUpdate,
        staged: StagedItems,
    ) -> StoreResult<CasOutcome>;

    /// Compare-and-set that also puts the selected terminal items back into the queue
    async fn requeue_work_items(
        &self,
        update: StatusUpdate,
        selection: RequeueSelection,
    ) -> StoreResult<RequeueOutcome>;

    /// Atomically claim one queued item, marking it processing
    async fn claim_next_work_item(&self, request: ClaimRequest) -> StoreResult<Option<WorkItem>>;

    /// Record the collaborator handle of a processing item that has none yet
    async fn record_submission(&self, work_item_id: Uuid, handle: &str) -> StoreResult<bool>;

    /// Move a processing item into a terminal status
    async fn finish_work_item(
        &self,
        work_item_id: Uuid,
        status: WorkItemStatus,
        result: &WorkItemResult,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Reset processing items claimed at or before `cutoff` back to queued
    async fn reset_orphaned_work_items(
        &self,
        cutoff: DateTime<Utc>,
        exclude: &[Uuid],
        queued_at: DateTime<Utc>,
    ) -> StoreResult<Vec<OrphanedItem>>;

    async fn count_work_items(&self, batch_id: Uuid) -> StoreResult<ProgressCounts>;

    /// Recompute `processed_item_count` from the items and return the updated batch
    async fn refresh_processed_count(&self, batch_id: Uuid) -> StoreResult<Option<Batch>>;

    async fn find_work_item(&self, work_item_id: Uuid) -> StoreResult<Option<WorkItem>>;

    async fn list_work_items(&self, batch_id: Uuid) -> StoreResult<Vec<WorkItem>>;

    async fn list_transitions(&self, batch_id: Uuid) -> StoreResult<Vec<BatchTransition>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_counts_aggregates() {
        let mut counts = ProgressCounts::default();
        counts.record(WorkItemStatus::Completed, 4);
        counts.record(WorkItemStatus::Timeout, 1);
        counts.record(WorkItemStatus::Queued, 2);
        counts.record(WorkItemStatus::Processing, 3);
        counts.record(WorkItemStatus::Completed, 1);

        assert_eq!(counts.count(WorkItemStatus::Completed), 5);
        assert_eq!(counts.terminal(), 6);
        assert_eq!(counts.outstanding(), 5);
        assert_eq!(counts.total(), 11);
        assert_eq!(counts.count(WorkItemStatus::Failed), 0);
    }
}
