//! `BatchStore` wrapper that adds latency or failures to chosen calls

use async_trait::async_trait;
use batchflow_core::database::{
    BatchStore, CasOutcome, ClaimRequest, InMemoryBatchStore, OrphanedItem, ProgressCounts,
    RequeueOutcome, RequeueSelection, StagedItems, StatusUpdate, StoreError, StoreResult,
};
use batchflow_core::models::{Batch, BatchTransition, NewBatch, WorkItem, WorkItemResult};
use batchflow_core::state_machine::{BatchStatus, WorkItemStatus};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug)]
pub struct FaultyStore {
    inner: Arc<InMemoryBatchStore>,
    /// Slept before and after every claim, like a database round trip
    claim_latency: Option<Duration>,
    fail_record_submission: bool,
}

impl FaultyStore {
    pub fn new(inner: Arc<InMemoryBatchStore>) -> Self {
        Self {
            inner,
            claim_latency: None,
            fail_record_submission: false,
        }
    }

    pub fn with_claim_latency(mut self, latency: Duration) -> Self {
        self.claim_latency = Some(latency);
        self
    }

    pub fn failing_record_submission(mut self) -> Self {
        self.fail_record_submission = true;
        self
    }
}

#[async_trait]
impl BatchStore for FaultyStore {
    async fn insert_batch(&self, batch: NewBatch, created_at: DateTime<Utc>) -> StoreResult<Batch> {
        self.inner.insert_batch(batch, created_at).await
    }

    async fn find_batch(&self, batch_id: Uuid) -> StoreResult<Option<Batch>> {
        self.inner.find_batch(batch_id).await
    }

    async fn list_batches(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>> {
        self.inner.list_batches(statuses).await
    }

    async fn compare_and_set_status(&self, update: StatusUpdate) -> StoreResult<CasOutcome> {
        self.inner.compare_and_set_status(update).await
    }

    async fn replace_work_items(
        &self,
        update: StatusUpdate,
        staged: StagedItems,
    ) -> StoreResult<CasOutcome> {
        self.inner.replace_work_items(update, staged).await
    }

    async fn requeue_work_items(
        &self,
        update: StatusUpdate,
        selection: RequeueSelection,
    ) -> StoreResult<RequeueOutcome> {
        self.inner.requeue_work_items(update, selection).await
    }

    async fn claim_next_work_item(&self, request: ClaimRequest) -> StoreResult<Option<WorkItem>> {
        if let Some(latency) = self.claim_latency {
            tokio::time::sleep(latency).await;
        }
        let claimed = self.inner.claim_next_work_item(request).await;
        if let Some(latency) = self.claim_latency {
            tokio::time::sleep(latency).await;
        }
        claimed
    }

    async fn record_submission(&self, work_item_id: Uuid, handle: &str) -> StoreResult<bool> {
        if self.fail_record_submission {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.record_submission(work_item_id, handle).await
    }

    async fn finish_work_item(
        &self,
        work_item_id: Uuid,
        status: WorkItemStatus,
        result: &WorkItemResult,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.inner
            .finish_work_item(work_item_id, status, result, completed_at)
            .await
    }

    async fn reset_orphaned_work_items(
        &self,
        cutoff: DateTime<Utc>,
        exclude: &[Uuid],
        queued_at: DateTime<Utc>,
    ) -> StoreResult<Vec<OrphanedItem>> {
        self.inner
            .reset_orphaned_work_items(cutoff, exclude, queued_at)
            .await
    }

    async fn count_work_items(&self, batch_id: Uuid) -> StoreResult<ProgressCounts> {
        self.inner.count_work_items(batch_id).await
    }

    async fn refresh_processed_count(&self, batch_id: Uuid) -> StoreResult<Option<Batch>> {
        self.inner.refresh_processed_count(batch_id).await
    }

    async fn find_work_item(&self, work_item_id: Uuid) -> StoreResult<Option<WorkItem>> {
        self.inner.find_work_item(work_item_id).await
    }

    async fn list_work_items(&self, batch_id: Uuid) -> StoreResult<Vec<WorkItem>> {
        self.inner.list_work_items(batch_id).await
    }

    async fn list_transitions(&self, batch_id: Uuid) -> StoreResult<Vec<BatchTransition>> {
        self.inner.list_transitions(batch_id).await
    }
}
