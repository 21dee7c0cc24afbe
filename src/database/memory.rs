//! # In-Process Batch Store
//!
//! [`BatchStore`] backed by process memory. Every operation runs inside one
//! critical section of a `parking_lot` mutex and never awaits while holding
//! it, which makes each call atomic with respect to concurrent callers: the
//! claim is trivially lock-and-skip and the compare-and-set is exact.
//!
//! Used for embedding the engine without a database and throughout the tests.

use super::errors::StoreResult;
use super::store::{
    BatchStore, CasOutcome, ClaimRequest, OrphanedItem, ProgressCounts, RequeueOutcome,
    RequeueSelection, StagedItems, StatusUpdate,
};
use crate::models::{Batch, BatchTransition, NewBatch, WorkItem, WorkItemResult};
use crate::state_machine::{BatchStatus, WorkItemStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct InMemoryBatchStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    batches: HashMap<Uuid, Batch>,
    items: HashMap<Uuid, WorkItem>,
    transitions: Vec<BatchTransition>,
    last_sequence: i64,
}

impl MemoryState {
    /// Version check and status write shared by every compare-and-set flavour
    fn compare_and_set(&mut self, update: &StatusUpdate) -> CasOutcome {
        let Some(batch) = self.batches.get_mut(&update.batch_id) else {
            return CasOutcome::NotFound;
        };
        if batch.version != update.expected_version {
            return CasOutcome::Conflict(batch.clone());
        }

        batch.status = update.to_status;
        batch.version = update.next_version();
        batch.started_at = update.started_at;
        batch.completed_at = update.completed_at;
        self.transitions.push(update.transition_record());

        CasOutcome::Applied(batch.clone())
    }

    fn counts(&self, batch_id: Uuid) -> ProgressCounts {
        let mut counts = ProgressCounts::default();
        for item in self.items.values().filter(|item| item.batch_id == batch_id) {
            counts.record(item.status, 1);
        }
        counts
    }

    fn refresh_processed(&mut self, batch_id: Uuid) -> Option<Batch> {
        let processed = self.counts(batch_id).terminal();
        let batch = self.batches.get_mut(&batch_id)?;
        batch.processed_item_count = processed;
        Some(batch.clone())
    }
}

fn requeue(item: &mut WorkItem, queued_at: DateTime<Utc>) {
    item.status = WorkItemStatus::Queued;
    item.external_task_handle = None;
    item.queued_at = Some(queued_at);
    item.started_processing_at = None;
    item.completed_at = None;
    item.result = None;
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a work item verbatim
    ///
    /// Lets tests and embedding hosts seed state left behind by a previous
    /// process (for example items stuck in PROCESSING after a crash).
    pub fn put_work_item(&self, item: WorkItem) {
        self.state.lock().items.insert(item.work_item_id, item);
    }

    /// Overwrite a batch verbatim, see [`Self::put_work_item`]
    pub fn put_batch(&self, batch: Batch) {
        let mut state = self.state.lock();
        state.last_sequence = state.last_sequence.max(batch.sequence_number);
        state.batches.insert(batch.batch_id, batch);
    }
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn insert_batch(&self, batch: NewBatch, created_at: DateTime<Utc>) -> StoreResult<Batch> {
        let mut state = self.state.lock();
        state.last_sequence += 1;
        let record = Batch {
            batch_id: Uuid::new_v4(),
            sequence_number: state.last_sequence,
            name: batch.name,
            metadata: batch.metadata,
            status: BatchStatus::Created,
            configuration_snapshot: None,
            total_item_count: 0,
            processed_item_count: 0,
            created_at,
            started_at: None,
            completed_at: None,
            version: 0,
        };
        state.batches.insert(record.batch_id, record.clone());
        Ok(record)
    }

    async fn find_batch(&self, batch_id: Uuid) -> StoreResult<Option<Batch>> {
        Ok(self.state.lock().batches.get(&batch_id).cloned())
    }

    async fn list_batches(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<Batch>> {
        let state = self.state.lock();
        let mut batches: Vec<Batch> = state
            .batches
            .values()
            .filter(|batch| statuses.contains(&batch.status))
            .cloned()
            .collect();
        batches.sort_by_key(|batch| batch.sequence_number);
        Ok(batches)
    }

    async fn compare_and_set_status(&self, update: StatusUpdate) -> StoreResult<CasOutcome> {
        Ok(self.state.lock().compare_and_set(&update))
    }

    async fn replace_work_items(
        &self,
        update: StatusUpdate,
        staged: StagedItems,
    ) -> StoreResult<CasOutcome> {
        let mut state = self.state.lock();
        let batch_id = update.batch_id;
        match state.compare_and_set(&update) {
            CasOutcome::Applied(_) => {}
            other => return Ok(other),
        }

        state.items.retain(|_, item| item.batch_id != batch_id);
        let total = staged.items.len() as i64;
        for new_item in staged.items {
            let item = WorkItem {
                work_item_id: Uuid::new_v4(),
                batch_id,
                document_id: new_item.document_id,
                connection_id: new_item.connection_id,
                prompt_id: new_item.prompt_id,
                payload: new_item.payload,
                status: WorkItemStatus::Queued,
                external_task_handle: None,
                queued_at: Some(staged.queued_at),
                started_processing_at: None,
                completed_at: None,
                result: None,
            };
            state.items.insert(item.work_item_id, item);
        }

        let Some(batch) = state.batches.get_mut(&batch_id) else {
            return Ok(CasOutcome::NotFound);
        };
        if let Some(snapshot) = staged.snapshot {
            batch.configuration_snapshot = Some(snapshot);
        }
        batch.total_item_count = total;
        batch.processed_item_count = 0;
        Ok(CasOutcome::Applied(batch.clone()))
    }

    async fn requeue_work_items(
        &self,
        update: StatusUpdate,
        selection: RequeueSelection,
    ) -> StoreResult<RequeueOutcome> {
        let mut state = self.state.lock();
        let batch_id = update.batch_id;
        match state.compare_and_set(&update) {
            CasOutcome::Applied(_) => {}
            other => return Ok(RequeueOutcome { cas: other, requeued: 0 }),
        }

        let mut requeued = 0;
        for item in state.items.values_mut() {
            let selected = item.batch_id == batch_id
                && selection.statuses.contains(&item.status)
                && selection
                    .work_item_ids
                    .as_ref()
                    .map_or(true, |ids| ids.contains(&item.work_item_id));
            if selected {
                requeue(item, selection.queued_at);
                requeued += 1;
            }
        }

        let cas = match state.refresh_processed(batch_id) {
            Some(batch) => CasOutcome::Applied(batch),
            None => CasOutcome::NotFound,
        };
        Ok(RequeueOutcome { cas, requeued })
    }

    async fn claim_next_work_item(&self, request: ClaimRequest) -> StoreResult<Option<WorkItem>> {
        let mut state = self.state.lock();
        let mut in_flight = HashMap::<Uuid, usize>::new();
        if request.per_batch_limit.is_some() {
            for item in state.items.values() {
                if item.status == WorkItemStatus::Processing {
                    *in_flight.entry(item.batch_id).or_insert(0) += 1;
                }
            }
        }

        let eligible_batches: Vec<Uuid> = state
            .batches
            .values()
            .filter(|batch| request.batch_statuses.contains(&batch.status))
            .filter(|batch| match request.per_batch_limit {
                Some(limit) => in_flight.get(&batch.batch_id).copied().unwrap_or(0) < limit,
                None => true,
            })
            .map(|batch| batch.batch_id)
            .collect();

        let next = state
            .items
            .values()
            .filter(|item| item.status == WorkItemStatus::Queued)
            .filter(|item| eligible_batches.contains(&item.batch_id))
            .min_by_key(|item| (item.queued_at, item.work_item_id))
            .map(|item| item.work_item_id);

        let Some(work_item_id) = next else {
            return Ok(None);
        };
        let Some(item) = state.items.get_mut(&work_item_id) else {
            return Ok(None);
        };
        item.status = WorkItemStatus::Processing;
        item.started_processing_at = Some(request.claimed_at);
        Ok(Some(item.clone()))
    }

    async fn record_submission(&self, work_item_id: Uuid, handle: &str) -> StoreResult<bool> {
        let mut state = self.state.lock();
        match state.items.get_mut(&work_item_id) {
            Some(item)
                if item.status == WorkItemStatus::Processing
                    && item.external_task_handle.is_none() =>
            {
                item.external_task_handle = Some(handle.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_work_item(
        &self,
        work_item_id: Uuid,
        status: WorkItemStatus,
        result: &WorkItemResult,
        completed_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut state = self.state.lock();
        match state.items.get_mut(&work_item_id) {
            Some(item) if item.status == WorkItemStatus::Processing => {
                item.status = status;
                item.result = Some(result.clone());
                item.completed_at = Some(completed_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reset_orphaned_work_items(
        &self,
        cutoff: DateTime<Utc>,
        exclude: &[Uuid],
        queued_at: DateTime<Utc>,
    ) -> StoreResult<Vec<OrphanedItem>> {
        let mut state = self.state.lock();
        let mut reset = Vec::new();
        for item in state.items.values_mut() {
            let orphaned = item.status == WorkItemStatus::Processing
                && item.started_processing_at.map_or(true, |at| at <= cutoff)
                && !exclude.contains(&item.work_item_id);
            if orphaned {
                requeue(item, queued_at);
                reset.push(OrphanedItem {
                    work_item_id: item.work_item_id,
                    batch_id: item.batch_id,
                });
            }
        }
        Ok(reset)
    }

    async fn count_work_items(&self, batch_id: Uuid) -> StoreResult<ProgressCounts> {
        Ok(self.state.lock().counts(batch_id))
    }

    async fn refresh_processed_count(&self, batch_id: Uuid) -> StoreResult<Option<Batch>> {
        Ok(self.state.lock().refresh_processed(batch_id))
    }

    async fn find_work_item(&self, work_item_id: Uuid) -> StoreResult<Option<WorkItem>> {
        Ok(self.state.lock().items.get(&work_item_id).cloned())
    }

    async fn list_work_items(&self, batch_id: Uuid) -> StoreResult<Vec<WorkItem>> {
        let state = self.state.lock();
        let mut items: Vec<WorkItem> = state
            .items
            .values()
            .filter(|item| item.batch_id == batch_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            (&a.document_id, &a.connection_id, &a.prompt_id)
                .cmp(&(&b.document_id, &b.connection_id, &b.prompt_id))
        });
        Ok(items)
    }

    async fn list_transitions(&self, batch_id: Uuid) -> StoreResult<Vec<BatchTransition>> {
        Ok(self
            .state
            .lock()
            .transitions
            .iter()
            .filter(|transition| transition.batch_id == batch_id)
            .cloned()
            .collect())
    }
}
