//! # Completion & Progress Aggregator
//!
//! Recomputes a batch's `processed_item_count` from the store and asks the
//! controller to `complete` the batch once every item is terminal. Counts are
//! always re-read, never incremented, so calling it redundantly (after every
//! item outcome and again on the periodic sweep) is harmless.
//!
//! PAUSED batches keep accruing progress from in-flight items but are only
//! completed after they are resumed.

use crate::constants::{actors, events};
use crate::database::ProgressCounts;
use crate::error::{BatchflowError, BatchflowResult};
use crate::state_machine::{BatchAction, BatchStatus, StateMachineController, TransitionContext};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Progress of one batch after a recompute
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub batch_id: Uuid,
    pub status: BatchStatus,
    pub processed_item_count: i64,
    pub total_item_count: i64,
    pub counts: ProgressCounts,
    /// Whether this recompute moved the batch to COMPLETED
    pub completed: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    controller: StateMachineController,
}

impl ProgressAggregator {
    pub fn new(controller: StateMachineController) -> Self {
        Self { controller }
    }

    /// Refresh the processed count and complete the batch if nothing is left
    pub async fn recompute(&self, batch_id: Uuid) -> BatchflowResult<ProgressSnapshot> {
        let store = self.controller.store();
        let batch = store
            .refresh_processed_count(batch_id)
            .await?
            .ok_or(BatchflowError::BatchNotFound(batch_id))?;
        let counts = store.count_work_items(batch_id).await?;

        let mut status = batch.status;
        let mut completed = false;
        let finished = batch.total_item_count > 0
            && batch.processed_item_count == batch.total_item_count
            && counts.outstanding() == 0;

        if status == BatchStatus::Processing && finished {
            let response = self
                .controller
                .request_with_retry(
                    batch_id,
                    BatchAction::Complete,
                    TransitionContext::system(actors::AGGREGATOR),
                )
                .await?;
            status = response.status;
            completed = response.accepted;
            if completed {
                info!(
                    batch_id = %batch_id,
                    processed = batch.processed_item_count,
                    "✅ Batch completed"
                );
            } else {
                debug!(
                    batch_id = %batch_id,
                    reason = ?response.reason,
                    "Completion request not accepted"
                );
            }
        }

        let snapshot = ProgressSnapshot {
            batch_id,
            status,
            processed_item_count: batch.processed_item_count,
            total_item_count: batch.total_item_count,
            counts,
            completed,
        };

        if let Err(e) = self.controller.events().publish(
            events::BATCH_PROGRESS,
            json!({
                "batch_id": batch_id,
                "status": status,
                "processed_item_count": snapshot.processed_item_count,
                "total_item_count": snapshot.total_item_count,
            }),
        ) {
            warn!(batch_id = %batch_id, error = %e, "Failed to publish progress");
        }

        Ok(snapshot)
    }

    /// Recompute every PROCESSING and PAUSED batch
    ///
    /// A failing batch is logged and skipped so one bad record cannot stall
    /// the sweep.
    pub async fn sweep(&self) -> BatchflowResult<Vec<ProgressSnapshot>> {
        let batches = self
            .controller
            .store()
            .list_batches(&[BatchStatus::Processing, BatchStatus::Paused])
            .await?;

        let mut snapshots = Vec::with_capacity(batches.len());
        for batch in batches {
            match self.recompute(batch.batch_id).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    error!(batch_id = %batch.batch_id, error = %e, "Progress recompute failed");
                }
            }
        }

        let completed = snapshots.iter().filter(|s| s.completed).count();
        if completed > 0 {
            info!(swept = snapshots.len(), completed, "Progress sweep completed batches");
        } else {
            debug!(swept = snapshots.len(), "Progress sweep finished");
        }
        Ok(snapshots)
    }
}
